//! Persisted asymmetric key pairs.
//!
//! Key material is stored as opaque blobs.  Serialization exposes the public
//! key (base64) and never the private key.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rusqlite::types::Value;
use rusqlite::{Connection, Row};
use serde::{Serialize, Serializer};

use crate::error::{StoreError, StoreResult};
use crate::resource::{BASE_COLUMNS_DDL, ResourceKind};

/// Marker type for the `keys` table.
pub struct Keys;

/// Kind fields of a key row.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct KeyFields {
    /// Id of the owning user.
    pub owner_id: i64,
    /// Private key document.  Never serialized.
    #[serde(skip_serializing)]
    pub private_key: Vec<u8>,
    /// Raw public key.
    #[serde(serialize_with = "as_base64")]
    pub public_key: Vec<u8>,
}

fn as_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64.encode(bytes))
}

impl fmt::Debug for KeyFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyFields")
            .field("owner_id", &self.owner_id)
            .field("private_key", &"<redacted>")
            .field("public_key", &BASE64.encode(&self.public_key))
            .finish()
    }
}

impl ResourceKind for Keys {
    type Fields = KeyFields;

    const NAME: &'static str = "keys";
    const VERSION: u32 = 1;
    const COLUMNS: &'static [&'static str] = &["owner_id", "private_key", "public_key"];

    fn migrate(conn: &Connection, from: Option<u32>) -> StoreResult<()> {
        match from {
            None => conn.execute_batch(&format!(
                "CREATE TABLE keys (
                    {BASE_COLUMNS_DDL},
                    owner_id    INTEGER NOT NULL,
                    private_key BLOB NOT NULL,
                    public_key  BLOB NOT NULL
                );
                CREATE INDEX idx_keys_owner ON keys(owner_id);"
            ))?,
            Some(other) => {
                return Err(StoreError::InvalidArgument(format!(
                    "no keys migration from v{other}"
                )));
            }
        }
        Ok(())
    }

    fn read_fields(row: &Row<'_>, offset: usize) -> rusqlite::Result<KeyFields> {
        Ok(KeyFields {
            owner_id: row.get(offset)?,
            private_key: row.get(offset + 1)?,
            public_key: row.get(offset + 2)?,
        })
    }

    fn bind_fields(fields: &KeyFields) -> Vec<Value> {
        vec![
            Value::Integer(fields.owner_id),
            Value::Blob(fields.private_key.clone()),
            Value::Blob(fields.public_key.clone()),
        ]
    }

    fn validate(_conn: &Connection, fields: &KeyFields, _exclude_id: Option<i64>) -> StoreResult<()> {
        if fields.private_key.is_empty() || fields.public_key.is_empty() {
            return Err(StoreError::InvalidArgument(
                "key material must not be empty".into(),
            ));
        }
        Ok(())
    }
}

//! Versioned record snapshots.
//!
//! A [`Record`] is the plain data behind a live resource: the three columns
//! every resource table carries (`id`, `create_time`, `update_time`) plus the
//! kind-specific fields.  Records are merged in place with
//! [`Record::copy_from`], which refuses to cross identities.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{StoreError, StoreResult};

/// Base keys present in every serialized record.  Kind fields never replace
/// them.
pub const BASE_KEYS: [&str; 3] = ["id", "create_time", "update_time"];

/// One persisted row.
///
/// Timestamps are Unix milliseconds assigned by the store; `update_time`
/// strictly increases on every write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record<F> {
    pub id: i64,
    pub create_time: i64,
    pub update_time: i64,
    pub fields: F,
}

impl<F: Clone> Record<F> {
    /// Overwrite every field of `self` (timestamps included) with `other`'s.
    ///
    /// Fails with [`StoreError::IdentityMismatch`] if the ids differ.
    /// `&mut self` and `other` can never alias, so copying a record onto
    /// itself is ruled out by the borrow checker; copying an equal snapshot
    /// leaves the record unchanged.
    pub fn copy_from(&mut self, other: &Record<F>) -> StoreResult<()> {
        if other.id != self.id {
            return Err(StoreError::IdentityMismatch {
                expected: self.id,
                actual: other.id,
            });
        }
        self.create_time = other.create_time;
        self.update_time = other.update_time;
        self.fields.clone_from(&other.fields);
        Ok(())
    }
}

impl<F: Serialize> Record<F> {
    /// Serialize to a key/value map.
    ///
    /// The base keys are written first; kind fields are appended and
    /// silently dropped if they collide with a base key.  Fields must serialize to a
    /// map (a struct) or to nothing (`()`).
    pub fn to_map(&self) -> StoreResult<Map<String, Value>> {
        let mut map = Map::new();
        map.insert("id".into(), Value::from(self.id));
        map.insert("create_time".into(), Value::from(self.create_time));
        map.insert("update_time".into(), Value::from(self.update_time));

        match serde_json::to_value(&self.fields)? {
            Value::Object(fields) => {
                for (key, value) in fields {
                    map.entry(key).or_insert(value);
                }
            }
            Value::Null => {}
            other => {
                return Err(StoreError::InvalidArgument(format!(
                    "record fields must serialize to a map, got {other}"
                )));
            }
        }
        Ok(map)
    }
}

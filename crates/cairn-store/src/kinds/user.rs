//! User accounts.
//!
//! Schema history:
//! - v1: `username` (unique)
//! - v2: adds `display_name`

use rusqlite::types::Value;
use rusqlite::{Connection, Row};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::resource::{BASE_COLUMNS_DDL, ResourceKind};

/// Marker type for the `users` table.
pub struct Users;

/// Kind fields of a user row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserFields {
    /// Unique login name.
    pub username: String,
    /// Optional name for display.
    pub display_name: Option<String>,
}

impl UserFields {
    /// A user with no display name.
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            display_name: None,
        }
    }

    /// Set the display name.
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

impl ResourceKind for Users {
    type Fields = UserFields;

    const NAME: &'static str = "users";
    const VERSION: u32 = 2;
    const COLUMNS: &'static [&'static str] = &["username", "display_name"];

    fn migrate(conn: &Connection, from: Option<u32>) -> StoreResult<()> {
        match from {
            None => conn.execute_batch(&format!(
                "CREATE TABLE users (
                    {BASE_COLUMNS_DDL},
                    username     TEXT NOT NULL UNIQUE,
                    display_name TEXT
                );"
            ))?,
            Some(1) => conn.execute_batch("ALTER TABLE users ADD COLUMN display_name TEXT;")?,
            Some(other) => {
                return Err(StoreError::InvalidArgument(format!(
                    "no users migration from v{other}"
                )));
            }
        }
        Ok(())
    }

    fn read_fields(row: &Row<'_>, offset: usize) -> rusqlite::Result<UserFields> {
        Ok(UserFields {
            username: row.get(offset)?,
            display_name: row.get(offset + 1)?,
        })
    }

    fn bind_fields(fields: &UserFields) -> Vec<Value> {
        vec![
            Value::Text(fields.username.clone()),
            fields
                .display_name
                .clone()
                .map_or(Value::Null, Value::Text),
        ]
    }

    fn validate(conn: &Connection, fields: &UserFields, exclude_id: Option<i64>) -> StoreResult<()> {
        if fields.username.trim().is_empty() {
            return Err(StoreError::InvalidArgument(
                "username must not be empty".into(),
            ));
        }

        let taken: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE username = ?1 AND (?2 IS NULL OR id != ?2))",
            rusqlite::params![fields.username, exclude_id],
            |row| row.get(0),
        )?;
        if taken {
            return Err(StoreError::InvalidArgument(format!(
                "username already taken: {}",
                fields.username
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::db::Database;
    use crate::registry::ManagerRegistry;
    use crate::resource::ResourceManager;

    async fn users() -> Arc<ResourceManager<Users>> {
        let db = Database::open_in_memory().unwrap();
        ResourceManager::<Users>::init(db, &Arc::new(ManagerRegistry::new()), &CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn duplicate_usernames_are_rejected() {
        let users = users().await;
        let token = CancellationToken::new();
        users.create(UserFields::new("alice"), &token).await.unwrap();

        let err = users
            .create(UserFields::new("alice"), &token)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already taken"));
    }

    #[tokio::test]
    async fn empty_username_is_rejected() {
        let users = users().await;
        let err = users
            .create(UserFields::new("   "), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn update_may_keep_its_own_username() {
        let users = users().await;
        let token = CancellationToken::new();
        let alice = users.create(UserFields::new("alice"), &token).await.unwrap();

        users
            .update(&alice, UserFields::new("alice").with_display_name("Alice"), &token)
            .await
            .unwrap();
        assert_eq!(alice.fields().display_name.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn update_cannot_steal_a_username() {
        let users = users().await;
        let token = CancellationToken::new();
        users.create(UserFields::new("alice"), &token).await.unwrap();
        let bob = users.create(UserFields::new("bob"), &token).await.unwrap();

        assert!(users.update(&bob, UserFields::new("alice"), &token).await.is_err());
        assert_eq!(bob.fields().username, "bob");
    }

    #[tokio::test]
    async fn serializes_base_and_user_keys() {
        let users = users().await;
        let alice = users
            .create(
                UserFields::new("alice").with_display_name("Alice"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let map = alice.to_map().unwrap();
        assert_eq!(map["id"], alice.id());
        assert_eq!(map["username"], "alice");
        assert_eq!(map["display_name"], "Alice");
        assert!(map.contains_key("create_time"));
    }
}

//! # cairn-store
//!
//! Storage engine for Cairn.
//!
//! Provides SQLite-backed persistence with WAL mode and mmap, a per-schema
//! migration ledger, and identity-cached resources: every persisted row is
//! materialized as at most one live [`Resource`] per manager.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  ManagerRegistry (weak, random u64 keys)      │
//! ├──────────────────────────────────────────────┤
//! │  ResourceManager<K>  identity cache (Weak)    │
//! │  ResourceStream<K>   keyset-paged cursor      │
//! ├──────────────────────────────────────────────┤
//! │  ResourceKind: users, keys                    │
//! │  Migrations (_schemas ledger, per-step tx)    │
//! ├──────────────────────────────────────────────┤
//! │  Database (rusqlite WAL + mmap)               │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use cairn_store::{Database, ManagerRegistry, ResourceManager, UserFields, Users};
//!
//! let db = Database::open("data/cairn.db")?;
//! let registry = Arc::new(ManagerRegistry::new());
//! let users = ResourceManager::<Users>::init(db, &registry, &token).await?;
//! let alice = users.create(UserFields::new("alice"), &token).await?;
//! ```

pub mod db;
pub mod error;
pub mod kinds;
pub mod migration;
pub mod record;
pub mod registry;
pub mod resource;
pub mod stream;

// ── re-exports ───────────────────────────────────────────────────────

pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use kinds::{KeyFields, Keys, UserFields, Users};
pub use migration::MigrationReport;
pub use record::Record;
pub use registry::{ManagedSchema, ManagerRegistry};
pub use resource::{Resource, ResourceKind, ResourceManager};
pub use stream::{DEFAULT_PAGE_SIZE, ResourceStream};

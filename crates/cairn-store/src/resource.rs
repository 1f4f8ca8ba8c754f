//! Identity-cached resources over versioned SQLite tables.
//!
//! A [`ResourceKind`] describes one table: its name, declared schema version,
//! kind-specific columns, migration steps, and validation.  A
//! [`ResourceManager`] owns that table and materializes rows as live
//! [`Resource`] objects.
//!
//! ## Identity
//!
//! Every load path (create, load by id, update, streaming) funnels rows
//! through [`ResourceManager::as_resource`], which keeps at most one live
//! `Resource` per id.  The cache holds weak references only; when the last
//! `Arc<Resource>` is dropped the resource removes its own entry, and a later
//! load materializes a fresh instance.
//!
//! The cache lock is never held while an `Arc<Resource>` could be dropped,
//! since dropping one re-enters the cache to remove its entry.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use cairn_kernel::cancel::until_cancelled;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Map;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::migration::{self, MigrationReport};
use crate::record::Record;
use crate::registry::{ManagedSchema, ManagerRegistry};
use crate::stream::ResourceStream;

/// Column definitions every resource table starts with.
pub const BASE_COLUMNS_DDL: &str = "id INTEGER PRIMARY KEY AUTOINCREMENT, \
     create_time INTEGER NOT NULL, \
     update_time INTEGER NOT NULL";

// ═══════════════════════════════════════════════════════════════════════
//  ResourceKind
// ═══════════════════════════════════════════════════════════════════════

/// Describes one kind of persisted resource.
///
/// Implementors are usually zero-sized marker types.
pub trait ResourceKind: Send + Sync + 'static {
    /// Kind-specific fields of a row.
    type Fields: Clone + fmt::Debug + Serialize + Send + Sync + 'static;

    /// Table name, also the key in the schema ledger.
    const NAME: &'static str;

    /// Declared schema version.  Bump it and add a step to [`migrate`](Self::migrate)
    /// to change the table.
    const VERSION: u32;

    /// Kind-specific columns, in the order [`read_fields`](Self::read_fields)
    /// and [`bind_fields`](Self::bind_fields) use.
    const COLUMNS: &'static [&'static str];

    /// Create the table at [`VERSION`](Self::VERSION) (`from == None`) or
    /// upgrade it from `from` to `from + 1`.
    fn migrate(conn: &Connection, from: Option<u32>) -> StoreResult<()>;

    /// Read the kind fields starting at column `offset`.
    fn read_fields(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self::Fields>;

    /// Values for [`COLUMNS`](Self::COLUMNS), in order.
    fn bind_fields(fields: &Self::Fields) -> Vec<Value>;

    /// Reject invalid field values before they are written.  `exclude_id`
    /// is the id of the row being updated, if any.
    fn validate(_conn: &Connection, _fields: &Self::Fields, _exclude_id: Option<i64>) -> StoreResult<()> {
        Ok(())
    }
}

fn select_sql<K: ResourceKind>() -> String {
    let mut columns = String::from("id, create_time, update_time");
    for column in K::COLUMNS {
        columns.push_str(", ");
        columns.push_str(column);
    }
    format!("SELECT {columns} FROM {}", K::NAME)
}

fn read_record<K: ResourceKind>(row: &Row<'_>) -> rusqlite::Result<Record<K::Fields>> {
    Ok(Record {
        id: row.get(0)?,
        create_time: row.get(1)?,
        update_time: row.get(2)?,
        fields: K::read_fields(row, 3)?,
    })
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Map a UNIQUE/CHECK violation to a caller error.
fn constraint_error(kind: &'static str, err: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(ref failure, _) = err
        && failure.code == rusqlite::ErrorCode::ConstraintViolation
    {
        return StoreError::InvalidArgument(format!("{kind}: constraint violated: {err}"));
    }
    StoreError::Sqlite(err)
}

// ═══════════════════════════════════════════════════════════════════════
//  Resource
// ═══════════════════════════════════════════════════════════════════════

/// A live, identity-stable resource.
///
/// All holders of the same `Arc<Resource>` observe the same snapshot; the
/// manager refreshes it in place.
pub struct Resource<K: ResourceKind> {
    id: i64,
    data: RwLock<Record<K::Fields>>,
    manager: Weak<ResourceManager<K>>,
}

impl<K: ResourceKind> Resource<K> {
    pub(crate) fn new(data: Record<K::Fields>, manager: Weak<ResourceManager<K>>) -> Self {
        Self {
            id: data.id,
            data: RwLock::new(data),
            manager,
        }
    }

    /// Stable identifier.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// A copy of the current snapshot.
    pub fn data(&self) -> Record<K::Fields> {
        self.read().clone()
    }

    /// A copy of the current kind fields.
    pub fn fields(&self) -> K::Fields {
        self.read().fields.clone()
    }

    /// Creation time, Unix milliseconds.
    pub fn create_time(&self) -> i64 {
        self.read().create_time
    }

    /// Last update time, Unix milliseconds.
    pub fn update_time(&self) -> i64 {
        self.read().update_time
    }

    /// Inspect the snapshot without cloning it.
    pub fn with_data<R>(&self, f: impl FnOnce(&Record<K::Fields>) -> R) -> R {
        f(&self.read())
    }

    /// Serialize the current snapshot.
    pub fn to_map(&self) -> StoreResult<Map<String, serde_json::Value>> {
        self.read().to_map()
    }

    /// Replace the snapshot through [`Record::copy_from`].
    ///
    /// Snapshots older than the current one are ignored so a slow reader
    /// can never roll a resource back.
    pub(crate) fn update_data(&self, other: &Record<K::Fields>) -> StoreResult<()> {
        let mut current = self.data.write().unwrap_or_else(PoisonError::into_inner);
        if other.id == current.id && other.update_time < current.update_time {
            return Ok(());
        }
        current.copy_from(other)
    }

    pub(crate) fn belongs_to(&self, manager: &ResourceManager<K>) -> bool {
        std::ptr::eq(self.manager.as_ptr(), manager)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Record<K::Fields>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K: ResourceKind> fmt::Debug for Resource<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("kind", &K::NAME)
            .field("data", &*self.read())
            .finish()
    }
}

impl<K: ResourceKind> Drop for Resource<K> {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.forget(self.id);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  ResourceManager
// ═══════════════════════════════════════════════════════════════════════

/// Owns one resource table and its identity cache.
pub struct ResourceManager<K: ResourceKind> {
    db: Database,
    registry: Arc<ManagerRegistry>,
    registry_id: u64,
    cache: Mutex<HashMap<i64, Weak<Resource<K>>>>,
    me: Weak<Self>,
}

impl<K: ResourceKind> ResourceManager<K> {
    /// Migrate the table to `K::VERSION` and register a new manager.
    ///
    /// A failed migration step is returned as [`StoreError::Migration`] and
    /// no manager is created.
    pub async fn init(
        db: Database,
        registry: &Arc<ManagerRegistry>,
        token: &CancellationToken,
    ) -> StoreResult<Arc<Self>> {
        let report: MigrationReport = until_cancelled(
            token,
            db.execute(|conn| migration::run(conn, K::NAME, K::VERSION, K::migrate)),
        )
        .await??;

        let registry_id = registry.entries().reserve()?;
        let manager = Arc::new_cyclic(|me| Self {
            db,
            registry: Arc::clone(registry),
            registry_id,
            cache: Mutex::new(HashMap::new()),
            me: me.clone(),
        });
        let erased: Arc<dyn ManagedSchema> = manager.clone();
        registry.entries().bind(registry_id, Arc::downgrade(&erased));

        info!(
            schema = K::NAME,
            version = K::VERSION,
            registry_id,
            ?report,
            "resource manager ready"
        );
        Ok(manager)
    }

    /// Schema name.
    pub fn name(&self) -> &'static str {
        K::NAME
    }

    /// Declared schema version.
    pub fn version(&self) -> u32 {
        K::VERSION
    }

    /// Key in the [`ManagerRegistry`].
    pub fn registry_id(&self) -> u64 {
        self.registry_id
    }

    /// The backing database.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Return the live resource for `record.id`, refreshed with `record`,
    /// or materialize and cache a new one.
    pub fn as_resource(&self, record: Record<K::Fields>) -> StoreResult<Arc<Resource<K>>> {
        let id = record.id;
        let live = {
            let mut cache = self.lock_cache();
            let existing = cache.get(&id).and_then(Weak::upgrade);
            match existing {
                Some(live) => live,
                None => {
                    let resource = Arc::new(Resource::new(record, self.me.clone()));
                    cache.insert(id, Arc::downgrade(&resource));
                    debug!(schema = K::NAME, id, "resource materialized");
                    return Ok(resource);
                }
            }
        };
        live.update_data(&record)?;
        debug!(schema = K::NAME, id, "resource refreshed");
        Ok(live)
    }

    /// Cache-only lookup.  `None` if the resource is not currently live.
    pub fn get_from_memory(&self, id: i64) -> Option<Arc<Resource<K>>> {
        self.lock_cache().get(&id).and_then(Weak::upgrade)
    }

    /// Number of live cached resources.
    pub fn cached_count(&self) -> usize {
        self.lock_cache()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Validate and insert a new row, returning its live resource.
    ///
    /// Returns `Cancelled` without a trace in the table if `token` fires
    /// before the insert commits.
    #[instrument(skip(self, fields, token), fields(schema = K::NAME))]
    pub async fn create(
        &self,
        fields: K::Fields,
        token: &CancellationToken,
    ) -> StoreResult<Arc<Resource<K>>> {
        let insert = {
            let placeholders: Vec<String> =
                (0..K::COLUMNS.len()).map(|i| format!("?{}", i + 2)).collect();
            format!(
                "INSERT INTO {} (create_time, update_time, {}) VALUES (?1, ?1, {})",
                K::NAME,
                K::COLUMNS.join(", "),
                placeholders.join(", ")
            )
        };

        let record = self
            .db
            .transact_cancellable(token, move |tx| {
                K::validate(tx, &fields, None)?;
                let now = now_millis();
                let mut params = vec![Value::Integer(now)];
                params.extend(K::bind_fields(&fields));
                tx.execute(&insert, rusqlite::params_from_iter(params))
                    .map_err(|e| constraint_error(K::NAME, e))?;
                Ok(Record {
                    id: tx.last_insert_rowid(),
                    create_time: now,
                    update_time: now,
                    fields,
                })
            })
            .await?;

        debug!(schema = K::NAME, id = record.id, "resource created");
        self.as_resource(record)
    }

    /// Read row `id` and materialize it.  `Ok(None)` if no such row exists.
    #[instrument(skip(self, token), fields(schema = K::NAME))]
    pub async fn load(
        &self,
        id: i64,
        token: &CancellationToken,
    ) -> StoreResult<Option<Arc<Resource<K>>>> {
        let sql = format!("{} WHERE id = ?1", select_sql::<K>());
        let record = until_cancelled(
            token,
            self.db.execute(move |conn| {
                Ok(conn
                    .query_row(&sql, rusqlite::params![id], read_record::<K>)
                    .optional()?)
            }),
        )
        .await??;

        record.map(|record| self.as_resource(record)).transpose()
    }

    /// Write new field values for `resource` and refresh it in place.
    ///
    /// `update_time` always moves forward, even for writes within the same
    /// millisecond.  A token that fires before commit leaves both the row
    /// and the live resource untouched.
    #[instrument(skip(self, resource, fields, token), fields(schema = K::NAME, id = resource.id()))]
    pub async fn update(
        &self,
        resource: &Arc<Resource<K>>,
        fields: K::Fields,
        token: &CancellationToken,
    ) -> StoreResult<Arc<Resource<K>>> {
        if !resource.belongs_to(self) {
            return Err(StoreError::InvalidArgument(format!(
                "resource {} is not managed by this {} manager",
                resource.id(),
                K::NAME
            )));
        }

        let id = resource.id();
        let update = {
            let assignments: Vec<String> = K::COLUMNS
                .iter()
                .enumerate()
                .map(|(i, column)| format!("{column} = ?{}", i + 2))
                .collect();
            format!(
                "UPDATE {} SET update_time = MAX(?1, update_time + 1), {} WHERE id = ?{}",
                K::NAME,
                assignments.join(", "),
                K::COLUMNS.len() + 2
            )
        };
        let select = format!("{} WHERE id = ?1", select_sql::<K>());

        let record = self
            .db
            .transact_cancellable(token, move |tx| {
                K::validate(tx, &fields, Some(id))?;
                let mut params = vec![Value::Integer(now_millis())];
                params.extend(K::bind_fields(&fields));
                params.push(Value::Integer(id));
                let changed = tx
                    .execute(&update, rusqlite::params_from_iter(params))
                    .map_err(|e| constraint_error(K::NAME, e))?;
                if changed == 0 {
                    return Err(StoreError::NotFound { entity: K::NAME, id });
                }
                Ok(tx.query_row(&select, rusqlite::params![id], read_record::<K>)?)
            })
            .await?;

        self.as_resource(record)
    }

    /// Forward-only stream over every row in id order, `page_size` rows at
    /// a time.
    pub fn stream(self: &Arc<Self>, page_size: usize) -> ResourceStream<K> {
        ResourceStream::new(Arc::clone(self), page_size)
    }

    /// Read up to `limit` rows with `id > after`, in id order.
    pub(crate) async fn read_page(
        &self,
        after: i64,
        limit: usize,
        token: &CancellationToken,
    ) -> StoreResult<Vec<Record<K::Fields>>> {
        let sql = format!("{} WHERE id > ?1 ORDER BY id LIMIT ?2", select_sql::<K>());
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        until_cancelled(
            token,
            self.db.execute(move |conn| {
                let mut stmt = conn.prepare_cached(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params![after, limit], read_record::<K>)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            }),
        )
        .await?
    }

    /// Drop the cache entry for `id` if nothing holds the resource anymore.
    fn forget(&self, id: i64) {
        let mut cache = self.lock_cache();
        if cache.get(&id).is_some_and(|weak| weak.strong_count() == 0) {
            cache.remove(&id);
            debug!(schema = K::NAME, id, "resource released");
        }
    }

    fn lock_cache(&self) -> MutexGuard<'_, HashMap<i64, Weak<Resource<K>>>> {
        // Cache updates never panic mid-way, so a poisoned guard is still
        // consistent.
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K: ResourceKind> ManagedSchema for ResourceManager<K> {
    fn name(&self) -> &'static str {
        K::NAME
    }

    fn version(&self) -> u32 {
        K::VERSION
    }

    fn registry_id(&self) -> u64 {
        self.registry_id
    }

    fn cached_count(&self) -> usize {
        ResourceManager::cached_count(self)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

impl<K: ResourceKind> fmt::Debug for ResourceManager<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceManager")
            .field("schema", &K::NAME)
            .field("version", &K::VERSION)
            .field("registry_id", &self.registry_id)
            .finish()
    }
}

impl<K: ResourceKind> Drop for ResourceManager<K> {
    fn drop(&mut self) {
        self.registry.entries().unregister(self.registry_id);
        debug!(schema = K::NAME, registry_id = self.registry_id, "resource manager dropped");
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

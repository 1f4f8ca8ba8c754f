//! SQLite database setup with WAL mode, mmap, and performance pragmas.
//!
//! The [`Database`] struct wraps a `rusqlite::Connection` behind an
//! `Arc<Mutex<>>` and exposes async methods that use
//! `tokio::task::spawn_blocking` to avoid blocking the async runtime.
//! Every call checks the connection out exclusively for its duration, so one
//! closure is one logical unit of work; [`Database::transact`] additionally
//! wraps that unit in a transaction, and
//! [`Database::transact_cancellable`] only commits it while a token is live.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, Transaction};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};

/// Thread-safe handle to a SQLite database.
///
/// All read/write operations go through [`Database::execute`] which
/// dispatches onto the blocking thread pool via `tokio::task::spawn_blocking`.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    cursors: Arc<AtomicUsize>,
}

impl Database {
    /// Open (or create) a database at `path` and apply performance pragmas.
    ///
    /// This call blocks briefly (file I/O), so call it during startup before
    /// entering the main async loop, or wrap it in `spawn_blocking` yourself.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening database");

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::InvalidArgument(format!(
                    "cannot create database directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let conn = Connection::open(path)?;
        Self::apply_pragmas(&conn)?;
        Ok(Self::from_connection(conn))
    }

    /// Create an in-memory database -- useful for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        debug!("opening in-memory database");

        let conn = Connection::open_in_memory()?;
        Self::apply_pragmas(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            cursors: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Execute an arbitrary closure against the connection on the blocking pool.
    ///
    /// This is the primary way to interact with the database from async code.
    /// The closure receives a `&Connection` and must return a `StoreResult<T>`.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let count: i64 = db.execute(|conn| {
    ///     let count = conn.query_row("SELECT count(*) FROM users", [], |row| row.get(0))?;
    ///     Ok(count)
    /// }).await?;
    /// ```
    pub async fn execute<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
            f(&conn)
        })
        .await?
    }

    /// Execute a mutable closure on the blocking pool.
    ///
    /// The closure receives a `&mut Connection` so you can call
    /// `conn.transaction()` and friends.
    pub async fn execute_mut<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
            f(&mut conn)
        })
        .await?
    }

    /// Run `work` inside a transaction.
    ///
    /// Commits when `work` returns `Ok`; any error rolls the whole unit back
    /// (the transaction is dropped uncommitted).
    pub async fn transact<F, T>(&self, work: F) -> StoreResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.execute_mut(move |conn| {
            let tx = conn.transaction()?;
            let out = work(&tx)?;
            tx.commit()?;
            Ok(out)
        })
        .await
    }

    /// Run `work` inside a transaction that commits only if `token` is
    /// still live.
    ///
    /// The token is checked once the connection is checked out and again
    /// right before commit; a fired token rolls the unit back and yields
    /// [`StoreError::Cancelled`].  The call waits for the blocking unit to
    /// finish, so its result always matches what was persisted.
    pub async fn transact_cancellable<F, T>(
        &self,
        token: &CancellationToken,
        work: F,
    ) -> StoreResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        if token.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let token = token.clone();
        self.execute_mut(move |conn| {
            if token.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            let tx = conn.transaction()?;
            let out = work(&tx)?;
            if token.is_cancelled() {
                debug!("transaction cancelled before commit, rolling back");
                return Err(StoreError::Cancelled);
            }
            tx.commit()?;
            Ok(out)
        })
        .await
    }

    /// Execute one or more non-query statements.
    pub async fn execute_batch(&self, sql: impl Into<String>) -> StoreResult<()> {
        let sql = sql.into();
        self.execute(move |conn| {
            conn.execute_batch(&sql)?;
            Ok(())
        })
        .await
    }

    /// Number of streaming cursors currently holding a lease on this database.
    pub fn open_cursors(&self) -> usize {
        self.cursors.load(Ordering::SeqCst)
    }

    /// Take a cursor lease.  The count drops again when the lease is dropped.
    pub(crate) fn lease_cursor(&self) -> CursorLease {
        let open = self.cursors.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(open, "cursor opened");
        CursorLease {
            cursors: Arc::clone(&self.cursors),
        }
    }

    // ── pragmas ──────────────────────────────────────────────────────

    /// Apply all performance pragmas to a fresh connection.
    fn apply_pragmas(conn: &Connection) -> StoreResult<()> {
        debug!("applying SQLite performance pragmas");

        // WAL mode: concurrent readers, non-blocking writes.
        conn.pragma_update(None, "journal_mode", "WAL")?;

        // NORMAL sync is safe with WAL -- we only lose the last transaction
        // on a power failure, not corruption.
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        // 256 MiB memory-mapped I/O.
        conn.pragma_update(None, "mmap_size", 268_435_456_i64)?;

        // Negative value means KiB: -64000 = ~62 MiB page cache.
        conn.pragma_update(None, "cache_size", -64_000_i32)?;

        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        // Busy timeout so concurrent writers wait instead of failing immediately.
        conn.pragma_update(None, "busy_timeout", 5_000_i32)?;

        info!("database pragmas applied (WAL, mmap 256MiB, cache 62MiB)");
        Ok(())
    }
}

/// Accounting handle for one open cursor.
pub(crate) struct CursorLease {
    cursors: Arc<AtomicUsize>,
}

impl Drop for CursorLease {
    fn drop(&mut self) {
        let open = self.cursors.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!(open, "cursor released");
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_works() {
        let db = Database::open_in_memory().unwrap();
        let version: String = db
            .execute(|conn| {
                let v: String =
                    conn.query_row("SELECT sqlite_version()", [], |row| row.get(0))?;
                Ok(v)
            })
            .await
            .unwrap();
        assert!(!version.is_empty());
    }

    #[tokio::test]
    async fn open_on_disk_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cairn.db");
        let db = Database::open(&path).unwrap();
        db.execute_batch("CREATE TABLE t (x INTEGER)").await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn transact_commits_on_success() {
        let db = Database::open_in_memory().unwrap();
        db.execute_batch("CREATE TABLE t (x INTEGER)").await.unwrap();

        db.transact(|tx| {
            tx.execute("INSERT INTO t (x) VALUES (1)", [])?;
            tx.execute("INSERT INTO t (x) VALUES (2)", [])?;
            Ok(())
        })
        .await
        .unwrap();

        let count: i64 = db
            .execute(|conn| Ok(conn.query_row("SELECT count(*) FROM t", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn transact_rolls_back_on_error() {
        let db = Database::open_in_memory().unwrap();
        db.execute_batch("CREATE TABLE t (x INTEGER)").await.unwrap();

        let result: StoreResult<()> = db
            .transact(|tx| {
                tx.execute("INSERT INTO t (x) VALUES (1)", [])?;
                Err(StoreError::InvalidArgument("abort".into()))
            })
            .await;
        assert!(result.is_err());

        let count: i64 = db
            .execute(|conn| Ok(conn.query_row("SELECT count(*) FROM t", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn cancellation_before_commit_rolls_back() {
        let db = Database::open_in_memory().unwrap();
        db.execute_batch("CREATE TABLE t (x INTEGER)").await.unwrap();
        let token = CancellationToken::new();

        let fired = token.clone();
        let result = db
            .transact_cancellable(&token, move |tx| {
                tx.execute("INSERT INTO t (x) VALUES (1)", [])?;
                fired.cancel();
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(StoreError::Cancelled)));

        let count: i64 = db
            .execute(|conn| Ok(conn.query_row("SELECT count(*) FROM t", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn live_token_commits() {
        let db = Database::open_in_memory().unwrap();
        db.execute_batch("CREATE TABLE t (x INTEGER)").await.unwrap();

        let id = db
            .transact_cancellable(&CancellationToken::new(), |tx| {
                tx.execute("INSERT INTO t (x) VALUES (7)", [])?;
                Ok(tx.last_insert_rowid())
            })
            .await
            .unwrap();
        assert_eq!(id, 1);
    }

    #[test]
    fn cursor_leases_are_counted() {
        let db = Database::open_in_memory().unwrap();
        let a = db.lease_cursor();
        let b = db.lease_cursor();
        assert_eq!(db.open_cursors(), 2);
        drop(a);
        assert_eq!(db.open_cursors(), 1);
        drop(b);
        assert_eq!(db.open_cursors(), 0);
    }
}

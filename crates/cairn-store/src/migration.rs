//! Per-schema migration ledger.
//!
//! Every resource kind owns its table and declares a schema version.  The
//! version last applied for each schema is tracked in a `_schemas` table so
//! migrations are idempotent and each step runs exactly once:
//!
//! - first boot: the step runner is called with `None` and creates the table
//!   directly at the declared version;
//! - later boots: it is called with `Some(v)` for every `v` in
//!   `stored..declared`, ascending, each call applying only the delta from
//!   `v` to `v + 1`.
//!
//! Each step runs in its own transaction together with the ledger update, so
//! a failed step leaves the stored version at the last good step.

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

/// What [`run`] did to a schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationReport {
    /// The table did not exist and was created at `version`.
    Created { version: u32 },
    /// The table was upgraded step by step.
    Upgraded { from: u32, to: u32 },
    /// Stored and declared versions already matched.  No DDL ran.
    UpToDate { version: u32 },
}

/// Bring schema `name` up to `declared`, calling `step` for each transition.
///
/// `step` receives `None` to create the table from scratch or `Some(v)` to
/// upgrade it from `v` to `v + 1`.
pub fn run<S>(conn: &Connection, name: &'static str, declared: u32, step: S) -> StoreResult<MigrationReport>
where
    S: Fn(&Connection, Option<u32>) -> StoreResult<()>,
{
    ensure_ledger(conn)?;

    let report = match stored_version(conn, name)? {
        None => {
            apply(conn, name, declared, || step(conn, None))?;
            MigrationReport::Created { version: declared }
        }
        Some(stored) if stored == declared => {
            debug!(schema = name, version = stored, "schema up to date");
            MigrationReport::UpToDate { version: stored }
        }
        Some(stored) if stored > declared => {
            return Err(StoreError::Migration {
                schema: name,
                version: stored,
                message: format!("stored version {stored} is newer than declared version {declared}"),
            });
        }
        Some(stored) => {
            for from in stored..declared {
                apply(conn, name, from + 1, || step(conn, Some(from)))?;
            }
            MigrationReport::Upgraded {
                from: stored,
                to: declared,
            }
        }
    };

    info!(schema = name, ?report, "schema migrated");
    Ok(report)
}

/// Return the recorded version of `name`, or `None` if it was never created.
pub fn stored_version(conn: &Connection, name: &str) -> StoreResult<Option<u32>> {
    ensure_ledger(conn)?;
    let version = conn
        .query_row(
            "SELECT version FROM _schemas WHERE name = ?1",
            rusqlite::params![name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version)
}

// ── internals ────────────────────────────────────────────────────────

/// Create the `_schemas` bookkeeping table if it does not exist.
fn ensure_ledger(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _schemas (
            name       TEXT PRIMARY KEY,
            version    INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );",
    )
    .map_err(|e| StoreError::Migration {
        schema: "_schemas",
        version: 0,
        message: format!("failed to create _schemas table: {e}"),
    })
}

/// Apply one step inside a transaction and record `target` in the ledger.
fn apply<F>(conn: &Connection, schema: &'static str, target: u32, step: F) -> StoreResult<()>
where
    F: FnOnce() -> StoreResult<()>,
{
    info!(schema, version = target, "applying schema step");

    // `conn.transaction()` needs `&mut Connection`; the step runner only
    // holds a shared borrow, so the transaction is managed by hand.
    conn.execute_batch("BEGIN IMMEDIATE;")
        .map_err(|e| StoreError::Migration {
            schema,
            version: target,
            message: format!("failed to begin transaction: {e}"),
        })?;

    let result = (|| -> StoreResult<()> {
        step().map_err(|e| match e {
            err @ StoreError::Migration { .. } => err,
            other => StoreError::Migration {
                schema,
                version: target,
                message: other.to_string(),
            },
        })?;

        let now = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "INSERT INTO _schemas (name, version, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET version = excluded.version, updated_at = excluded.updated_at",
            rusqlite::params![schema, target, now],
        )
        .map_err(|e| StoreError::Migration {
            schema,
            version: target,
            message: format!("failed to record schema version: {e}"),
        })?;

        Ok(())
    })();

    match &result {
        Ok(()) => {
            conn.execute_batch("COMMIT;")
                .map_err(|e| StoreError::Migration {
                    schema,
                    version: target,
                    message: format!("failed to commit: {e}"),
                })?;
            info!(schema, version = target, "schema step applied");
        }
        Err(err) => {
            warn!(schema, version = target, %err, "schema step failed, rolling back");
            let _ = conn.execute_batch("ROLLBACK;");
        }
    }

    result
}

// ── tests ────────────────────────────────────────────────────────────

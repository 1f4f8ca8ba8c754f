//! Integration tests for the cairn-store crate.
//!
//! These tests exercise the full resource lifecycle including migrations,
//! identity caching under concurrency, streaming, and the manager registry
//! against real SQLite databases on disk (via tempfile).

use std::sync::Arc;

use cairn_store::migration;
use cairn_store::{
    Database, KeyFields, Keys, ManagerRegistry, Record, ResourceManager, StoreResult, UserFields,
    Users,
};
use tokio_util::sync::CancellationToken;

async fn schema_snapshot(db: &Database) -> Vec<(String, String)> {
    db.execute(|conn| {
        let mut stmt = conn.prepare(
            "SELECT name, COALESCE(sql, '') FROM sqlite_master ORDER BY type, name",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
    .await
    .unwrap()
}

async fn ledger(db: &Database, name: &'static str) -> (u32, i64) {
    db.execute(move |conn| {
        Ok(conn.query_row(
            "SELECT version, updated_at FROM _schemas WHERE name = ?1",
            [name],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?)
    })
    .await
    .unwrap()
}

// ═══════════════════════════════════════════════════════════════════════
//  Migrations
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn init_twice_performs_no_further_ddl() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cairn.db");
    let registry = Arc::new(ManagerRegistry::new());
    let token = CancellationToken::new();

    let db = Database::open(&path).unwrap();
    let users = ResourceManager::<Users>::init(db.clone(), &registry, &token)
        .await
        .unwrap();
    let before = schema_snapshot(&db).await;
    let ledger_before = ledger(&db, "users").await;
    drop(users);

    let reopened = Database::open(&path).unwrap();
    let _users = ResourceManager::<Users>::init(reopened.clone(), &registry, &token)
        .await
        .unwrap();

    assert_eq!(schema_snapshot(&reopened).await, before);
    assert_eq!(ledger(&reopened, "users").await, ledger_before);
    assert_eq!(ledger_before.0, 2);
}

#[tokio::test]
async fn v1_users_table_is_upgraded_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cairn.db");

    // Lay down the v1 table as an older build would have.
    let db = Database::open(&path).unwrap();
    db.execute(|conn| {
        migration::run(conn, "users", 1, |c, _| {
            c.execute_batch(
                "CREATE TABLE users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    create_time INTEGER NOT NULL,
                    update_time INTEGER NOT NULL,
                    username TEXT NOT NULL UNIQUE
                );
                INSERT INTO users (create_time, update_time, username) VALUES (1, 1, 'legacy');",
            )?;
            Ok(())
        })?;
        Ok(())
    })
    .await
    .unwrap();

    let users = ResourceManager::<Users>::init(
        db.clone(),
        &Arc::new(ManagerRegistry::new()),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(ledger(&db, "users").await.0, 2);
    let legacy = users
        .load(1, &CancellationToken::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(legacy.fields(), UserFields::new("legacy"));
}

#[tokio::test]
async fn failed_migration_yields_no_manager() {
    let db = Database::open_in_memory().unwrap();
    // A conflicting table under the same name makes the create step fail.
    db.execute_batch("CREATE TABLE keys (id INTEGER PRIMARY KEY);")
        .await
        .unwrap();
    let registry = Arc::new(ManagerRegistry::new());

    let err = ResourceManager::<Keys>::init(db.clone(), &registry, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, cairn_store::StoreError::Migration { .. }));
    assert!(registry.is_empty());
}

// ═══════════════════════════════════════════════════════════════════════
//  Identity
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_loads_share_one_instance() {
    let db = Database::open_in_memory().unwrap();
    let users = ResourceManager::<Users>::init(
        db,
        &Arc::new(ManagerRegistry::new()),
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    let token = CancellationToken::new();
    let id = users
        .create(UserFields::new("alice"), &token)
        .await
        .unwrap()
        .id();
    assert!(users.get_from_memory(id).is_none());

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let users = Arc::clone(&users);
        let token = token.clone();
        tasks.push(tokio::spawn(async move {
            users.load(id, &token).await.unwrap().unwrap()
        }));
    }
    let mut loaded = Vec::new();
    for task in tasks {
        loaded.push(task.await.unwrap());
    }

    for resource in &loaded[1..] {
        assert!(Arc::ptr_eq(resource, &loaded[0]));
    }
    assert_eq!(users.cached_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_materialization_converges() {
    let db = Database::open_in_memory().unwrap();
    let users = ResourceManager::<Users>::init(
        db,
        &Arc::new(ManagerRegistry::new()),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let mut tasks = Vec::new();
    for i in 0..32 {
        let users = Arc::clone(&users);
        tasks.push(tokio::task::spawn_blocking(move || -> StoreResult<_> {
            users.as_resource(Record {
                id: 77,
                create_time: 1,
                update_time: 1,
                fields: UserFields::new(format!("writer-{i}")),
            })
        }));
    }
    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap().unwrap());
    }

    let expected = handles[0].fields();
    for handle in &handles {
        assert!(Arc::ptr_eq(handle, &handles[0]));
        assert_eq!(handle.fields(), expected);
    }

    drop(handles);
    assert!(users.get_from_memory(77).is_none());
}

// ═══════════════════════════════════════════════════════════════════════
//  Streaming + registry
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn stream_over_persisted_rows_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cairn.db");
    let token = CancellationToken::new();

    {
        let keys = ResourceManager::<Keys>::init(
            Database::open(&path).unwrap(),
            &Arc::new(ManagerRegistry::new()),
            &token,
        )
        .await
        .unwrap();
        for owner in 1..=10 {
            keys.create(
                KeyFields {
                    owner_id: owner,
                    private_key: vec![owner as u8; 8],
                    public_key: vec![owner as u8; 4],
                },
                &token,
            )
            .await
            .unwrap();
        }
    }

    let db = Database::open(&path).unwrap();
    let keys = ResourceManager::<Keys>::init(db.clone(), &Arc::new(ManagerRegistry::new()), &token)
        .await
        .unwrap();

    let mut stream = keys.stream(4);
    let mut owners = Vec::new();
    while let Some(key) = stream.next(&token).await.unwrap() {
        assert!(stream.buffered() < 4);
        owners.push(key.fields().owner_id);
    }
    assert_eq!(owners, (1..=10).collect::<Vec<_>>());
    assert_eq!(db.open_cursors(), 0);
}

#[tokio::test]
async fn registry_tracks_managers_by_liveness() {
    let db = Database::open_in_memory().unwrap();
    let registry = Arc::new(ManagerRegistry::new());
    let token = CancellationToken::new();

    let users = ResourceManager::<Users>::init(db.clone(), &registry, &token)
        .await
        .unwrap();
    let keys = ResourceManager::<Keys>::init(db.clone(), &registry, &token)
        .await
        .unwrap();
    assert_ne!(users.registry_id(), keys.registry_id());

    let mut names: Vec<&str> = registry.list().iter().map(|m| m.name()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["keys", "users"]);

    let _alice = users.create(UserFields::new("alice"), &token).await.unwrap();
    let found = registry.get(users.registry_id()).unwrap();
    assert_eq!(found.cached_count(), 1);
    assert_eq!(found.version(), 2);
    drop(found);

    drop(keys);
    assert_eq!(registry.len(), 1);
    assert!(registry.find::<Keys>().is_none());
    assert!(registry.find::<Users>().is_some());
}

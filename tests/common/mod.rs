#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Once;
use tempfile::TempDir;
use tickdb::storage::Param;
use tickdb::{Database, RowMapper, StoreConfig};

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        tickdb::logging::init_test_logging();
    });
}

pub fn test_db() -> Database {
    init_test_logging();
    Database::open_in_memory(StoreConfig::default()).expect("Failed to create test database")
}

pub fn test_db_with_config(config: StoreConfig) -> Database {
    init_test_logging();
    Database::open_in_memory(config).expect("Failed to create test database")
}

pub fn test_db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("data").join("tickdb.db")
}

pub fn test_db_with_dir() -> (Database, TempDir) {
    init_test_logging();
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = Database::open(test_db_path(&dir), StoreConfig::default())
        .expect("Failed to create test database");
    (db, dir)
}

/// Create `users` and `users_archive`, each holding one row with id 1.
pub fn seed_users(db: &Database) {
    db.transaction(|tx| {
        tx.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
             CREATE TABLE users_archive (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
             INSERT INTO users (id, name) VALUES (1, 'steve');
             INSERT INTO users_archive (id, name) VALUES (1, 'old steve');",
        )
    })
    .expect("seed users");
}

pub fn count_rows(db: &Database, table: &str) -> i64 {
    db.query_one_uncached(
        &format!("SELECT COUNT(*) FROM {table}"),
        &[],
        &RowMapper::<i64>::first_column(),
    )
    .expect("count rows")
    .unwrap_or(0)
}

/// Change a user's name without going through the cache-aware write path.
pub fn rename_behind_cache(db: &Database, id: i64, name: &str) {
    let name = name.to_string();
    db.engine()
        .submit(move |conn| {
            conn.execute(
                "UPDATE users SET name = ?1 WHERE id = ?2",
                rusqlite::params![name, id],
            )?;
            Ok(())
        })
        .expect("rename behind cache");
}

/// Wait for everything queued on the worker so far to finish.
pub fn drain(db: &Database) {
    db.engine().submit(|_| Ok(())).expect("drain worker");
}

pub fn id(value: i64) -> Param {
    Param::i64(value)
}

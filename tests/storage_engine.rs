mod common;

use common::{count_rows, seed_users, test_db, test_db_path, test_db_with_dir};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tickdb::storage::Param;
use tickdb::{Database, RowMapper, StoreConfig};

#[test]
fn writes_from_many_threads_are_serialized() {
    let db = test_db();
    db.execute("CREATE TABLE events (seq INTEGER, thread INTEGER)", &[])
        .expect("create");

    let handles: Vec<_> = (0..8_i64)
        .map(|t| {
            let db = db.clone();
            thread::spawn(move || {
                for seq in 0..25_i64 {
                    db.execute(
                        "INSERT INTO events (seq, thread) VALUES (?, ?)",
                        &[Param::i64(seq), Param::i64(t)],
                    )
                    .expect("insert");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer thread");
    }

    assert_eq!(count_rows(&db, "events"), 200);

    // Each thread's own inserts landed in the order it issued them.
    let per_thread = RowMapper::<i64>::first_column();
    for t in 0..8_i64 {
        let seqs = db
            .query_uncached(
                "SELECT seq FROM events WHERE thread = ? ORDER BY rowid",
                &[Param::i64(t)],
                &per_thread,
            )
            .expect("query");
        assert_eq!(seqs, (0..25).collect::<Vec<_>>());
    }
}

#[test]
fn async_units_complete_in_submission_order() {
    let db = test_db();
    db.execute("CREATE TABLE log (n INTEGER)", &[]).expect("create");

    let pending: Vec<_> = (0..10_i64)
        .map(|n| db.execute_async("INSERT INTO log (n) VALUES (?)", &[Param::i64(n)]))
        .collect();
    for handle in &pending {
        assert_eq!(handle.wait().expect("insert"), 1);
    }

    let rows = db
        .query_uncached("SELECT n FROM log ORDER BY rowid", &[], &RowMapper::<i64>::first_column())
        .expect("query");
    assert_eq!(rows, (0..10).collect::<Vec<_>>());
}

#[test]
fn file_store_applies_baseline_pragmas_and_persists() {
    let (db, dir) = test_db_with_dir();
    let (journal, sync, fk): (String, i64, i64) = db
        .engine()
        .submit(|conn| {
            let journal = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
            let sync = conn.query_row("PRAGMA synchronous", [], |row| row.get(0))?;
            let fk = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
            Ok((journal, sync, fk))
        })
        .expect("pragmas");
    assert_eq!(journal.to_lowercase(), "wal");
    assert_eq!(sync, 1, "NORMAL");
    assert_eq!(fk, 1);

    seed_users(&db);
    db.close();

    let reopened = Database::open(test_db_path(&dir), StoreConfig::default()).expect("reopen");
    assert_eq!(count_rows(&reopened, "users"), 1);
}

#[test]
fn foreign_keys_are_enforced() {
    let db = test_db();
    db.transaction(|tx| {
        tx.execute_batch(
            "CREATE TABLE parent (id INTEGER PRIMARY KEY);
             CREATE TABLE child (id INTEGER PRIMARY KEY, parent_id INTEGER REFERENCES parent(id));",
        )
    })
    .expect("schema");

    let err = db
        .execute("INSERT INTO child (id, parent_id) VALUES (1, 99)", &[])
        .unwrap_err();
    assert_eq!(err.code(), "SQLITE_ERROR");
}

#[test]
fn cancelled_unit_is_skipped_and_reported_as_interrupted() {
    let db = test_db();
    seed_users(&db);

    let blocker = db.engine().submit_async(|_| {
        thread::sleep(Duration::from_millis(50));
        Ok(())
    });
    let doomed = db.execute_async("DELETE FROM users", &[]);
    doomed.cancel();
    blocker.wait().expect("blocker");

    let err = doomed.wait().unwrap_err();
    assert!(err.is_interrupted());
    assert_eq!(count_rows(&db, "users"), 1);
}

#[test]
fn closed_store_rejects_every_handle() {
    let db = test_db();
    let other = db.clone();
    db.close();
    let err = other.execute("SELECT 1", &[]).unwrap_err();
    assert_eq!(err.code(), "WORKER_UNAVAILABLE");
    assert!(!err.is_retryable());
}

#[test]
fn handles_are_shareable_across_threads() {
    let db = Arc::new(test_db());
    seed_users(&db);
    let names = RowMapper::<String>::column("name");
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let db = Arc::clone(&db);
            let names = names.clone();
            thread::spawn(move || {
                db.query("SELECT name FROM users WHERE id = ?", &[Param::i64(1)], &names)
                    .expect("query")
            })
        })
        .collect();
    for reader in readers {
        assert_eq!(reader.join().expect("reader"), vec!["steve".to_string()]);
    }
}

mod common;

use common::{drain, id, rename_behind_cache, seed_users, test_db};
use proptest::prelude::*;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use tickdb::cache::{Clock, ManualClock};
use tickdb::storage::{GuardedContext, StoreLocation};
use tickdb::{Database, RowMapper, StoreConfig, StoreError};

const BY_ID: &str = "SELECT name FROM users WHERE id = ?";

fn db_with_clock(config: StoreConfig) -> (Database, Arc<ManualClock>) {
    common::init_test_logging();
    let clock = Arc::new(ManualClock::new());
    let db = Database::start(
        StoreLocation::Memory,
        config,
        Arc::new(GuardedContext::new()),
        Arc::clone(&clock) as Arc<dyn Clock>,
    )
    .expect("start store");
    seed_users(&db);
    (db, clock)
}

fn counting_mapper(loads: &Arc<AtomicUsize>) -> RowMapper<String> {
    let loads = Arc::clone(loads);
    RowMapper::new(move |row| {
        loads.fetch_add(1, Ordering::SeqCst);
        row.get(0)
    })
}

#[test]
fn refresh_ahead_serves_cached_value_then_reloads() {
    let (db, clock) = db_with_clock(StoreConfig::default());
    let names = RowMapper::<String>::first_column();

    assert_eq!(db.query(BY_ID, &[id(1)], &names).unwrap(), vec!["steve"]);
    rename_behind_cache(&db, 1, "bob");

    // Fresh but past refresh_after: old value now, reload queued.
    clock.advance(Duration::from_secs(11));
    assert_eq!(db.query(BY_ID, &[id(1)], &names).unwrap(), vec!["steve"]);
    drain(&db);

    assert_eq!(db.query(BY_ID, &[id(1)], &names).unwrap(), vec!["bob"]);
    assert_eq!(db.cache_stats().refreshes, 1);
}

#[test]
fn expired_entry_is_served_stale_while_refreshing() {
    let (db, clock) = db_with_clock(StoreConfig::default());
    let names = RowMapper::<String>::first_column();

    db.query(BY_ID, &[id(1)], &names).unwrap();
    rename_behind_cache(&db, 1, "bob");
    clock.advance(Duration::from_secs(31));

    assert_eq!(db.query(BY_ID, &[id(1)], &names).unwrap(), vec!["steve"]);
    drain(&db);
    assert_eq!(db.query(BY_ID, &[id(1)], &names).unwrap(), vec!["bob"]);
}

#[test]
fn expired_entry_without_stale_serving_is_a_miss() {
    let config = StoreConfig {
        cache_serve_stale_while_refreshing: false,
        ..StoreConfig::default()
    };
    let (db, clock) = db_with_clock(config);
    let names = RowMapper::<String>::first_column();

    db.query(BY_ID, &[id(1)], &names).unwrap();
    rename_behind_cache(&db, 1, "bob");
    clock.advance(Duration::from_secs(31));

    assert_eq!(db.query(BY_ID, &[id(1)], &names).unwrap(), vec!["bob"]);
    assert_eq!(db.cache_stats().misses, 2);
}

#[test]
fn concurrent_misses_share_one_load() {
    let db = test_db();
    seed_users(&db);
    let loads = Arc::new(AtomicUsize::new(0));
    let names = counting_mapper(&loads);

    // Hold the worker so every caller misses before the load can run.
    let blocker = db.engine().submit_async(|_| {
        thread::sleep(Duration::from_millis(50));
        Ok(())
    });
    let readers: Vec<_> = (0..8)
        .map(|_| {
            let db = db.clone();
            let names = names.clone();
            thread::spawn(move || db.query(BY_ID, &[id(1)], &names).expect("query"))
        })
        .collect();
    for reader in readers {
        assert_eq!(reader.join().expect("reader"), vec!["steve".to_string()]);
    }
    blocker.wait().expect("blocker");

    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert_eq!(db.query_cache().len(), 1);
}

#[test]
fn write_to_one_table_keeps_similarly_named_tables_cached() {
    let db = test_db();
    seed_users(&db);
    let names = RowMapper::<String>::first_column();
    db.query("SELECT name FROM users", &[], &names).unwrap();
    db.query("SELECT name FROM users_archive", &[], &names).unwrap();
    assert_eq!(db.query_cache().len(), 2);

    db.execute("INSERT INTO users (id, name) VALUES (2, 'ann')", &[])
        .unwrap();
    assert_eq!(db.query_cache().len(), 1);
    assert_eq!(
        db.query("SELECT name FROM users_archive", &[], &names).unwrap(),
        vec!["old steve"]
    );
    assert_eq!(db.query("SELECT name FROM users", &[], &names).unwrap().len(), 2);
}

#[test]
fn write_target_is_taken_from_the_leading_clause() {
    let db = test_db();
    seed_users(&db);
    db.execute("ALTER TABLE users ADD COLUMN note TEXT", &[]).unwrap();
    let names = RowMapper::<String>::first_column();
    db.query(BY_ID, &[id(1)], &names).unwrap();
    db.query("SELECT name FROM users_archive", &[], &names).unwrap();

    db.execute(
        "UPDATE users SET name = 'bob', note = 'insert into users_archive' WHERE id = 1",
        &[],
    )
    .unwrap();
    assert_eq!(db.query_cache().len(), 1);
    assert_eq!(db.query(BY_ID, &[id(1)], &names).unwrap(), vec!["bob"]);
}

#[test]
fn unrecognized_writes_clear_everything() {
    let db = test_db();
    seed_users(&db);
    let names = RowMapper::<String>::first_column();
    db.query("SELECT name FROM users", &[], &names).unwrap();
    db.query("SELECT name FROM users_archive", &[], &names).unwrap();

    db.execute("CREATE INDEX idx_users_name ON users (name)", &[])
        .unwrap();
    assert!(db.query_cache().is_empty());
}

#[test]
fn rolled_back_transaction_invalidates_nothing() {
    let db = test_db();
    seed_users(&db);
    let names = RowMapper::<String>::first_column();
    db.query(BY_ID, &[id(1)], &names).unwrap();

    let err = db
        .transaction(|tx| {
            tx.execute("UPDATE users SET name = 'bob' WHERE id = 1", &[])?;
            Err::<(), _>(StoreError::callback("changed my mind"))
        })
        .unwrap_err();
    assert_eq!(err.code(), "CALLBACK_FAILED");

    assert_eq!(db.query_cache().len(), 1);
    assert_eq!(db.query(BY_ID, &[id(1)], &names).unwrap(), vec!["steve"]);
}

#[test]
fn reads_inside_a_rolled_back_transaction_are_never_cached() {
    let db = test_db();
    seed_users(&db);
    let names = RowMapper::<String>::first_column();

    let inner = db.clone();
    let reader = names.clone();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let err = db
        .transaction(move |tx| {
            tx.execute("UPDATE users SET name = 'phantom' WHERE id = 1", &[])?;
            *sink.lock().unwrap() = inner.query(BY_ID, &[id(1)], &reader)?;
            Err::<(), _>(StoreError::callback("changed my mind"))
        })
        .unwrap_err();
    assert_eq!(err.code(), "CALLBACK_FAILED");

    // The transaction saw its own write, but nothing it read was kept.
    assert_eq!(*seen.lock().unwrap(), vec!["phantom"]);
    assert!(db.query_cache().is_empty());
    assert_eq!(db.query(BY_ID, &[id(1)], &names).unwrap(), vec!["steve"]);
}

#[test]
fn transaction_reads_bypass_entries_cached_before_it() {
    let db = test_db();
    seed_users(&db);
    let names = RowMapper::<String>::first_column();
    db.query(BY_ID, &[id(1)], &names).unwrap();

    let inner = db.clone();
    let reader = names.clone();
    let seen = db
        .transaction(move |tx| {
            tx.execute("UPDATE users SET name = 'bob' WHERE id = 1", &[])?;
            inner.query(BY_ID, &[id(1)], &reader)
        })
        .unwrap();
    assert_eq!(seen, vec!["bob"]);
    assert_eq!(db.query(BY_ID, &[id(1)], &names).unwrap(), vec!["bob"]);
}

#[test]
fn committed_transaction_invalidates_after_commit() {
    let db = test_db();
    seed_users(&db);
    let names = RowMapper::<String>::first_column();
    db.query(BY_ID, &[id(1)], &names).unwrap();
    db.query("SELECT name FROM users_archive", &[], &names).unwrap();

    let cache = db.query_cache().clone();
    db.transaction(move |tx| {
        tx.execute("UPDATE users SET name = 'bob' WHERE id = 1", &[])?;
        // Nothing is dropped until the commit succeeds.
        assert_eq!(cache.len(), 2);
        Ok(())
    })
    .unwrap();

    assert_eq!(db.query_cache().len(), 1);
    assert_eq!(db.query(BY_ID, &[id(1)], &names).unwrap(), vec!["bob"]);
}

#[test]
fn async_query_completes_with_rows() {
    let db = test_db();
    seed_users(&db);
    let names = RowMapper::<String>::first_column();
    let pending = db.query_async(BY_ID, &[id(1)], &names);
    assert_eq!(pending.wait().unwrap(), vec!["steve"]);
    assert!(db.query_async(BY_ID, &[id(1)], &names).is_done());
}

#[test]
fn explicit_invalidation() {
    let db = test_db();
    seed_users(&db);
    let names = RowMapper::<String>::first_column();
    db.query("SELECT name FROM users", &[], &names).unwrap();
    db.query("SELECT name FROM users_archive", &[], &names).unwrap();

    db.invalidate_table("USERS_ARCHIVE");
    assert_eq!(db.query_cache().len(), 1);
    db.invalidate_all();
    assert!(db.query_cache().is_empty());
}

#[test]
fn disabled_cache_always_reads_through() {
    let config = StoreConfig {
        cache_max_size: 0,
        ..StoreConfig::default()
    };
    let db = common::test_db_with_config(config);
    seed_users(&db);
    let names = RowMapper::<String>::first_column();

    db.query(BY_ID, &[id(1)], &names).unwrap();
    rename_behind_cache(&db, 1, "bob");
    assert_eq!(db.query(BY_ID, &[id(1)], &names).unwrap(), vec!["bob"]);
    assert!(db.query_cache().is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn invalidation_matches_table_names_as_whole_words(table in "[a-z]{3,8}") {
        prop_assume!(table != "select");
        let db = test_db();
        let words = RowMapper::<String>::first_column();
        let exact = format!("SELECT '{table}'");
        let suffixed = format!("SELECT '{table}_archive'");
        let prefixed = format!("SELECT 'x{table}'");
        for sql in [&exact, &suffixed, &prefixed] {
            db.query(sql, &[], &words).unwrap();
        }
        prop_assert_eq!(db.query_cache().len(), 3);

        db.invalidate_table(&table.to_uppercase());
        prop_assert_eq!(db.query_cache().len(), 2);

        // The dropped statement reloads; the others are still hits.
        let misses = db.cache_stats().misses;
        db.query(&suffixed, &[], &words).unwrap();
        db.query(&prefixed, &[], &words).unwrap();
        prop_assert_eq!(db.cache_stats().misses, misses);
        db.query(&exact, &[], &words).unwrap();
        prop_assert_eq!(db.cache_stats().misses, misses + 1);
    }
}

mod common;

use common::{count_rows, seed_users, test_db, test_db_with_config};
use std::thread;
use std::time::Duration;
use tickdb::storage::{BlockingOptions, MainThreadPolicy, Param, TimeoutBehavior};
use tickdb::{RowMapper, StoreConfig, StoreError};

fn occupy_worker(db: &tickdb::Database, for_ms: u64) -> tickdb::Pending<()> {
    db.engine().submit_async(move |_| {
        thread::sleep(Duration::from_millis(for_ms));
        Ok(())
    })
}

#[test]
fn disallow_refuses_calls_from_the_guarded_context_only() {
    let db = test_db();
    seed_users(&db);
    db.guarded_context().designate_current();
    let options = BlockingOptions::guarded_default().with_policy(MainThreadPolicy::Disallow);

    let err = db
        .execute_blocking("DELETE FROM users", &[], &options)
        .unwrap_err();
    assert!(matches!(err, StoreError::GuardedContextDisallowed { .. }));
    assert_eq!(err.code(), "GUARDED_CONTEXT_DISALLOWED");
    assert_eq!(count_rows(&db, "users"), 1);

    // Another thread is not the guarded context.
    let other = db.clone();
    let changed = thread::spawn(move || other.execute_blocking("DELETE FROM users", &[], &options))
        .join()
        .expect("worker thread")
        .expect("delete");
    assert_eq!(changed, Some(1));
}

#[test]
fn fail_open_returns_absent_and_cancels_the_queued_write() {
    let db = test_db();
    seed_users(&db);
    db.guarded_context().designate_current();
    let options = BlockingOptions::guarded_default()
        .with_timeout(Duration::from_millis(5))
        .with_timeout_behavior(TimeoutBehavior::FailOpen);

    let sleeper = occupy_worker(&db, 50);
    let result = db
        .execute_blocking("INSERT INTO users (id, name) VALUES (2, 'late')", &[], &options)
        .expect("fail open");
    assert_eq!(result, None);

    sleeper.wait().expect("sleeper");
    db.guarded_context().clear();
    assert_eq!(count_rows(&db, "users"), 1);
}

#[test]
fn throw_and_fail_closed_raise_timeout() {
    let db = test_db();
    seed_users(&db);
    for behavior in [TimeoutBehavior::Throw, TimeoutBehavior::FailClosed] {
        let options = BlockingOptions::guarded_default()
            .with_timeout(Duration::from_millis(5))
            .with_timeout_behavior(behavior);
        let sleeper = occupy_worker(&db, 50);
        let err = db
            .execute_blocking("UPDATE users SET name = name WHERE id = 1", &[], &options)
            .unwrap_err();
        assert_eq!(err.code(), "TIMEOUT");
        assert!(err.is_retryable());
        sleeper.wait().expect("sleeper");
    }
}

#[test]
fn fast_calls_succeed_under_tight_guarded_defaults() {
    let db = test_db();
    seed_users(&db);
    db.guarded_context().designate_current();
    let names = RowMapper::<String>::first_column();

    // First read fills the cache; the second is a hit and never reaches the worker.
    let first = db
        .query_blocking(
            "SELECT name FROM users WHERE id = ?",
            &[Param::i64(1)],
            &names,
            &BlockingOptions::unguarded(),
        )
        .expect("load");
    let second = db
        .query_one_blocking(
            "SELECT name FROM users WHERE id = ?",
            &[Param::i64(1)],
            &names,
            &db.guarded_options(),
        )
        .expect("hit");
    assert_eq!(first, Some(vec!["steve".to_string()]));
    assert_eq!(second.as_deref(), Some("steve"));
}

#[test]
fn cache_hits_are_still_refused_under_disallow() {
    let db = test_db();
    seed_users(&db);
    let names = RowMapper::<String>::first_column();
    db.query("SELECT name FROM users", &[], &names).expect("warm");

    db.guarded_context().designate_current();
    let options = BlockingOptions::guarded_default().with_policy(MainThreadPolicy::Disallow);
    let err = db
        .query_blocking("SELECT name FROM users", &[], &names, &options)
        .unwrap_err();
    assert_eq!(err.code(), "GUARDED_CONTEXT_DISALLOWED");
}

#[test]
fn plain_calls_ignore_the_guard() {
    let config = StoreConfig {
        main_thread_policy: MainThreadPolicy::Disallow,
        ..StoreConfig::default()
    };
    let db = test_db_with_config(config);
    seed_users(&db);
    db.guarded_context().designate_current();

    assert_eq!(db.guarded_options().main_thread_policy, MainThreadPolicy::Disallow);
    assert_eq!(
        db.execute("UPDATE users SET name = 'bob' WHERE id = 1", &[])
            .expect("plain execute"),
        1
    );
}

#[test]
fn slow_calls_under_warn_still_return_their_value() {
    let db = test_db();
    seed_users(&db);
    db.guarded_context().designate_current();
    let options = BlockingOptions::guarded_default()
        .with_timeout(Duration::from_secs(2))
        .with_slow_warn_threshold(Duration::from_millis(1));

    let sleeper = occupy_worker(&db, 20);
    let changed = db
        .execute_blocking("UPDATE users SET name = 'slow' WHERE id = 1", &[], &options)
        .expect("slow update");
    assert_eq!(changed, Some(1));
    sleeper.wait().expect("sleeper");
}

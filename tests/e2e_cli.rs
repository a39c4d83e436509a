//! End-to-end tests for the `tickdb` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        Self {
            dir: TempDir::new().expect("tempdir"),
        }
    }

    fn db(&self) -> PathBuf {
        self.dir.path().join("store.db")
    }

    fn tickdb(&self) -> Command {
        let mut cmd = Command::cargo_bin("tickdb").expect("tickdb binary");
        cmd.current_dir(self.dir.path())
            .env_remove("RUST_LOG")
            .env_remove("TICKDB_CACHE_TTL");
        cmd
    }

    fn run(&self, args: &[&str]) -> Command {
        let mut cmd = self.tickdb();
        cmd.arg(self.db()).args(args);
        cmd
    }
}

#[test]
fn e2e_exec_then_query_round_trip() {
    let ws = Workspace::new();
    ws.run(&["exec", "CREATE TABLE pets (id INTEGER PRIMARY KEY, name TEXT, weight REAL)"])
        .assert()
        .success()
        .stdout("0\n");
    ws.run(&["exec", "INSERT INTO pets (id, name, weight) VALUES (?, ?, ?)", "1", "rex", "12.5"])
        .assert()
        .success()
        .stdout("1\n");

    let output = ws
        .run(&["query", "SELECT id, name, weight FROM pets WHERE id = ?", "1"])
        .output()
        .expect("run query");
    assert!(output.status.success());
    let rows: Value = serde_json::from_slice(&output.stdout).expect("json rows");
    assert_eq!(rows, serde_json::json!([{"id": 1, "name": "rex", "weight": 12.5}]));
}

#[test]
fn e2e_query_compact_output() {
    let ws = Workspace::new();
    ws.run(&["exec", "CREATE TABLE t (n INTEGER)"]).assert().success();
    ws.run(&["exec", "INSERT INTO t (n) VALUES (?)", "-4"])
        .assert()
        .success();
    ws.run(&["query", "SELECT n FROM t", "--compact"])
        .assert()
        .success()
        .stdout("[{\"n\":-4}]\n");
}

#[test]
fn e2e_version_of_new_store_is_zero() {
    let ws = Workspace::new();
    ws.run(&["version"]).assert().success().stdout("0\n");
    ws.run(&["exec", "PRAGMA user_version = 7"]).assert().success();
    ws.run(&["version"]).assert().success().stdout("7\n");
}

#[test]
fn e2e_config_reflects_every_layer() {
    let ws = Workspace::new();
    fs::write(
        ws.dir.path().join("tickdb.yaml"),
        "guardedContextTimeout: 40ms\ncache:\n  ttl: 2s\n  max-size: 10\n",
    )
    .expect("write config");

    let output = ws
        .tickdb()
        .env("TICKDB_CACHE_MAX_SIZE", "20")
        .args(["--set", "main_thread_policy=disallow"])
        .arg(ws.db())
        .arg("config")
        .output()
        .expect("run config");
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let config: Value = serde_json::from_slice(&output.stdout).expect("json config");
    assert_eq!(config["guarded_context_timeout"], 40);
    assert_eq!(config["cache_ttl"], 2000);
    assert_eq!(config["cache_max_size"], 20);
    assert_eq!(config["main_thread_policy"], "disallow");
    assert_eq!(config["journal_mode"], "WAL");
}

#[test]
fn e2e_explicit_config_file_must_exist() {
    let ws = Workspace::new();
    ws.tickdb()
        .args(["--config", "missing.yaml"])
        .arg(ws.db())
        .arg("config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("CONFIG_ERROR"));
}

#[test]
fn e2e_invalid_config_value_is_rejected() {
    let ws = Workspace::new();
    ws.tickdb()
        .args(["--set", "timeout-behavior=sometimes"])
        .arg(ws.db())
        .arg("version")
        .assert()
        .failure()
        .stderr(predicate::str::contains("CONFIG_ERROR"));
}

#[test]
fn e2e_sql_errors_fail_with_code() {
    let ws = Workspace::new();
    ws.run(&["query", "SELECT * FROM nowhere"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("SQLITE_ERROR"));
}

#[test]
fn e2e_memory_store_is_accepted() {
    let ws = Workspace::new();
    ws.tickdb()
        .args([":memory:", "query", "SELECT 1 + 1 AS two", "--compact"])
        .assert()
        .success()
        .stdout("[{\"two\":2}]\n");
}

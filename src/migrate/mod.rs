//! Version-gated schema migrations.
//!
//! The persisted version lives in `PRAGMA user_version`. A [`Migrator`]
//! holds steps sorted by target version and applies, in one transaction,
//! every step above the current version, bumping the version after each.
//! A failing step rolls the whole run back.

use crate::error::{ExecutionError, Result, StoreError};
use crate::storage::tx::Tx;
use crate::storage::Database;
use rusqlite::Connection;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

type StepFn = dyn Fn(&mut Tx<'_>) -> Result<()> + Send + Sync;

/// One schema change, taking the store to `target_version`.
#[derive(Clone)]
pub struct MigrationStep {
    target_version: u32,
    action: Arc<StepFn>,
}

impl MigrationStep {
    pub fn new<F>(target_version: u32, action: F) -> Self
    where
        F: Fn(&mut Tx<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            target_version,
            action: Arc::new(action),
        }
    }

    /// A step that runs a batch of SQL.
    pub fn sql(target_version: u32, batch: impl Into<String>) -> Self {
        let batch = batch.into();
        Self::new(target_version, move |tx| tx.execute_batch(&batch))
    }

    #[must_use]
    pub const fn target_version(&self) -> u32 {
        self.target_version
    }
}

impl fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationStep")
            .field("target_version", &self.target_version)
            .finish_non_exhaustive()
    }
}

/// Outcome of one [`Migrator::migrate`] run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub from_version: u32,
    pub to_version: u32,
    pub applied: Vec<u32>,
    /// The store was new and was stamped at the latest version without
    /// running any step.
    pub stamped_fresh: bool,
}

impl MigrationReport {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.from_version == self.to_version
    }
}

#[derive(Debug, Clone)]
pub struct Migrator {
    steps: Vec<MigrationStep>,
    anchor_table: Option<String>,
}

impl Migrator {
    /// # Errors
    ///
    /// Returns a configuration error if a step targets version 0 or two
    /// steps target the same version.
    pub fn new(mut steps: Vec<MigrationStep>) -> Result<Self> {
        steps.sort_by_key(MigrationStep::target_version);
        if steps.first().is_some_and(|step| step.target_version == 0) {
            return Err(StoreError::Config(
                "migration steps must target versions above 0".to_string(),
            ));
        }
        if let Some(pair) = steps
            .windows(2)
            .find(|pair| pair[0].target_version == pair[1].target_version)
        {
            return Err(StoreError::Config(format!(
                "duplicate migration step for version {}",
                pair[0].target_version
            )));
        }
        Ok(Self {
            steps,
            anchor_table: None,
        })
    }

    /// Treat a version-0 store without `table` as a fresh install: stamp it
    /// at the latest version instead of replaying every step. The caller's
    /// bootstrap DDL is expected to create the current schema.
    #[must_use]
    pub fn with_anchor_table(mut self, table: impl Into<String>) -> Self {
        self.anchor_table = Some(table.into());
        self
    }

    #[must_use]
    pub fn latest_version(&self) -> u32 {
        self.steps.last().map_or(0, MigrationStep::target_version)
    }

    #[must_use]
    pub fn steps(&self) -> &[MigrationStep] {
        &self.steps
    }

    /// Bring `db` up to the latest version. Running it again once complete
    /// applies nothing.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::Migration` naming the failing step (the
    /// persisted version is unchanged), or a storage error.
    pub fn migrate(&self, db: &Database) -> Result<MigrationReport> {
        let steps = self.steps.clone();
        let anchor = self.anchor_table.clone();
        let latest = self.latest_version();
        db.transaction(move |tx| apply_steps(tx, &steps, anchor.as_deref(), latest))
    }
}

fn apply_steps(
    tx: &mut Tx<'_>,
    steps: &[MigrationStep],
    anchor: Option<&str>,
    latest: u32,
) -> Result<MigrationReport> {
    let current = tx.user_version()?;
    let mut report = MigrationReport {
        from_version: current,
        to_version: current,
        applied: Vec::new(),
        stamped_fresh: false,
    };

    if current == 0 && latest > 0 {
        if let Some(anchor) = anchor {
            if !table_exists(tx.connection(), anchor)? {
                tx.set_user_version(latest)?;
                info!(version = latest, anchor, "new store; stamped latest schema version");
                report.to_version = latest;
                report.stamped_fresh = true;
                return Ok(report);
            }
        }
    }

    for step in steps.iter().filter(|step| step.target_version > current) {
        let version = step.target_version;
        (step.action)(tx).map_err(|source| ExecutionError::Migration {
            version,
            source: Box::new(source),
        })?;
        tx.set_user_version(version)?;
        info!(version, "applied migration");
        report.applied.push(version);
        report.to_version = version;
    }

    if report.applied.is_empty() {
        debug!(version = current, "schema is up to date");
    }
    Ok(report)
}

/// # Errors
///
/// Returns an error if `sqlite_master` cannot be read.
pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let mut stmt = conn.prepare_cached("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?")?;
    Ok(stmt.exists([table])?)
}

/// # Errors
///
/// Returns an error if the table's columns cannot be listed.
pub fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    // pragma_table_info takes the table name as a string literal.
    let sql = format!(
        "SELECT 1 FROM pragma_table_info('{}') WHERE name = ?",
        table.replace('\'', "''")
    );
    let mut stmt = conn.prepare(&sql)?;
    Ok(stmt.exists([column])?)
}

/// Add `column` to `table` unless it is already there. Returns whether the
/// column was added. Missing tables are left alone.
///
/// # Errors
///
/// Returns an error if the schema cannot be inspected or altered.
pub fn add_column_if_missing(tx: &mut Tx<'_>, table: &str, column: &str, definition: &str) -> Result<bool> {
    if !table_exists(tx.connection(), table)? || column_exists(tx.connection(), table, column)? {
        return Ok(false);
    }
    tx.execute(&format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"), &[])?;
    Ok(true)
}

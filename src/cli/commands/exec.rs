//! Exec command implementation.

use super::parse_params;
use crate::cli::StatementArgs;
use crate::storage::Database;
use anyhow::{Context, Result};
use tracing::info;

/// Execute one statement and print the number of changed rows.
///
/// # Errors
///
/// Returns an error if the statement fails.
pub fn execute(db: &Database, args: &StatementArgs) -> Result<()> {
    let params = parse_params(&args.params);
    let changed = db
        .execute(&args.sql, &params)
        .with_context(|| format!("executing `{}`", args.sql))?;
    info!(changed, "statement executed");
    println!("{changed}");
    Ok(())
}

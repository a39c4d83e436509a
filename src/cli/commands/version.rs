//! Version command implementation.

use crate::storage::Database;
use anyhow::Result;

/// Print the persisted schema version.
///
/// # Errors
///
/// Returns an error if the version cannot be read.
pub fn execute(db: &Database) -> Result<()> {
    println!("{}", db.schema_version()?);
    Ok(())
}

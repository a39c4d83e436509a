//! Config command implementation.

use crate::config::StoreConfig;
use anyhow::Result;

/// Print the resolved configuration as pretty JSON.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn execute(config: &StoreConfig) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

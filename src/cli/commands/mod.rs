//! Subcommand implementations.

pub mod config;
pub mod exec;
pub mod query;
pub mod version;

use crate::storage::Param;

/// Bind command-line words as statement parameters.
pub(crate) fn parse_params(raw: &[String]) -> Vec<Param> {
    raw.iter().map(|value| Param::parse_loose(value)).collect()
}

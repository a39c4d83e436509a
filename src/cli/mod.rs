//! Command-line interface.
//!
//! `tickdb [--config FILE] [--set KEY=VALUE]... [-v] [-q] [--log-file F] <DB> <COMMAND>`

pub mod commands;

use crate::config::{self, CliOverrides, StoreConfig};
use crate::storage::Database;
use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Database path that opens a throwaway in-memory store.
pub const MEMORY_DB: &str = ":memory:";

#[derive(Debug, Parser)]
#[command(name = "tickdb", version, about = "Inspect and script a tickdb store")]
pub struct Cli {
    /// YAML config file (defaults to ./tickdb.yaml when present)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Override a config key, e.g. --set cache.ttl=5s
    #[arg(long = "set", global = true, value_name = "KEY=VALUE", value_parser = parse_override)]
    pub overrides: Vec<(String, String)>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Also write JSON logs to this file
    #[arg(long, global = true, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Database file, or `:memory:`
    pub db: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Execute a statement and print the number of changed rows
    Exec(StatementArgs),
    /// Run a query and print the rows as JSON
    Query(QueryArgs),
    /// Print the persisted schema version
    Version,
    /// Print the resolved configuration as JSON
    Config,
}

#[derive(Debug, clap::Args)]
pub struct StatementArgs {
    pub sql: String,

    /// Positional parameters; integers, floats and `null` are recognized,
    /// anything else binds as text
    #[arg(allow_negative_numbers = true)]
    pub params: Vec<String>,
}

#[derive(Debug, clap::Args)]
pub struct QueryArgs {
    #[command(flatten)]
    pub statement: StatementArgs,

    /// Print one JSON document on a single line
    #[arg(long)]
    pub compact: bool,
}

fn parse_override(raw: &str) -> std::result::Result<(String, String), String> {
    CliOverrides::parse_pair(raw).map_err(|err| err.to_string())
}

impl Cli {
    #[must_use]
    pub fn config_overrides(&self) -> CliOverrides {
        CliOverrides {
            config_path: self.config.clone(),
            values: self.overrides.clone(),
        }
    }
}

/// Resolve configuration from every layer the CLI sees.
///
/// # Errors
///
/// Returns an error if a config source cannot be read or holds invalid values.
pub fn resolve_config(cli: &Cli) -> Result<StoreConfig> {
    let layer = config::load_config(&cli.config_overrides())?;
    for key in layer.unknown_keys() {
        warn!(key, "ignoring unknown config key");
    }
    Ok(StoreConfig::from_layer(&layer)?)
}

/// Open the store named on the command line.
///
/// # Errors
///
/// Returns an error if the database cannot be opened.
pub fn open_database(path: &Path, config: StoreConfig) -> Result<Database> {
    let db = if path.as_os_str() == MEMORY_DB {
        Database::open_in_memory(config)?
    } else {
        Database::open(path, config)?
    };
    debug!(store = db.engine().name(), "opened store");
    Ok(db)
}

/// Execute the parsed command line.
///
/// # Errors
///
/// Returns an error if configuration, storage, or output fails.
pub fn run(cli: &Cli) -> Result<()> {
    let config = resolve_config(cli)?;
    match &cli.command {
        Commands::Config => commands::config::execute(&config),
        Commands::Exec(args) => {
            let db = open_database(&cli.db, config)?;
            let result = commands::exec::execute(&db, args);
            db.close();
            result
        }
        Commands::Query(args) => {
            let db = open_database(&cli.db, config)?;
            let result = commands::query::execute(&db, args);
            db.close();
            result
        }
        Commands::Version => {
            let db = open_database(&cli.db, config)?;
            let result = commands::version::execute(&db);
            db.close();
            result
        }
    }
}

//! Diagnostics setup.
//!
//! The library only emits `tracing` events: slow guarded calls, worker start
//! and stop, applied migrations, failed cache refreshes. Installing a
//! subscriber is up to the binary (stderr, optionally mirrored as JSON lines
//! into a file) and to tests.

use std::fs::File;
use std::io::{self, IsTerminal};
use std::path::Path;
use std::sync::{Mutex, Once};

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install the CLI subscriber. `RUST_LOG` wins over the verbosity flags.
///
/// # Errors
///
/// Returns an error if the filter is invalid, the log file cannot be
/// created, or a subscriber is already installed.
pub fn init_logging(verbosity: u8, quiet: bool, log_file: Option<&Path>) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter(verbosity, quiet))?,
    };

    let json_file = match log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("creating log file {}", path.display()))?;
            Some(fmt::layer().json().with_writer(Mutex::new(file)).with_ansi(false))
        }
        None => None,
    };

    let debug_build = cfg!(debug_assertions);
    let console = fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_file(debug_build)
        .with_line_number(debug_build);

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(json_file)
        .try_init()?;
    Ok(())
}

/// Filter directives used when `RUST_LOG` is unset.
fn default_filter(verbosity: u8, quiet: bool) -> String {
    let directives: &[&str] = match (quiet, verbosity) {
        (true, _) => &["error"],
        (false, 0) => &["tickdb=info"],
        (false, 1) => &["tickdb=debug"],
        (false, 2) => &["tickdb=trace", "rusqlite=debug"],
        _ => &["trace"],
    };
    directives.join(",")
}

/// Test subscriber on the test writer; installed once per process.
pub fn init_test_logging() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(default_filter(1, false)))
            .with_test_writer()
            .try_init();
    });
}

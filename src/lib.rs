//! `tickdb` - single-writer embedded SQLite access for latency-sensitive hosts
//!
//! One worker thread owns the connection and runs every statement in
//! submission order. Callers on a designated *guarded context* (a game tick,
//! a UI frame) get bounded blocking, and reads can be served from caches
//! that committed writes invalidate.
//!
//! # Architecture
//!
//! - [`storage`] - execution engine, blocking guard, transactions, `Database`
//! - [`cache`] - read-through query cache and generic keyed caches
//! - [`migrate`] - version-gated schema migrations
//! - [`config`] - layered configuration
//! - [`error`] - error types
//! - [`logging`] - tracing subscriber setup
//! - [`cli`] - the `tickdb` command-line tool

#![forbid(unsafe_code)]
#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod migrate;
pub mod storage;

pub use cache::{CachePolicy, KeyedCache, QueryCache};
pub use config::StoreConfig;
pub use error::{ExecutionError, Result, StoreError};
pub use migrate::{MigrationReport, MigrationStep, Migrator};
pub use storage::{
    BlockingOptions, Database, GuardedContext, MainThreadPolicy, Param, Pending, RowMapper,
    TimeoutBehavior, Tx,
};

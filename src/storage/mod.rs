//! `SQLite` storage layer.
//!
//! - [`engine`] - single-writer execution engine
//! - [`guard`] - blocking guard for the latency-sensitive caller
//! - [`tx`] - transactions with commit-time cache invalidation
//! - [`database`] - the `Database` facade tying them together
//! - [`param`], [`row`] - statement parameters and row decoders
//! - [`pending`] - completion handles for work running elsewhere

pub mod database;
pub mod engine;
pub mod guard;
pub mod param;
pub mod pending;
pub mod row;
pub mod tx;

pub use database::Database;
pub use engine::{ConnectionSettings, StorageEngine, StoreLocation};
pub use guard::{BlockingOptions, GuardedContext, MainThreadPolicy, TimeoutBehavior};
pub use param::Param;
pub use pending::Pending;
pub use row::RowMapper;
pub use tx::Tx;

use crate::error::Result;
use rusqlite::{Connection, params_from_iter};

/// Run a statement and return the number of rows it changed.
pub(crate) fn execute_statement(conn: &Connection, sql: &str, params: &[Param]) -> Result<usize> {
    let mut stmt = conn.prepare_cached(sql)?;
    Ok(stmt.execute(params_from_iter(params.iter()))?)
}

/// Run a query and decode every row.
pub(crate) fn query_rows<T>(
    conn: &Connection,
    sql: &str,
    params: &[Param],
    mapper: &RowMapper<T>,
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params_from_iter(params.iter()), |row| mapper.decode(row))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Run a query and decode the first row, if any.
pub(crate) fn query_first<T>(
    conn: &Connection,
    sql: &str,
    params: &[Param],
    mapper: &RowMapper<T>,
) -> Result<Option<T>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    match rows.next()? {
        Some(row) => Ok(Some(mapper.decode(row)?)),
        None => Ok(None),
    }
}

//! Row decoders.
//!
//! A [`RowMapper`] turns one result row into a value. Each mapper carries an
//! identity assigned at construction; the query cache keys on that identity,
//! so build a mapper once and reuse it rather than creating one per call.

use rusqlite::Row;
use rusqlite::types::{FromSql, Type};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

static NEXT_MAPPER_ID: AtomicU64 = AtomicU64::new(1);

type DecodeFn<T> = dyn Fn(&Row<'_>) -> rusqlite::Result<T> + Send + Sync;

/// Decodes a result row into `T`.
pub struct RowMapper<T> {
    id: u64,
    decode: Arc<DecodeFn<T>>,
}

impl<T> RowMapper<T> {
    pub fn new<F>(decode: F) -> Self
    where
        F: Fn(&Row<'_>) -> rusqlite::Result<T> + Send + Sync + 'static,
    {
        Self {
            id: NEXT_MAPPER_ID.fetch_add(1, Ordering::Relaxed),
            decode: Arc::new(decode),
        }
    }

    /// Identity of this decoder. Clones share it.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Decode a single row.
    ///
    /// # Errors
    ///
    /// Returns the underlying `rusqlite` error if a column is missing or has
    /// an incompatible type.
    pub fn decode(&self, row: &Row<'_>) -> rusqlite::Result<T> {
        (self.decode)(row)
    }
}

impl<T: FromSql + 'static> RowMapper<T> {
    /// Mapper reading the first column of each row.
    #[must_use]
    pub fn first_column() -> Self {
        Self::new(|row| row.get(0))
    }

    /// Mapper reading a named column of each row.
    #[must_use]
    pub fn column(name: &'static str) -> Self {
        Self::new(move |row| row.get(name))
    }
}

impl RowMapper<Uuid> {
    /// Mapper reading a UUID stored as text in the first column.
    #[must_use]
    pub fn uuid_text() -> Self {
        Self::new(|row| read_uuid(row, 0))
    }
}

/// Read a UUID stored as text, as bound by [`Param::Uuid`](crate::storage::Param::Uuid).
///
/// # Errors
///
/// Fails if the column is not text or does not hold a valid UUID.
pub fn read_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let text: String = row.get(idx)?;
    Uuid::parse_str(&text).map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

impl<T> Clone for RowMapper<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            decode: Arc::clone(&self.decode),
        }
    }
}

impl<T> fmt::Debug for RowMapper<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowMapper").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn clones_share_identity() {
        let mapper = RowMapper::<i64>::first_column();
        let copy = mapper.clone();
        assert_eq!(mapper.id(), copy.id());
        assert_ne!(mapper.id(), RowMapper::<i64>::first_column().id());
    }

    #[test]
    fn named_column_decodes() {
        let conn = Connection::open_in_memory().unwrap();
        let mapper = RowMapper::<String>::column("name");
        let name = conn
            .query_row("SELECT 'steve' AS name", [], |row| mapper.decode(row))
            .unwrap();
        assert_eq!(name, "steve");
    }

    #[test]
    fn uuid_text_decodes_and_rejects_garbage() {
        let conn = Connection::open_in_memory().unwrap();
        let mapper = RowMapper::uuid_text();
        let id = conn
            .query_row("SELECT '67e55044-10b1-426f-9247-bb680e5fe0c8'", [], |row| mapper.decode(row))
            .unwrap();
        assert_eq!(id.to_string(), "67e55044-10b1-426f-9247-bb680e5fe0c8");

        let err = conn
            .query_row("SELECT 'not-a-uuid'", [], |row| mapper.decode(row))
            .unwrap_err();
        assert!(matches!(err, rusqlite::Error::FromSqlConversionFailure(0, Type::Text, _)));
    }
}

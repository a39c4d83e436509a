//! Query command implementation.
//!
//! Rows are printed as a JSON array of objects keyed by column name. Blobs
//! become arrays of byte values.

use super::parse_params;
use crate::cli::QueryArgs;
use crate::storage::{Database, RowMapper};
use anyhow::{Context, Result};
use rusqlite::Row;
use rusqlite::types::ValueRef;
use serde_json::{Map, Number, Value};

/// # Errors
///
/// Returns an error if the query fails or the rows cannot be serialized.
pub fn execute(db: &Database, args: &QueryArgs) -> Result<()> {
    let params = parse_params(&args.statement.params);
    let rows = db
        .query_uncached(&args.statement.sql, &params, &json_row_mapper())
        .with_context(|| format!("querying `{}`", args.statement.sql))?;

    let output = if args.compact {
        serde_json::to_string(&rows)?
    } else {
        serde_json::to_string_pretty(&rows)?
    };
    println!("{output}");
    Ok(())
}

/// Decodes any row into a JSON object.
#[must_use]
pub fn json_row_mapper() -> RowMapper<Value> {
    RowMapper::new(row_to_json)
}

fn row_to_json(row: &Row<'_>) -> rusqlite::Result<Value> {
    let stmt = row.as_ref();
    let mut object = Map::with_capacity(stmt.column_count());
    for idx in 0..stmt.column_count() {
        let name = stmt.column_name(idx)?.to_string();
        let value = match row.get_ref(idx)? {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(v) => Value::from(v),
            ValueRef::Real(v) => Number::from_f64(v).map_or(Value::Null, Value::Number),
            ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(bytes) => Value::from(bytes.to_vec()),
        };
        object.insert(name, value);
    }
    Ok(Value::Object(object))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::storage::Param;
    use serde_json::json;

    #[test]
    fn rows_become_objects() {
        let db = Database::open_in_memory(StoreConfig::default()).unwrap();
        db.execute(
            "CREATE TABLE things (id INTEGER, label TEXT, weight REAL, raw BLOB, gone TEXT)",
            &[],
        )
        .unwrap();
        db.execute(
            "INSERT INTO things VALUES (?, ?, ?, ?, ?)",
            &[
                Param::i64(7),
                Param::text("widget"),
                Param::f64(1.5),
                Param::blob(vec![1, 2]),
                Param::Null,
            ],
        )
        .unwrap();

        let rows = db
            .query_uncached("SELECT * FROM things", &[], &json_row_mapper())
            .unwrap();
        assert_eq!(
            rows,
            vec![json!({"id": 7, "label": "widget", "weight": 1.5, "raw": [1, 2], "gone": null})]
        );
    }
}

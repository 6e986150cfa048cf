//! Row encoder/decoder (component C7).
//!
//! Bridges a slice of [`Table`] entities to batched SQL against one
//! connection. Encoding is pure (it only reads `Table::to_row`); the actual
//! `INSERT`/`INSERT OR REPLACE` statements are built here but executed by
//! whoever holds the live `rusqlite::Connection` inside a transaction —
//! `manager::Manager::save_list` is the only caller in this crate, but the
//! functions take a bare `&rusqlite::Connection` so tests don't need a full
//! `Manager` to exercise them.

use rusqlite::types::ToSqlOutput;
use rusqlite::ToSql;

use crate::error::{Error, Result};
use crate::id::AutoId;
use crate::row::{question_marks, Row, Table};
use crate::schema::TableSchema;
use crate::value::Value;

/// A thin `ToSql` wrapper so a `&Value` can be handed straight to rusqlite's
/// positional-parameter binding without an intermediate allocation per call.
struct BoundValue<'a>(&'a Value);

impl<'a> ToSql for BoundValue<'a> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        use rusqlite::types::Value as SqlValue;
        Ok(ToSqlOutput::Owned(match self.0 {
            Value::Null => SqlValue::Null,
            // `u64` has no native SQLite binding; the bit pattern is stored
            // as `i64` and the decoder's tag tells us how to read it back
            // (spec.md §6: "unsigned 64 is stored as the bit-pattern of a
            // signed 64").
            Value::UInt64(n) => SqlValue::Integer(*n as i64),
            Value::Int64(n) => SqlValue::Integer(*n),
            Value::Double(f) => SqlValue::Real(*f),
            Value::Text(s) => SqlValue::Text(s.clone()),
            Value::Blob(b) => SqlValue::Blob(b.clone()),
        }))
    }
}

/// Encode every entity in `entities` into a positional [`Row`] following
/// `T::columns()`'s order.
pub fn encode_rows<T: Table>(entities: &[T]) -> Vec<Row> {
    entities.iter().map(Table::to_row).collect()
}

/// Decode every row into `T`, in the same order.
pub fn decode_rows<T: Table>(rows: &[Row]) -> Result<Vec<T>> {
    rows.iter().map(T::from_row).collect()
}

/// Split `rows` into chunks small enough that `columns.len() * chunk.len()`
/// never exceeds `max_params` — the engine's bound-parameter ceiling
/// (spec.md §4.6, §8: "more than (max_params / columns) entities in one
/// save must split into multiple statements").
fn chunk_rows<'a>(rows: &'a [Row], num_columns: usize, max_params: usize) -> Vec<&'a [Row]> {
    if rows.is_empty() {
        return Vec::new();
    }
    let per_chunk = (max_params / num_columns.max(1)).max(1);
    rows.chunks(per_chunk).collect()
}

fn bind_values<'a>(columns: &[String], row: &'a Row) -> Vec<BoundValue<'a>> {
    columns
        .iter()
        .map(|c| BoundValue(row.get(c).unwrap_or(&Value::Null)))
        .collect()
}

fn multi_row_values_clause(num_columns: usize, num_rows: usize) -> String {
    let one_row = format!("({})", question_marks(num_columns));
    std::iter::repeat(one_row.as_str())
        .take(num_rows)
        .collect::<Vec<_>>()
        .join(",")
}

/// `INSERT OR REPLACE INTO t (cols) VALUES (?,?),...` — the "updated" path
/// (spec.md §4.6). Chunked to respect `max_params`.
pub fn upsert_rows(conn: &rusqlite::Connection, schema: &TableSchema, rows: &[Row]) -> Result<()> {
    write_rows(conn, schema, rows, "INSERT OR REPLACE")
}

/// Plain `INSERT INTO t (cols) VALUES (?,?),...` — the "created" path, left
/// un-replaced so a primary-key collision surfaces as a constraint
/// violation instead of silently overwriting an existing row (spec.md
/// §4.6: "For the 'created' path, plain INSERT is used so unique-constraint
/// violations surface").
pub fn insert_rows(conn: &rusqlite::Connection, schema: &TableSchema, rows: &[Row]) -> Result<()> {
    write_rows(conn, schema, rows, "INSERT")
}

fn write_rows(
    conn: &rusqlite::Connection,
    schema: &TableSchema,
    rows: &[Row],
    verb: &str,
) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let column_names: Vec<String> = schema.columns.iter().map(|c| c.name.clone()).collect();
    let max_params = conn
        .limit(rusqlite::limits::Limit::SQLITE_LIMIT_VARIABLE_NUMBER)
        .max(1) as usize;

    for chunk in chunk_rows(rows, column_names.len(), max_params) {
        let sql = format!(
            "{verb} INTO `{}` ({}) VALUES {}",
            schema.name,
            column_names
                .iter()
                .map(|c| format!("`{c}`"))
                .collect::<Vec<_>>()
                .join(", "),
            multi_row_values_clause(column_names.len(), chunk.len())
        );
        let mut params: Vec<BoundValue> = Vec::with_capacity(column_names.len() * chunk.len());
        for row in *chunk {
            params.extend(bind_values(&column_names, row));
        }
        let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
        conn.execute(&sql, param_refs.as_slice())?;
    }
    Ok(())
}

/// `SELECT * FROM t WHERE id IN (?,?,...)`, decoded into [`Row`]s. Returns
/// rows in whatever order the engine produces them — callers that need
/// input-order (`fetch_ids`) re-sort by id themselves.
pub fn select_by_ids(
    conn: &rusqlite::Connection,
    schema: &TableSchema,
    ids: &[AutoId],
) -> Result<Vec<Row>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT * FROM `{}` WHERE id IN ({})",
        schema.name,
        question_marks(ids.len())
    );
    // Bind through the same bit-pattern cast the write path uses (spec.md
    // §6) rather than handing `&u64` straight to rusqlite — `ToSql` for
    // `u64` rejects anything past `i64::MAX`, which would make
    // `id = u64::MAX` fail to round-trip on fetch even though it inserted
    // fine.
    let bound: Vec<Value> = ids.iter().map(|&id| Value::UInt64(id)).collect();
    let params: Vec<BoundValue> = bound.iter().map(BoundValue).collect();
    let params: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
    let mut stmt = conn.prepare(&sql)?;
    let column_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let rows = stmt.query_map(params.as_slice(), |r| row_from_sql(r, &column_names))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// `SELECT * FROM t WHERE <predicate>`, for arbitrary caller SQL
/// (`fetch_query`, `RelationQuery`). `predicate` is appended verbatim after
/// `WHERE` — this crate exposes raw SQL rather than a query-builder DSL
/// (spec.md §1 Non-goals).
pub fn select_where(
    conn: &rusqlite::Connection,
    schema: &TableSchema,
    predicate: &str,
    args: &[Value],
) -> Result<Vec<Row>> {
    let sql = if predicate.trim().is_empty() {
        format!("SELECT * FROM `{}`", schema.name)
    } else {
        format!("SELECT * FROM `{}` WHERE {predicate}", schema.name)
    };
    let bound: Vec<BoundValue> = args.iter().map(BoundValue).collect();
    let param_refs: Vec<&dyn ToSql> = bound.iter().map(|p| p as &dyn ToSql).collect();
    let mut stmt = conn.prepare(&sql)?;
    let column_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let rows = stmt.query_map(param_refs.as_slice(), |r| row_from_sql(r, &column_names))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn row_from_sql(r: &rusqlite::Row, column_names: &[String]) -> rusqlite::Result<Row> {
    let mut row = Row::new();
    for (idx, name) in column_names.iter().enumerate() {
        let value: rusqlite::types::Value = r.get(idx)?;
        row.insert(name.clone(), value.into());
    }
    Ok(row)
}

impl From<rusqlite::types::Value> for Value {
    fn from(v: rusqlite::types::Value) -> Self {
        match v {
            rusqlite::types::Value::Null => Value::Null,
            // The declared `id` column is always read back as `UInt64`
            // (spec.md §6); every other integer column is ambiguous at the
            // storage layer, so it surfaces as `Int64` and the decoder
            // re-tags it via `Value::as_u64` when the target field is
            // unsigned.
            rusqlite::types::Value::Integer(n) => Value::Int64(n),
            rusqlite::types::Value::Real(f) => Value::Double(f),
            rusqlite::types::Value::Text(s) => Value::Text(s),
            rusqlite::types::Value::Blob(b) => Value::Blob(b),
        }
    }
}

/// Re-query every unique index on `schema` for rows matching `rows`,
/// collecting the ids of whatever's already there — the diagnostic pass
/// `manager::Manager::save_list` runs after a plain `INSERT` throws a
/// unique-constraint violation on the created path (spec.md §4.6, §7).
pub fn diagnose_unique_conflicts(
    conn: &rusqlite::Connection,
    schema: &TableSchema,
    rows: &[Row],
) -> Result<Vec<AutoId>> {
    let mut conflicting: Vec<AutoId> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for index in &schema.unique_indexes {
        for row in rows {
            let values: Vec<&Value> = index
                .columns
                .iter()
                .map(|c| row.get(c).unwrap_or(&Value::Null))
                .collect();
            if values.iter().any(|v| v.is_null()) {
                continue;
            }
            let predicate = index
                .columns
                .iter()
                .map(|c| format!("`{c}` = ?"))
                .collect::<Vec<_>>()
                .join(" AND ");
            let sql = format!("SELECT id FROM `{}` WHERE {predicate}", schema.name);
            let bound: Vec<BoundValue> = values.into_iter().map(BoundValue).collect();
            let param_refs: Vec<&dyn ToSql> = bound.iter().map(|p| p as &dyn ToSql).collect();
            let mut stmt = conn.prepare(&sql)?;
            let ids = stmt.query_map(param_refs.as_slice(), |r| {
                let id: i64 = r.get(0)?;
                Ok(id as u64)
            })?;
            for id in ids {
                let id = id?;
                if seen.insert(id) {
                    conflicting.push(id);
                }
            }
        }
    }
    Ok(conflicting)
}

/// Collapse a map of column-name -> JSON-able value into a single blob
/// column for fields the embedding application declared as "complex" rather
/// than scalar (spec.md §4.6, §6: "Unknown complex types -> blob containing
/// UTF-8 JSON with sorted keys"). `serde_json`'s `Map` preserves insertion
/// order by default; callers that want sorted keys should build the value
/// with a `BTreeMap`-backed structure, which is what this crate's own
/// generated `Table` impls do via `Row` (a `BTreeMap`) for any nested
/// structure before calling this.
pub fn encode_complex<T: serde::Serialize>(value: &T) -> Result<Value> {
    Ok(Value::Blob(serde_json::to_vec(value)?))
}

/// Inverse of [`encode_complex`].
pub fn decode_complex<T: serde::de::DeserializeOwned>(value: &Value) -> Result<T> {
    let bytes = value.as_blob()?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, SqlKind};
    use crate::settings::SettingsKey;

    fn widgets_schema() -> TableSchema {
        TableSchema {
            name: "widgets".into(),
            columns: vec![
                Column::new("id", SqlKind::Integer, false),
                Column::new("name", SqlKind::Text, false),
            ],
            indexes: vec![],
            unique_indexes: vec![crate::schema::IndexDescriptor::new(
                "widgets",
                true,
                vec!["name".into()],
            )],
            settings_key: SettingsKey::Memory,
        }
    }

    fn row(id: u64, name: &str) -> Row {
        let mut r = Row::new();
        r.insert("id".into(), Value::UInt64(id));
        r.insert("name".into(), Value::Text(name.to_string()));
        r
    }

    #[test]
    fn insert_then_select_by_ids_round_trips() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let schema = widgets_schema();
        conn.execute_batch(&schema.to_create_table_sql()).unwrap();
        insert_rows(&conn, &schema, &[row(1, "cog"), row(2, "sprocket")]).unwrap();

        let rows = select_by_ids(&conn, &schema, &[1, 2]).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn empty_id_list_touches_nothing() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let schema = widgets_schema();
        conn.execute_batch(&schema.to_create_table_sql()).unwrap();
        let rows = select_by_ids(&conn, &schema, &[]).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn chunking_splits_large_batches() {
        let rows: Vec<Row> = (0..10).map(|i| row(i, "x")).collect();
        let chunks = chunk_rows(&rows, 2, 4);
        assert_eq!(chunks.len(), 5, "2 rows per chunk at 4 params/row-pair");
    }

    #[test]
    fn plain_insert_surfaces_unique_violation_and_diagnoses_it() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let schema = widgets_schema();
        conn.execute_batch(&schema.to_create_table_sql()).unwrap();
        conn.execute_batch("CREATE UNIQUE INDEX widgets_name ON widgets(name)")
            .unwrap();
        insert_rows(&conn, &schema, &[row(1, "Test")]).unwrap();

        let err = insert_rows(&conn, &schema, &[row(2, "Test")]).unwrap_err();
        assert!(err.is_unique_violation());

        let conflicts = diagnose_unique_conflicts(&conn, &schema, &[row(2, "Test")]).unwrap();
        assert_eq!(conflicts, vec![1]);
    }

    #[test]
    fn upsert_replaces_existing_row() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let schema = widgets_schema();
        conn.execute_batch(&schema.to_create_table_sql()).unwrap();
        conn.execute_batch("CREATE UNIQUE INDEX widgets_name ON widgets(name)")
            .unwrap();
        insert_rows(&conn, &schema, &[row(1, "a")]).unwrap();
        upsert_rows(&conn, &schema, &[row(1, "b")]).unwrap();

        let rows = select_by_ids(&conn, &schema, &[1]).unwrap();
        assert_eq!(rows[0].get("name"), Some(&Value::Text("b".to_string())));
    }
}

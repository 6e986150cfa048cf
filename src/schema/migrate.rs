//! Migration planner (component C6).
//!
//! Diffs a target [`TableSchema`] against whatever `sqlite_master`/
//! `pragma_table_info` currently says about the table, and applies the
//! difference inside the caller's transaction. The caller (`manager::setup_db`)
//! is responsible for wrapping this in a `SAVEPOINT`/transaction — this
//! module only issues plain DDL/DML against whatever connection it's given.

use rand::Rng;
use rusqlite::Connection;

use crate::error::{Error, Result};
use crate::schema::reflect::{Column, IndexDescriptor, SqlKind, TableSchema};

/// One step of a migration, surfaced to callers for logging/auditing.
#[derive(Debug, Clone)]
pub enum MigrationState {
    /// The table didn't exist; it was created fresh with all its indexes.
    CreatedTable,
    /// An existing table gained a column via incremental `ALTER TABLE ADD
    /// COLUMN` (no column changed type, so no rebuild was necessary).
    NewColumn(Column),
    /// A column changed type/nullability, forcing a full table rebuild.
    /// `old_table_name` is the renamed-aside copy of the table under its
    /// *previous* schema (`"_<table>+temp+<n>"`) — callers that need
    /// bespoke per-column conversion (a rename, a parse-with-fallback) read
    /// from it and write into the live table of the same transaction before
    /// it's dropped.
    Changes {
        old_table_name: String,
        columns: Vec<Column>,
    },
    /// Creating or recreating one index failed. Migration continues;
    /// the index is simply absent until the next setup attempt.
    FailedIndex { index: IndexDescriptor, error: String },
}

/// A one-shot data-migration hook run inside the same transaction as a
/// table rebuild, given the temp table holding the pre-migration data and
/// the target column list of the live table.
pub struct ChangesEvent {
    pub old_table_name: String,
    pub columns: Vec<Column>,
}

/// Run the migration planner for one table schema against `conn`.
///
/// `on_migrate` is invoked exactly once, only when a column's type/nullability
/// changed and a full-table rebuild is required; it has a chance to copy
/// data the automatic same-name intersection copy can't handle correctly
/// (renamed columns, values that need bespoke parsing) before the temp table
/// is dropped.
pub fn run_migration(
    conn: &Connection,
    schema: &TableSchema,
    on_migrate: Option<&dyn Fn(&Connection, &ChangesEvent) -> Result<()>>,
) -> Result<Vec<MigrationState>> {
    let mut states = Vec::new();
    let current_columns = read_current_columns(conn, &schema.name)?;

    if current_columns.is_empty() {
        conn.execute(&schema.to_create_table_sql(), [])?;
        for idx in schema.all_indexes() {
            create_index_best_effort(conn, &schema.name, idx, &mut states);
        }
        states.push(MigrationState::CreatedTable);
        return Ok(states);
    }

    let current_indexes = read_current_indexes(conn, &schema.name)?;
    let target_indexes = schema.all_indexes();

    let dropped_indexes: Vec<IndexDescriptor> = current_indexes
        .iter()
        .filter(|ci| !target_indexes.contains(ci))
        .cloned()
        .collect();
    let new_indexes: Vec<IndexDescriptor> = target_indexes
        .iter()
        .filter(|ti| !current_indexes.contains(ti))
        .cloned()
        .collect();

    let changed_type: Vec<&Column> = schema
        .columns
        .iter()
        .filter(|target_col| {
            current_columns
                .iter()
                .any(|cur| cur.name == target_col.name && cur != *target_col)
        })
        .collect();

    if !changed_type.is_empty() {
        let event = rebuild_table(conn, schema, &current_columns, on_migrate)?;
        states.push(MigrationState::Changes {
            old_table_name: event.old_table_name,
            columns: event.columns,
        });
        return Ok(states);
    }

    let added_columns: Vec<&Column> = schema
        .columns
        .iter()
        .filter(|target_col| !current_columns.iter().any(|cur| cur.name == target_col.name))
        .collect();
    let dropped_columns: Vec<&Column> = current_columns
        .iter()
        .filter(|cur| !schema.columns.iter().any(|target_col| target_col.name == cur.name))
        .collect();

    for idx in &dropped_indexes {
        conn.execute(&idx.to_drop_sql(), [])?;
    }

    for col in &added_columns {
        if !col.nullable && col.default_literal.is_none() {
            return Err(Error::ImpossibleUrlMigration(col.name.clone()));
        }
        conn.execute(
            &format!("ALTER TABLE `{}` ADD COLUMN {}", schema.name, col.to_def_sql()),
            [],
        )?;
        states.push(MigrationState::NewColumn((*col).clone()));
    }

    for col in &dropped_columns {
        conn.execute(
            &format!("ALTER TABLE `{}` DROP COLUMN `{}`", schema.name, col.name),
            [],
        )?;
    }

    for idx in new_indexes {
        create_index_best_effort(conn, &schema.name, idx, &mut states);
    }

    Ok(states)
}

fn create_index_best_effort(
    conn: &Connection,
    table: &str,
    idx: IndexDescriptor,
    states: &mut Vec<MigrationState>,
) {
    if let Err(e) = conn.execute(&idx.to_create_sql(table), []) {
        states.push(MigrationState::FailedIndex {
            index: idx,
            error: e.to_string(),
        });
    }
}

/// Rename the live table aside, recreate it with the target schema, copy
/// every same-named column automatically, run the caller's data-migration
/// callback (if any), then drop the renamed-aside copy and rebuild indexes.
fn rebuild_table(
    conn: &Connection,
    schema: &TableSchema,
    current_columns: &[Column],
    on_migrate: Option<&dyn Fn(&Connection, &ChangesEvent) -> Result<()>>,
) -> Result<ChangesEvent> {
    let suffix: u32 = rand::thread_rng().gen();
    let temp_name = format!("_{}+temp+{suffix}", schema.name);

    conn.execute(
        &format!("ALTER TABLE `{}` RENAME TO `{temp_name}`", schema.name),
        [],
    )?;
    conn.execute(&schema.to_create_table_sql(), [])?;

    let shared_columns: Vec<&str> = schema
        .columns
        .iter()
        .filter(|target_col| current_columns.iter().any(|cur| cur.name == target_col.name))
        .map(|c| c.name.as_str())
        .collect();

    if !shared_columns.is_empty() {
        let col_list = shared_columns
            .iter()
            .map(|c| format!("`{c}`"))
            .collect::<Vec<_>>()
            .join(", ");
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO `{}` ({col_list}) SELECT {col_list} FROM `{temp_name}`",
                schema.name
            ),
            [],
        )?;
    }

    let event = ChangesEvent {
        old_table_name: temp_name.clone(),
        columns: schema.columns.clone(),
    };

    if let Some(cb) = on_migrate {
        cb(conn, &event)?;
    }

    conn.execute(&format!("DROP TABLE `{temp_name}`"), [])?;

    let mut ignored = Vec::new();
    for idx in schema.all_indexes() {
        create_index_best_effort(conn, &schema.name, idx, &mut ignored);
    }
    for state in ignored {
        tracing::warn!(table = %schema.name, ?state, "index rebuild failed after table migration");
    }

    Ok(event)
}

fn read_current_columns(conn: &Connection, table: &str) -> Result<Vec<Column>> {
    let mut stmt =
        conn.prepare("SELECT name, type, \"notnull\", dflt_value FROM pragma_table_info(?1)")?;
    let rows = stmt.query_map([table], |row| {
        let name: String = row.get(0)?;
        let type_name: String = row.get(1)?;
        let notnull: i64 = row.get(2)?;
        let dflt: Option<String> = row.get(3)?;
        Ok(Column {
            name,
            sql_kind: SqlKind::from_sql_type_name(&type_name),
            declared_value_type: "",
            nullable: notnull == 0,
            default_literal: dflt,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn read_current_indexes(conn: &Connection, table: &str) -> Result<Vec<IndexDescriptor>> {
    let mut stmt = conn.prepare(
        "SELECT name, \"unique\" FROM pragma_index_list(?1) WHERE name NOT LIKE 'sqlite_autoindex_%'",
    )?;
    let index_rows: Vec<(String, bool)> = stmt
        .query_map([table], |row| {
            let name: String = row.get(0)?;
            let unique: i64 = row.get(1)?;
            Ok((name, unique != 0))
        })?
        .collect::<std::result::Result<_, _>>()?;

    let mut out = Vec::new();
    for (name, unique) in index_rows {
        let mut col_stmt = conn.prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")?;
        let columns: Vec<String> = col_stmt
            .query_map([&name], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        out.push(IndexDescriptor { name, unique, columns });
    }
    Ok(out)
}

//! Schema reflection (component C5).
//!
//! The teacher crate enumerates an entity's fields through dynamic
//! reflection at runtime; a systems-language port can't do that cheaply or
//! safely, so (per the design notes) entities declare their column list
//! statically through the `Table` trait instead of being walked. That
//! sidesteps the teacher's "optional fields present as null must be
//! re-enumerated from the type" workaround entirely: a declared column is
//! either nullable or it isn't, there is no blind spot to patch up.
//!
//! This module is the static half of the reflector: it defines the
//! `Column`/`IndexDescriptor`/`TableSchema` shapes and the DDL an embedding
//! application's `Table::columns()`/`Table::indexes()` gets turned into.
//! `schema::migrate` does the dynamic half — diffing a `TableSchema` against
//! whatever the live database currently has.

use std::hash::{Hash, Hasher};

use crate::settings::SettingsKey;

/// SQL storage class a column is declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlKind {
    Integer,
    Real,
    Text,
    Blob,
}

impl SqlKind {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SqlKind::Integer => "INTEGER",
            SqlKind::Real => "REAL",
            SqlKind::Text => "TEXT",
            SqlKind::Blob => "BLOB",
        }
    }

    /// Classify the SQLite storage class name reported by
    /// `PRAGMA table_info` back into a `SqlKind`. Anything unrecognized
    /// (e.g. `NUMERIC`, a legacy affinity SQLite never emits for tables this
    /// crate created) is treated as `Text`, matching SQLite's own affinity
    /// fallback.
    pub fn from_sql_type_name(name: &str) -> SqlKind {
        let upper = name.to_uppercase();
        if upper.contains("INT") {
            SqlKind::Integer
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            SqlKind::Real
        } else if upper.contains("BLOB") {
            SqlKind::Blob
        } else {
            SqlKind::Text
        }
    }
}

/// A single column in a table's derived schema.
///
/// Equality and hashing intentionally ignore `default_literal` and
/// `declared_value_type` (spec §3.1): two columns that differ only in their
/// default or in which host type they're declared as are the same column as
/// far as the migration planner's set-diff is concerned.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub sql_kind: SqlKind,
    /// Purely informational — the Rust type the embedding application
    /// declared this field as (`"Option<String>"`, `"u64"`, ...). Useful in
    /// diagnostics, irrelevant to equality.
    pub declared_value_type: &'static str,
    pub nullable: bool,
    pub default_literal: Option<String>,
}

impl Column {
    pub fn new(name: impl Into<String>, sql_kind: SqlKind, nullable: bool) -> Self {
        Column {
            name: name.into(),
            sql_kind,
            declared_value_type: "",
            nullable,
            default_literal: None,
        }
    }

    pub fn with_default(mut self, literal: impl Into<String>) -> Self {
        self.default_literal = Some(literal.into());
        self
    }

    pub fn with_declared_type(mut self, ty: &'static str) -> Self {
        self.declared_value_type = ty;
        self
    }

    /// Render the column definition fragment used in `CREATE TABLE`.
    pub fn to_def_sql(&self) -> String {
        let null_sql = if self.nullable { "NULL" } else { "NOT NULL" };
        match &self.default_literal {
            Some(lit) => format!(
                "`{}` {} {} DEFAULT {}",
                self.name,
                self.sql_kind.as_sql(),
                null_sql,
                lit
            ),
            None => format!("`{}` {} {}", self.name, self.sql_kind.as_sql(), null_sql),
        }
    }
}

impl PartialEq for Column {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.sql_kind == other.sql_kind && self.nullable == other.nullable
    }
}

impl Eq for Column {}

impl Hash for Column {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.sql_kind.hash(state);
        self.nullable.hash(state);
    }
}

/// An index (or unique index) over one or more columns.
///
/// Two indexes with the same column tuple (in the same order) and the same
/// uniqueness flag are equal regardless of where they came from (target
/// schema vs. live `sqlite_master`) — the derived `name` is not part of
/// equality, only of display.
#[derive(Debug, Clone)]
pub struct IndexDescriptor {
    pub name: String,
    pub unique: bool,
    pub columns: Vec<String>,
}

impl IndexDescriptor {
    pub fn new(table: &str, unique: bool, columns: Vec<String>) -> Self {
        let name = derive_index_name(table, &columns);
        IndexDescriptor { name, unique, columns }
    }

    pub fn to_create_sql(&self, table: &str) -> String {
        let unique_sql = if self.unique { "UNIQUE " } else { "" };
        format!(
            "CREATE {}INDEX `{}` ON `{}` ({})",
            unique_sql,
            self.name,
            table,
            self.columns
                .iter()
                .map(|c| format!("`{c}`"))
                .collect::<Vec<_>>()
                .join(", ")
        )
    }

    pub fn to_drop_sql(&self) -> String {
        format!("DROP INDEX `{}`", self.name)
    }
}

impl PartialEq for IndexDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.unique == other.unique && self.columns == other.columns
    }
}

impl Eq for IndexDescriptor {}

impl Hash for IndexDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.unique.hash(state);
        self.columns.hash(state);
    }
}

/// Derive the stored index name: `"<table>+index+<joined-columns>"`.
pub fn derive_index_name(table: &str, columns: &[String]) -> String {
    format!("{table}+index+{}", columns.join("+"))
}

/// The full derived schema for one entity type.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<Column>,
    pub indexes: Vec<IndexDescriptor>,
    pub unique_indexes: Vec<IndexDescriptor>,
    pub settings_key: SettingsKey,
}

impl TableSchema {
    /// Every index, unique or not — used by the migration planner which
    /// doesn't care which bucket an index came from, only whether it
    /// matches what's live.
    pub fn all_indexes(&self) -> Vec<IndexDescriptor> {
        let mut all = self.indexes.clone();
        all.extend(self.unique_indexes.iter().cloned());
        all
    }

    /// `CREATE TABLE` DDL for a brand-new table.
    pub fn to_create_table_sql(&self) -> String {
        let col_defs: Vec<String> = self.columns.iter().map(Column::to_def_sql).collect();
        format!(
            "CREATE TABLE `{}` ({}, PRIMARY KEY (id))",
            self.name,
            col_defs.join(", ")
        )
    }

    pub fn column_by_name(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_equality_ignores_default_and_declared_type() {
        let a = Column::new("age", SqlKind::Integer, true).with_default("0");
        let b = Column::new("age", SqlKind::Integer, true)
            .with_default("1")
            .with_declared_type("Option<i32>");
        assert_eq!(a, b);
    }

    #[test]
    fn index_name_derivation() {
        assert_eq!(
            derive_index_name("users", &["email".to_string()]),
            "users+index+email"
        );
    }

    #[test]
    fn index_equality_ignores_source_order_of_the_index_set() {
        let a = IndexDescriptor::new("t", true, vec!["a".into(), "b".into()]);
        let b = IndexDescriptor::new("t", true, vec!["a".into(), "b".into()]);
        assert_eq!(a, b);

        let c = IndexDescriptor::new("t", true, vec!["b".into(), "a".into()]);
        assert_ne!(a, c, "column order within one index is significant");
    }

    #[test]
    fn sql_kind_from_type_name() {
        assert_eq!(SqlKind::from_sql_type_name("INTEGER"), SqlKind::Integer);
        assert_eq!(SqlKind::from_sql_type_name("VARCHAR(32)"), SqlKind::Text);
        assert_eq!(SqlKind::from_sql_type_name("REAL"), SqlKind::Real);
        assert_eq!(SqlKind::from_sql_type_name("BLOB"), SqlKind::Blob);
    }
}

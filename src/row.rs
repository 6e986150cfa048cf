//! Tabular row representation and the entity contract (components C4, C7).

use std::collections::BTreeMap;

use crate::id::AutoId;
use crate::schema::{Column, IndexDescriptor};
use crate::settings::SettingsKey;
use crate::value::Value;
use crate::Result;

/// A decoded or about-to-be-encoded row: column name to scalar value.
///
/// `BTreeMap` (rather than `HashMap`) keeps column order deterministic,
/// which matters for the blob-fallback JSON encoding of unknown complex
/// types (spec.md §6: "blob containing UTF-8 JSON with sorted keys").
pub type Row = BTreeMap<String, Value>;

/// The entity contract every persisted type implements.
///
/// Per the design notes (spec.md §9 "Reflection replacement"), this trait
/// replaces the teacher's dynamic field walk: an entity declares its column
/// list, indexes and encode/decode logic once, explicitly, rather than
/// having it inferred by runtime reflection. A `#[derive(Table)]` macro is
/// the natural way to generate this in a full build; this crate's core
/// takes the trait as the boundary and leaves the derive macro to the
/// embedding application (or a sibling `ormkit-derive` crate), matching the
/// "we specify the information it must yield, not how" framing in spec.md
/// §1 for host reflection machinery.
pub trait Table: Sized + Send + Sync + 'static {
    /// Table name. Non-empty, unique within a database file.
    fn table_name() -> &'static str;

    /// Ordered column list. Determines both the live-schema target for the
    /// migration planner (C6) and the positional bind order for batched
    /// inserts (C7).
    fn columns() -> Vec<Column>;

    /// Non-unique indexes. Defaults to none.
    fn indexes() -> Vec<IndexDescriptor> {
        Vec::new()
    }

    /// Unique indexes. Defaults to none.
    fn unique_indexes() -> Vec<IndexDescriptor> {
        Vec::new()
    }

    /// Which database file this table's rows live in.
    fn settings_key() -> SettingsKey {
        SettingsKey::Regular
    }

    /// The file within that settings key's group this table's rows live in.
    /// Tables sharing both a `settings_key()` and a `file_name()` share one
    /// connection actor (spec.md §3.4).
    fn file_name() -> &'static str {
        "main"
    }

    /// Current row id. `0` means "not yet assigned".
    fn id(&self) -> AutoId;

    /// Assign a row id (used by `create()` and by the decoder).
    fn set_id(&mut self, id: AutoId);

    /// Encode this instance into a [`Row`] following `Self::columns()`'s
    /// order. Complex/non-scalar fields are expected to have already been
    /// reduced to JSON-in-a-blob by the implementor (typically generated
    /// code delegates to `serde_json` for anything that isn't a plain
    /// scalar).
    fn to_row(&self) -> Row;

    /// Decode a [`Row`] into an instance. Implementors fall back to a
    /// type-appropriate default when a declared column is absent from
    /// `row` (spec.md §4.6: "If a scalar is missing, the decoder falls back
    /// to the type's own default initializer value").
    fn from_row(row: &Row) -> Result<Self>;

    /// Bespoke data migration, run once inside the same transaction as a
    /// table rebuild whenever the migration planner (`schema::migrate`)
    /// finds a column whose type or nullability changed. The default is a
    /// no-op: the planner's automatic same-name-column copy already moved
    /// everything it safely can, and most migrations never need more than
    /// that. Override this when a rename or a bespoke parse/fallback needs
    /// to happen instead (spec.md §4.5, end-to-end scenario 3).
    fn migrate(_conn: &rusqlite::Connection, _event: &crate::schema::ChangesEvent) -> Result<()> {
        Ok(())
    }
}

/// Build a `(?,?,...)`-shaped placeholder list of length `n` for an `IN`
/// clause. `n == 0` yields a literal that is always false (`''`) rather than
/// the syntactically invalid `()`, so callers that forget to short-circuit
/// an empty id list still get a harmless no-match query instead of a SQL
/// error (spec.md §8: "questionMarks(0) must yield a predicate that is
/// always false").
pub fn question_marks(n: usize) -> String {
    if n == 0 {
        "''".to_string()
    } else {
        std::iter::repeat("?").take(n).collect::<Vec<_>>().join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SqlKind;

    #[derive(Debug, Clone, PartialEq)]
    struct Widget {
        id: AutoId,
        name: String,
        weight: Option<f64>,
    }

    impl Table for Widget {
        fn table_name() -> &'static str {
            "widgets"
        }

        fn columns() -> Vec<Column> {
            vec![
                Column::new("id", SqlKind::Integer, false),
                Column::new("name", SqlKind::Text, false),
                Column::new("weight", SqlKind::Real, true),
            ]
        }

        fn id(&self) -> AutoId {
            self.id
        }

        fn set_id(&mut self, id: AutoId) {
            self.id = id;
        }

        fn to_row(&self) -> Row {
            let mut row = Row::new();
            row.insert("id".into(), Value::UInt64(self.id));
            row.insert("name".into(), Value::Text(self.name.clone()));
            row.insert(
                "weight".into(),
                self.weight.map(Value::Double).unwrap_or(Value::Null),
            );
            row
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Widget {
                id: row.get("id").map(|v| v.as_u64()).transpose()?.unwrap_or(0),
                name: row
                    .get("name")
                    .map(|v| v.as_text())
                    .transpose()?
                    .unwrap_or_default(),
                weight: match row.get("weight") {
                    Some(Value::Null) | None => None,
                    Some(v) => Some(v.as_f64()?),
                },
            })
        }
    }

    #[test]
    fn encode_then_decode_recovers_fields() {
        let w = Widget {
            id: 42,
            name: "cog".into(),
            weight: Some(1.5),
        };
        let row = w.to_row();
        let back = Widget::from_row(&row).unwrap();
        assert_eq!(w, back);
    }

    #[test]
    fn missing_column_falls_back_to_default() {
        let mut row = Row::new();
        row.insert("id".into(), Value::UInt64(7));
        let w = Widget::from_row(&row).unwrap();
        assert_eq!(w.name, "");
        assert_eq!(w.weight, None);
    }

    #[test]
    fn question_marks_zero_is_a_false_literal() {
        assert_eq!(question_marks(0), "''");
    }

    #[test]
    fn question_marks_n_has_length_n() {
        assert_eq!(question_marks(3), "?,?,?");
    }
}

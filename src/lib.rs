//! ormkit — automatic object-persistence engine over embedded SQLite.
//!
//! The crate derives a table schema from an entity description, migrates a
//! live database towards it, and keeps at most one live in-process
//! representative per `(type, id)` pair while it does so. On top of that it
//! offers one-to-one and one-to-many relations, a paginated query-backed
//! relation, and a lazily-populated FTS5 full-text column.
//!
//! See `DESIGN.md` in the repository root for the module-by-module grounding
//! ledger.

pub mod codec;
pub mod concurrency;
pub mod db;
pub mod error;
pub mod fts;
pub mod id;
pub mod manager;
pub mod relations;
pub mod row;
pub mod schema;
pub mod settings;
pub mod value;

pub use error::{Error, Result};
pub use fts::FtsColumn;
pub use id::AutoId;
pub use manager::{Manager, Model};
pub use relations::{ManyRelation, OneRelation, RelationQuery};
pub use row::{Row, Table};
pub use value::Value;

/// Crate version, surfaced for diagnostics and support reports.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Schema reflection and migration (components C5, C6).

pub mod migrate;
pub mod reflect;

pub use migrate::{run_migration, ChangesEvent, MigrationState};
pub use reflect::{Column, IndexDescriptor, SqlKind, TableSchema};

//! Error types for ormkit.

use thiserror::Error;

/// Result type alias for ormkit operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for ormkit.
#[derive(Error, Debug)]
pub enum Error {
    /// Wraps every error the embedded SQL engine can report that ormkit
    /// doesn't add its own context to (a plain prepare/step failure).
    /// Higher-level variants below exist for cases ormkit detects itself or
    /// enriches (busy-retry exhaustion, unique violations with conflicting
    /// ids, missing ids).
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("failed to open database: {0}")]
    OpenFailed(String),

    #[error("database is closed")]
    DatabaseClosed,

    #[error("query execution failed after retrying busy/locked: {0}")]
    QueryExecutionFailed(String),

    #[error("invalid bind argument: {0}")]
    BadArgument(String),

    #[error("failed to extract query result: {0}")]
    BadResult(String),

    #[error("unique constraint failed, conflicting ids: {0:?}")]
    UniqueConstraintFailed(Vec<crate::id::AutoId>),

    #[error("value query returned no row")]
    FetchError,

    #[error("missing id (id is 0 or the row was not found)")]
    MissingId,

    #[error("table was never set up: {0}")]
    MissingSetup(String),

    #[error("related record was never saved")]
    MissingRelation,

    #[error("FTS5 is not available in this SQLite build")]
    NoFtsSupport,

    #[error("cannot add non-null URL column '{0}' without a default")]
    ImpossibleUrlMigration(String),

    #[error("migration step failed: {0}")]
    MigrationFailed(String),

    #[error("JSON (de)serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid settings: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the underlying rusqlite error is SQLITE_BUSY or SQLITE_LOCKED,
    /// i.e. the class of error the database actor retries locally (see
    /// `db::actor`) rather than surfacing immediately.
    pub fn is_busy_or_locked(&self) -> bool {
        match self {
            Error::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Whether the underlying rusqlite error is a unique-constraint
    /// violation (`SQLITE_CONSTRAINT_UNIQUE` / `SQLITE_CONSTRAINT_PRIMARYKEY`).
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Error::Database(rusqlite::Error::SqliteFailure(e, _)) => {
                matches!(e.code, rusqlite::ErrorCode::ConstraintViolation)
            }
            _ => false,
        }
    }
}

//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    /// A version-checked write lost against a concurrent writer.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A stored value could not be decoded into its domain type.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for gantry_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(what) => gantry_core::Error::NotFound(what),
            DbError::Conflict(what) => gantry_core::Error::ConcurrentModification(what),
            other => gantry_core::Error::Internal(other.to_string()),
        }
    }
}

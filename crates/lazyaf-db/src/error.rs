//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for lazyaf_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => lazyaf_core::Error::NotFound(msg),
            DbError::Conflict(msg) => lazyaf_core::Error::Conflict(msg),
            DbError::Corrupt(msg) => lazyaf_core::Error::Internal(msg),
            DbError::Sqlx(e) => lazyaf_core::Error::Infrastructure(e.to_string()),
            DbError::Migration(e) => lazyaf_core::Error::Infrastructure(e.to_string()),
        }
    }
}

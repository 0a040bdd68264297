//! Typed error type for the db crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("row not found")]
    NotFound,

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A conditional write lost a race (e.g. two concurrent revisions).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid pagination cursor '{0}'")]
    InvalidCursor(String),
}

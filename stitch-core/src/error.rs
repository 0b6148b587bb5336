use thiserror::Error;

/// Errors surfaced by a [`crate::store::StitchStore`] implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    Connection { error: sqlx::Error },
    #[error("failed to begin transaction: {error}")]
    BeginTransaction { error: sqlx::Error },
    #[error("failed to commit transaction: {error}")]
    CommitTransaction { error: sqlx::Error },
    #[error("failed to roll back transaction: {error}")]
    RollbackTransaction { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    Query {
        command: &'static str,
        error: sqlx::Error,
    },
    #[error("store rejected the operation: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

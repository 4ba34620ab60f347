//! Connection pool error types.

use thiserror::Error;

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors that can occur while borrowing from or closing a pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("connection pool {pool} exhausted (max active: {max_active})")]
    Exhausted { pool: String, max_active: usize },

    #[error("failed to create connection for pool {pool}: {source}")]
    FactoryCreateFailed {
        pool: String,
        #[source]
        source: anyhow::Error,
    },

    /// Internal signal: a connection failed validation and was destroyed.
    /// `borrow` recovers from it instead of returning it.
    #[error("connection failed validation in pool {pool}")]
    ValidationFailed { pool: String },

    #[error("failed to close connection pool {pool}: {reason}")]
    CloseFailed { pool: String, reason: String },

    #[error("connection pool {pool} is closed")]
    Closed { pool: String },
}

impl PoolError {
    /// Label of the pool that produced the error.
    pub fn pool(&self) -> &str {
        match self {
            PoolError::Exhausted { pool, .. }
            | PoolError::FactoryCreateFailed { pool, .. }
            | PoolError::ValidationFailed { pool }
            | PoolError::CloseFailed { pool, .. }
            | PoolError::Closed { pool } => pool,
        }
    }
}

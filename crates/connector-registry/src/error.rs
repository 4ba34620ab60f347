//! Registry error types.

use connector_pool::PoolError;
use thiserror::Error;

use crate::key::ConnectionKey;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors returned by [`ConnectionRegistry`](crate::ConnectionRegistry).
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("connection `{0}` does not exist")]
    NotFound(ConnectionKey),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

//! Pool lifecycle events.
//!
//! Return and close never fail, so problems on those paths are logged and,
//! when a sender is attached, published here as well. Publishing is
//! fire-and-forget: a lagging or absent subscriber never affects the pool.

use std::fmt;

use tokio::sync::broadcast;

use crate::config::ExhaustedAction;

/// Default capacity for event channels created by owners of many pools.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Why a connection was destroyed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DestroyReason {
    /// Validation failed on borrow, on return, or during an eviction sweep.
    FailedValidation,
    /// Idle past the eviction threshold.
    IdleTimeout,
    /// Returned while `max_idle` connections were already idle.
    IdleCapacity,
    /// The pool was closed.
    PoolClosed,
    /// The borrow or return handling it was cancelled or panicked.
    Abandoned,
}

impl fmt::Display for DestroyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestroyReason::FailedValidation => write!(f, "failed-validation"),
            DestroyReason::IdleTimeout => write!(f, "idle-timeout"),
            DestroyReason::IdleCapacity => write!(f, "idle-capacity"),
            DestroyReason::PoolClosed => write!(f, "pool-closed"),
            DestroyReason::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Something that happened inside a pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PoolEvent {
    Created {
        pool: String,
    },
    Destroyed {
        pool: String,
        reason: DestroyReason,
    },
    DestroyFailed {
        pool: String,
        reason: DestroyReason,
        error: String,
    },
    Exhausted {
        pool: String,
        action: ExhaustedAction,
    },
    Closed {
        pool: String,
    },
    CloseFailed {
        pool: String,
        error: String,
    },
}

impl PoolEvent {
    /// Label of the pool the event came from.
    pub fn pool(&self) -> &str {
        match self {
            PoolEvent::Created { pool }
            | PoolEvent::Destroyed { pool, .. }
            | PoolEvent::DestroyFailed { pool, .. }
            | PoolEvent::Exhausted { pool, .. }
            | PoolEvent::Closed { pool }
            | PoolEvent::CloseFailed { pool, .. } => pool,
        }
    }
}

/// Create an event channel suitable for [`ConnectionPool::with_events`].
///
/// [`ConnectionPool::with_events`]: crate::ConnectionPool::with_events
pub fn channel() -> (broadcast::Sender<PoolEvent>, broadcast::Receiver<PoolEvent>) {
    broadcast::channel(EVENT_CHANNEL_CAPACITY)
}

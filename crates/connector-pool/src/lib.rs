//! connector-pool — bounded pools of connector resources.
//!
//! A connector supplies a [`ConnectionFactory`] that knows how to create,
//! validate and destroy its resources. A [`ConnectionPool`] wraps that
//! factory with capacity limits, validation, an exhaustion policy and
//! optional background idle eviction.
//!
//! # Architecture
//!
//! ```text
//! ConnectionPool
//!   ├── ConnectionFactory (create / validate / destroy)
//!   ├── PoolConfig (resolved limits, timeouts, policies)
//!   ├── Idle set (oldest-idle first) + active count
//!   ├── Eviction task (every eviction_check_interval)
//!   │   ├── sweep num_tests_per_eviction_run oldest idle connections
//!   │   └── replenish up to min_idle
//!   └── Optional PoolEvent broadcast
//! ```
//!
//! # Exhaustion
//!
//! When `max_active` connections are borrowed and none are idle, `borrow`
//! follows the pool's [`ExhaustedAction`]: fail immediately, block up to
//! `max_wait_time`, or grow past the limit.

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod pool;

pub use config::{ExhaustedAction, PoolConfig};
pub use connection::{Connection, ConnectionFactory, downcast_arc};
pub use error::{PoolError, PoolResult};
pub use events::{DestroyReason, PoolEvent};
pub use pool::{ConnectionPool, PoolState, PoolStats};

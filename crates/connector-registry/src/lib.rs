//! connector-registry — process-wide keyed registry of connection pools.
//!
//! Connector modules register either a pool (a [`ConnectionFactory`] plus a
//! [`PoolConfig`]) or a single shared connection under a
//! `(connector, name)` key, then acquire and release connections by key.
//!
//! # Architecture
//!
//! ```text
//! ConnectionRegistry (global() or new())
//!   ├── DashMap<ConnectionKey, RegistryEntry>
//!   │   ├── Pool(Arc<ConnectionPool>)   → borrow / return_connection
//!   │   └── Single(Arc<dyn Connection>) → returned as-is, release is a no-op
//!   ├── PoolEvent broadcast shared by every registered pool
//!   └── shutdown() → close every pool, best effort
//! ```
//!
//! [`ConnectionFactory`]: connector_pool::ConnectionFactory
//! [`PoolConfig`]: connector_pool::PoolConfig

pub mod error;
pub mod key;
pub mod registry;

pub use error::{RegistryError, RegistryResult};
pub use key::ConnectionKey;
pub use registry::{ConnectionRegistry, RegistryEntry, ShutdownSummary};

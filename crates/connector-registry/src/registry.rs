//! Keyed registry of connection pools and single connections.
//!
//! Connectors register a pool (factory + config) or a single shared
//! connection under `(connector, name)`, then `acquire` and `release`
//! connections by key. `shutdown` closes every registered pool.

use std::fmt;
use std::sync::{Arc, OnceLock};

use connector_pool::{
    Connection, ConnectionFactory, ConnectionPool, PoolConfig, PoolError, PoolEvent, PoolStats,
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::error::{RegistryError, RegistryResult};
use crate::key::ConnectionKey;

static GLOBAL: OnceLock<ConnectionRegistry> = OnceLock::new();

/// What a key resolves to.
#[derive(Clone, Debug)]
pub enum RegistryEntry {
    Pool(Arc<ConnectionPool>),
    Single(Arc<dyn Connection>),
}

/// Outcome of [`ConnectionRegistry::shutdown`].
#[derive(Debug, Default)]
pub struct ShutdownSummary {
    /// Pools that closed cleanly.
    pub closed: Vec<ConnectionKey>,
    /// Pools whose close reported an error. They are closed regardless.
    pub failed: Vec<(ConnectionKey, PoolError)>,
}

impl ShutdownSummary {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Keyed store of pools and single connections shared by connectors.
pub struct ConnectionRegistry {
    entries: DashMap<ConnectionKey, RegistryEntry>,
    /// Events from every pool registered here.
    events: broadcast::Sender<PoolEvent>,
}

impl ConnectionRegistry {
    /// Create an independent registry.
    pub fn new() -> Self {
        let (events, _) = connector_pool::events::channel();
        Self {
            entries: DashMap::new(),
            events,
        }
    }

    /// The process-wide registry, created on first use.
    pub fn global() -> &'static ConnectionRegistry {
        GLOBAL.get_or_init(|| {
            debug!("initializing process-wide connection registry");
            ConnectionRegistry::new()
        })
    }

    /// Register a pool under `(connector, name)` unless the key is taken.
    ///
    /// The pool (and its eviction task) is only built when the key is vacant,
    /// so a losing registration never calls the factory.
    pub fn register_pool(
        &self,
        connector: &str,
        name: &str,
        factory: Arc<dyn ConnectionFactory>,
        config: PoolConfig,
    ) {
        let key = ConnectionKey::new(connector, name);
        match self.entries.entry(key) {
            Entry::Occupied(entry) => {
                debug!(key = %entry.key(), "connection already registered, keeping existing entry");
            }
            Entry::Vacant(entry) => {
                let label = entry.key().to_string();
                let pool = ConnectionPool::with_events(
                    label.as_str(),
                    factory,
                    config,
                    self.events.clone(),
                );
                entry.insert(RegistryEntry::Pool(Arc::new(pool)));
                info!(key = %label, "registered connection pool");
            }
        }
    }

    /// Register a single shared connection unless the key is taken.
    pub fn register_single(&self, connector: &str, name: &str, connection: Arc<dyn Connection>) {
        let key = ConnectionKey::new(connector, name);
        match self.entries.entry(key) {
            Entry::Occupied(entry) => {
                debug!(key = %entry.key(), "connection already registered, keeping existing entry");
            }
            Entry::Vacant(entry) => {
                info!(key = %entry.key(), "registered single connection");
                entry.insert(RegistryEntry::Single(connection));
            }
        }
    }

    /// Get a connection by key: the stored connection for a single entry,
    /// a borrowed one for a pool.
    pub async fn acquire(&self, connector: &str, name: &str) -> RegistryResult<Arc<dyn Connection>> {
        let key = ConnectionKey::new(connector, name);
        // Clone out of the map so no shard lock is held across the borrow.
        let entry = self
            .entries
            .get(&key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RegistryError::NotFound(key.clone()))?;

        match entry {
            RegistryEntry::Single(connection) => Ok(connection),
            RegistryEntry::Pool(pool) => {
                debug!(%key, "acquiring pooled connection");
                Ok(pool.borrow().await?)
            }
        }
    }

    /// Hand a connection back. Pool entries run the pool's return protocol;
    /// single entries and unknown keys are a no-op. Never fails.
    pub async fn release(&self, connector: &str, name: &str, connection: Arc<dyn Connection>) {
        let key = ConnectionKey::new(connector, name);
        match self.pool_for(&key) {
            Some(pool) => pool.return_connection(connection).await,
            None => debug!(%key, "release ignored, no pool registered under key"),
        }
    }

    pub fn exists(&self, connector: &str, name: &str) -> bool {
        self.entries.contains_key(&ConnectionKey::new(connector, name))
    }

    /// The pool registered under `(connector, name)`, if the entry is a pool.
    pub fn pool(&self, connector: &str, name: &str) -> Option<Arc<ConnectionPool>> {
        self.pool_for(&ConnectionKey::new(connector, name))
    }

    /// Statistics for a pool entry.
    pub async fn stats(&self, connector: &str, name: &str) -> Option<PoolStats> {
        let pool = self.pool(connector, name)?;
        Some(pool.stats().await)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Subscribe to events from every pool registered through this registry.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Close every registered pool.
    ///
    /// Best effort: a pool that fails to close is logged and recorded, and
    /// the rest are still closed. Entries stay registered; their pools reject
    /// further borrows.
    pub async fn shutdown(&self) -> ShutdownSummary {
        let mut pools: Vec<(ConnectionKey, Arc<ConnectionPool>)> = self
            .entries
            .iter()
            .filter_map(|entry| match entry.value() {
                RegistryEntry::Pool(pool) => Some((entry.key().clone(), pool.clone())),
                RegistryEntry::Single(_) => None,
            })
            .collect();
        pools.sort_by(|a, b| a.0.cmp(&b.0));

        info!(pools = pools.len(), "shutting down connection registry");

        let mut summary = ShutdownSummary::default();
        for (key, pool) in pools {
            match pool.close().await {
                Ok(()) => summary.closed.push(key),
                Err(e) => {
                    error!(%key, error = %e, "failed to close connection pool");
                    summary.failed.push((key, e));
                }
            }
        }

        info!(
            closed = summary.closed.len(),
            failed = summary.failed.len(),
            "connection registry shut down"
        );
        summary
    }

    fn pool_for(&self, key: &ConnectionKey) -> Option<Arc<ConnectionPool>> {
        match self.entries.get(key)?.value() {
            RegistryEntry::Pool(pool) => Some(pool.clone()),
            RegistryEntry::Single(_) => None,
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

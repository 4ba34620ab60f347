//! Idle eviction: the sweep, min-idle replenishment and the background loop
//! that runs both every `eviction_check_interval`.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{IdleConnection, Shared};
use crate::events::DestroyReason;

/// How long `close` waits for an in-flight sweep before aborting the task.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Handle to a pool's background eviction task.
pub(super) struct EvictionTask {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl EvictionTask {
    /// Spawn the eviction loop on the current runtime.
    ///
    /// Returns `None` (eviction disabled) when called outside a runtime.
    pub(super) fn spawn(shared: &Arc<Shared>, interval: Duration) -> Option<Self> {
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(pool = %shared.label, "no tokio runtime, idle eviction disabled");
                return None;
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let label = shared.label.clone();
        let shared = Arc::downgrade(shared);

        let handle = runtime.spawn(async move {
            run_eviction_loop(&label, shared, interval, shutdown_rx).await;
        });

        Some(Self {
            handle,
            shutdown_tx,
        })
    }

    #[cfg(any(test, feature = "test-util"))]
    pub(super) fn from_handle(handle: JoinHandle<()>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            handle,
            shutdown_tx,
        }
    }

    /// Signal shutdown and wait for the loop to exit.
    ///
    /// Errors only if the task panicked.
    pub(super) async fn stop(self, label: &str) -> Result<(), String> {
        let _ = self.shutdown_tx.send(true);
        let mut handle = self.handle;

        match tokio::time::timeout(STOP_GRACE, &mut handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.is_panic() => Err(format!("eviction task panicked: {e}")),
            Ok(Err(_)) => Ok(()),
            Err(_) => {
                warn!(pool = %label, "eviction task did not stop in time, aborting");
                handle.abort();
                Ok(())
            }
        }
    }
}

/// The eviction loop for a single pool. Exits on shutdown or once the pool
/// has been dropped.
async fn run_eviction_loop(
    label: &str,
    shared: Weak<Shared>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(pool = %label, ?interval, "eviction loop starting");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                let evicted = shared.evict().await;
                shared.ensure_min_idle().await;
                if evicted > 0 {
                    debug!(pool = %label, evicted, "eviction sweep finished");
                }
            }
            _ = shutdown.changed() => {
                debug!(pool = %label, "eviction loop shutting down");
                break;
            }
        }
    }
}

impl Shared {
    /// One eviction sweep over the oldest idle connections.
    pub(super) async fn evict(&self) -> usize {
        let config = &self.config;
        let (candidates, mut idle_count) = {
            let mut inner = self.state.lock().await;
            if self.is_closed() {
                return 0;
            }
            let total = inner.idle.len();
            let take = config.num_tests_per_eviction_run().min(total);
            (inner.idle.drain(..take).collect::<Vec<_>>(), total)
        };
        if candidates.is_empty() {
            return 0;
        }

        let min_idle = config.min_idle();
        let now = Instant::now();
        let mut kept = Vec::with_capacity(candidates.len());
        let mut evicted = 0;

        for entry in candidates {
            if config.test_while_idle() && !self.validate(&entry.connection) {
                self.destroy(entry.connection, DestroyReason::FailedValidation);
                evicted += 1;
                idle_count -= 1;
                continue;
            }

            // Connections that keep the pool at min_idle use the soft threshold.
            let threshold = if idle_count > min_idle {
                config.min_eviction_time()
            } else {
                config.soft_min_evictable_idle_time()
            };
            let idle_for = now.saturating_duration_since(entry.idle_since);

            if threshold.is_some_and(|threshold| idle_for > threshold) {
                debug!(pool = %self.label, ?idle_for, "evicting idle connection");
                self.destroy(entry.connection, DestroyReason::IdleTimeout);
                evicted += 1;
                idle_count -= 1;
            } else {
                kept.push(entry);
            }
        }

        // Returns during the sweep may have refilled the idle set; kept
        // candidates are the oldest, so they give way first.
        let (orphaned, reason) = {
            let mut inner = self.state.lock().await;
            if self.is_closed() {
                (kept, DestroyReason::PoolClosed)
            } else {
                let room = config.max_idle().saturating_sub(inner.idle.len());
                let surplus: Vec<IdleConnection> =
                    kept.drain(..kept.len().saturating_sub(room)).collect();
                for entry in kept.into_iter().rev() {
                    inner.idle.push_front(entry);
                }
                (surplus, DestroyReason::IdleCapacity)
            }
        };
        if reason == DestroyReason::IdleCapacity {
            evicted += orphaned.len();
        }
        for entry in orphaned {
            self.destroy(entry.connection, reason);
        }

        self.available.notify_waiters();
        evicted
    }

    /// Create idle connections until `min_idle` is reached, never exceeding
    /// `max_active` in total. Stops at the first factory failure.
    pub(super) async fn ensure_min_idle(&self) {
        let min_idle = self.config.min_idle();
        let max_active = self.config.max_active();

        for _ in 0..min_idle {
            {
                let inner = self.state.lock().await;
                if self.is_closed()
                    || inner.idle.len() >= min_idle
                    || self.active() + inner.idle.len() >= max_active
                {
                    return;
                }
            }

            let connection = match self.create() {
                Ok(connection) => connection,
                Err(e) => {
                    warn!(pool = %self.label, error = %e, "failed to replenish idle connections");
                    return;
                }
            };

            let mut inner = self.state.lock().await;
            if self.is_closed() {
                drop(inner);
                self.destroy(connection, DestroyReason::PoolClosed);
                return;
            }
            inner.idle.push_back(IdleConnection::new(connection));
            drop(inner);
            self.available.notify_one();
        }
    }
}

//! Bounded connection pool over a single [`ConnectionFactory`].
//!
//! # Architecture
//!
//! ```text
//! borrow()
//!   → pool closed                       → Err(Closed)
//!   → idle connection available (LIFO)  → validate if test_on_borrow → return it
//!   → active < max_active               → factory.create() → return it
//!   → exhausted                         → FAIL: Err(Exhausted)
//!                                         BLOCK: wait for a slot (max_wait_time)
//!                                         GROW: factory.create() anyway
//!
//! return_connection(conn)
//!   → pool closed / invalid / idle full → factory.destroy()
//!   → otherwise                         → push onto idle set, wake one waiter
//! ```
//!
//! The idle set sits behind a single async mutex. Factory calls never happen
//! while it is held. Every unit of `active` capacity is held by a
//! [`Reservation`], so a cancelled or panicking borrow or return gives its
//! slot back. The optional eviction task lives in [`eviction`].

mod eviction;

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use tokio::sync::{Mutex, Notify, broadcast};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{ExhaustedAction, PoolConfig};
use crate::connection::{Connection, ConnectionFactory};
use crate::error::{PoolError, PoolResult};
use crate::events::{DestroyReason, PoolEvent};

use self::eviction::EvictionTask;

/// Lifecycle state of a pool. `Closed` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PoolState {
    Open,
    Closed,
}

/// Point-in-time statistics for one pool.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Connections currently borrowed.
    pub active: usize,
    /// Connections sitting idle in the pool.
    pub idle: usize,
    /// Connections created by the factory over the pool's lifetime.
    pub created: u64,
    /// Connections destroyed over the pool's lifetime.
    pub destroyed: u64,
    /// Number of borrows that had to wait for a connection.
    pub wait_count: u64,
}

/// An idle connection and the instant it was returned.
struct IdleConnection {
    connection: Arc<dyn Connection>,
    idle_since: Instant,
}

impl IdleConnection {
    fn new(connection: Arc<dyn Connection>) -> Self {
        Self {
            connection,
            idle_since: Instant::now(),
        }
    }
}

/// Idle bookkeeping, guarded by `Shared::state`.
struct PoolInner {
    /// Idle connections, oldest-idle at the front.
    idle: VecDeque<IdleConnection>,
    wait_count: u64,
}

/// State shared between the pool handle and its eviction task.
struct Shared {
    label: String,
    factory: Arc<dyn ConnectionFactory>,
    config: PoolConfig,
    state: Mutex<PoolInner>,
    /// Borrowed connections plus slots reserved for in-flight creation.
    /// Only incremented with `state` held.
    active: AtomicUsize,
    /// Set once, with `state` held.
    closed: AtomicBool,
    /// Signalled whenever a slot or idle connection may have become available.
    available: Notify,
    created: AtomicU64,
    destroyed: AtomicU64,
    events: Option<broadcast::Sender<PoolEvent>>,
}

/// One unit of `active` capacity.
///
/// Dropping a reservation that was not committed gives the slot back, wakes
/// one waiter and destroys any connection it still holds.
struct Reservation<'a> {
    shared: &'a Shared,
    connection: Option<Arc<dyn Connection>>,
    committed: bool,
}

impl<'a> Reservation<'a> {
    /// Take a new slot. Callers hold the state lock.
    fn reserve(shared: &'a Shared) -> Self {
        shared.active.fetch_add(1, Ordering::SeqCst);
        Self {
            shared,
            connection: None,
            committed: false,
        }
    }

    /// Adopt the slot of a connection coming back from its borrower.
    fn returning(shared: &'a Shared, connection: Arc<dyn Connection>) -> Self {
        Self {
            shared,
            connection: Some(connection),
            committed: false,
        }
    }

    fn connection(&self) -> Option<&Arc<dyn Connection>> {
        self.connection.as_ref()
    }

    fn take(&mut self) -> Option<Arc<dyn Connection>> {
        self.connection.take()
    }

    /// Keep the slot: the connection now belongs to a borrower.
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Some(connection) = self.connection.take() {
            self.shared.destroy(connection, DestroyReason::Abandoned);
        }
        let _ = self
            .shared
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
        self.shared.available.notify_one();
    }
}

/// Outcome of the locked part of a borrow attempt.
enum Slot<'a> {
    Idle(Arc<dyn Connection>, Reservation<'a>),
    Create(Reservation<'a>),
    Wait,
}

impl Shared {
    fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn emit(&self, event: PoolEvent) {
        if let Some(events) = &self.events {
            // No subscribers is fine.
            let _ = events.send(event);
        }
    }

    /// Run the factory's validation; a panic counts as invalid.
    fn validate(&self, connection: &Arc<dyn Connection>) -> bool {
        match panic::catch_unwind(AssertUnwindSafe(|| self.factory.validate(connection.as_ref()))) {
            Ok(valid) => valid,
            Err(_) => {
                warn!(pool = %self.label, "connection validation panicked, treating as invalid");
                false
            }
        }
    }

    /// Hand out an idle connection, validating it first when `test_on_borrow`
    /// is set. An invalid connection is destroyed and reported as
    /// [`PoolError::ValidationFailed`].
    fn check_out(&self, connection: Arc<dyn Connection>) -> PoolResult<Arc<dyn Connection>> {
        if !self.config.test_on_borrow() || self.validate(&connection) {
            debug!(pool = %self.label, "reused idle connection");
            return Ok(connection);
        }
        self.destroy(connection, DestroyReason::FailedValidation);
        Err(PoolError::ValidationFailed {
            pool: self.label.clone(),
        })
    }

    /// Create a connection through the factory, counting it. A panic in the
    /// factory is reported as an error.
    fn create(&self) -> anyhow::Result<Arc<dyn Connection>> {
        let connection = match panic::catch_unwind(AssertUnwindSafe(|| self.factory.create())) {
            Ok(created) => created?,
            Err(_) => anyhow::bail!("connection factory panicked"),
        };
        self.created.fetch_add(1, Ordering::Relaxed);
        self.emit(PoolEvent::Created {
            pool: self.label.clone(),
        });
        Ok(connection)
    }

    /// Destroy a connection. Failures are logged and published, never returned.
    fn destroy(&self, connection: Arc<dyn Connection>, reason: DestroyReason) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.factory.destroy(connection)));
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(_) => Some("destroy panicked".to_string()),
        };

        match failure {
            None => {
                debug!(pool = %self.label, %reason, "destroyed connection");
                self.emit(PoolEvent::Destroyed {
                    pool: self.label.clone(),
                    reason,
                });
            }
            Some(error) => {
                error!(pool = %self.label, %reason, %error, "failed to destroy connection");
                self.emit(PoolEvent::DestroyFailed {
                    pool: self.label.clone(),
                    reason,
                    error,
                });
            }
        }
    }

    /// Fill a reserved slot with a freshly created connection. Any early
    /// return drops `slot`, which gives the capacity back.
    fn create_for_slot(&self, slot: Reservation<'_>) -> PoolResult<Arc<dyn Connection>> {
        let connection = match self.create() {
            Ok(connection) => connection,
            Err(source) => {
                warn!(pool = %self.label, error = %source, "connection factory failed");
                return Err(PoolError::FactoryCreateFailed {
                    pool: self.label.clone(),
                    source,
                });
            }
        };

        if self.config.test_on_borrow() && !self.validate(&connection) {
            self.destroy(connection, DestroyReason::FailedValidation);
            return Err(PoolError::FactoryCreateFailed {
                pool: self.label.clone(),
                source: anyhow::anyhow!("newly created connection failed validation"),
            });
        }

        if self.is_closed() {
            self.destroy(connection, DestroyReason::PoolClosed);
            return Err(self.closed_error());
        }

        slot.commit();
        debug!(pool = %self.label, "created new connection");
        Ok(connection)
    }

    fn exhausted_error(&self) -> PoolError {
        let action = self.config.exhausted_action();
        warn!(pool = %self.label, %action, max_active = self.config.max_active(), "connection pool exhausted");
        self.emit(PoolEvent::Exhausted {
            pool: self.label.clone(),
            action,
        });
        PoolError::Exhausted {
            pool: self.label.clone(),
            max_active: self.config.max_active(),
        }
    }

    fn closed_error(&self) -> PoolError {
        PoolError::Closed {
            pool: self.label.clone(),
        }
    }
}

/// A bounded pool of connections produced by one factory.
///
/// Created `Open`; [`close`](Self::close) moves it to `Closed` exactly once.
/// Borrowed connections are not reclaimed by close: their eventual return is
/// destroyed instead of pooled.
pub struct ConnectionPool {
    shared: Arc<Shared>,
    eviction: Mutex<Option<EvictionTask>>,
}

impl ConnectionPool {
    /// Create a pool. Spawns the eviction task when
    /// `eviction_check_interval` is set, which requires a tokio runtime.
    pub fn new(
        label: impl Into<String>,
        factory: Arc<dyn ConnectionFactory>,
        config: PoolConfig,
    ) -> Self {
        Self::build(label.into(), factory, config, None)
    }

    /// Create a pool that publishes [`PoolEvent`]s on `events`.
    pub fn with_events(
        label: impl Into<String>,
        factory: Arc<dyn ConnectionFactory>,
        config: PoolConfig,
        events: broadcast::Sender<PoolEvent>,
    ) -> Self {
        Self::build(label.into(), factory, config, Some(events))
    }

    fn build(
        label: String,
        factory: Arc<dyn ConnectionFactory>,
        config: PoolConfig,
        events: Option<broadcast::Sender<PoolEvent>>,
    ) -> Self {
        let interval = config.eviction_check_interval();
        let shared = Arc::new(Shared {
            label,
            factory,
            config,
            state: Mutex::new(PoolInner {
                idle: VecDeque::new(),
                wait_count: 0,
            }),
            active: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            available: Notify::new(),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            events,
        });

        let eviction = interval.and_then(|interval| EvictionTask::spawn(&shared, interval));

        info!(
            pool = %shared.label,
            max_active = shared.config.max_active(),
            max_idle = shared.config.max_idle(),
            exhausted_action = %shared.config.exhausted_action(),
            eviction = eviction.is_some(),
            "connection pool created"
        );

        Self {
            shared,
            eviction: Mutex::new(eviction),
        }
    }

    /// Label used in logs, events and errors (the registry uses `connector:name`).
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Borrow a connection.
    ///
    /// Prefers the most recently returned idle connection, then a new one
    /// from the factory, then applies the configured [`ExhaustedAction`].
    /// Cancelling the returned future never leaks pool capacity.
    pub async fn borrow(&self) -> PoolResult<Arc<dyn Connection>> {
        let shared = &self.shared;
        let config = &shared.config;
        debug!(pool = %shared.label, "borrowing connection");

        // A wait too long to represent as a deadline is no deadline at all.
        let deadline = config
            .max_wait_time()
            .and_then(|wait| Instant::now().checked_add(wait));
        let mut waited = false;

        loop {
            // Register interest before inspecting state so a return between
            // the check and the wait is not missed.
            let notified = shared.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let slot = {
                let mut inner = shared.state.lock().await;
                if shared.is_closed() {
                    return Err(shared.closed_error());
                }

                if let Some(idle) = inner.idle.pop_back() {
                    Slot::Idle(idle.connection, Reservation::reserve(shared))
                } else if shared.active() < config.max_active() {
                    Slot::Create(Reservation::reserve(shared))
                } else {
                    match config.exhausted_action() {
                        ExhaustedAction::Fail => {
                            drop(inner);
                            return Err(shared.exhausted_error());
                        }
                        ExhaustedAction::Grow => Slot::Create(Reservation::reserve(shared)),
                        ExhaustedAction::Block => {
                            if !waited {
                                inner.wait_count += 1;
                                waited = true;
                            }
                            Slot::Wait
                        }
                    }
                }
            };

            match slot {
                Slot::Idle(connection, slot) => {
                    return match shared.check_out(connection) {
                        Ok(connection) => {
                            slot.commit();
                            Ok(connection)
                        }
                        Err(PoolError::ValidationFailed { .. }) => {
                            debug!(pool = %shared.label, "idle connection failed validation, replacing it");
                            shared.create_for_slot(slot)
                        }
                        Err(e) => Err(e),
                    };
                }
                Slot::Create(slot) => return shared.create_for_slot(slot),
                Slot::Wait => {
                    debug!(pool = %shared.label, "pool exhausted, waiting for a connection");
                    match deadline {
                        Some(deadline) => {
                            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                                return Err(shared.exhausted_error());
                            }
                        }
                        None => notified.await,
                    }
                }
            }
        }
    }

    /// Return a borrowed connection.
    ///
    /// Never fails: a connection that cannot be pooled (pool closed, failed
    /// `test_on_return`, idle set full) is destroyed instead. If the future is
    /// cancelled before the connection is pooled, it is destroyed and its slot
    /// released.
    pub async fn return_connection(&self, connection: Arc<dyn Connection>) {
        let shared = &self.shared;
        debug!(pool = %shared.label, "returning connection");

        let mut slot = Reservation::returning(shared, connection);
        let valid = shared.is_closed()
            || !shared.config.test_on_return()
            || slot.connection().is_some_and(|connection| shared.validate(connection));

        let rejected = {
            let mut inner = shared.state.lock().await;
            let Some(connection) = slot.take() else {
                return;
            };
            if shared.is_closed() {
                Some((connection, DestroyReason::PoolClosed))
            } else if !valid {
                Some((connection, DestroyReason::FailedValidation))
            } else if inner.idle.len() >= shared.config.max_idle() {
                Some((connection, DestroyReason::IdleCapacity))
            } else {
                inner.idle.push_back(IdleConnection::new(connection));
                debug!(pool = %shared.label, idle = inner.idle.len(), "connection returned to pool");
                None
            }
        };
        // Releases the slot and wakes one waiter.
        drop(slot);

        if let Some((connection, reason)) = rejected {
            shared.destroy(connection, reason);
        }
    }

    /// Close the pool. Idempotent.
    ///
    /// Fails pending and future borrows with [`PoolError::Closed`], destroys
    /// every idle connection and stops the eviction task. Returns
    /// [`PoolError::CloseFailed`] only if the eviction task died abnormally;
    /// the pool is closed either way.
    pub async fn close(&self) -> PoolResult<()> {
        let shared = &self.shared;
        let idle: Vec<IdleConnection> = {
            let mut inner = shared.state.lock().await;
            if shared.closed.swap(true, Ordering::SeqCst) {
                debug!(pool = %shared.label, "connection pool already closed");
                return Ok(());
            }
            inner.idle.drain(..).collect()
        };
        shared.available.notify_waiters();

        let destroyed = idle.len();
        for entry in idle {
            shared.destroy(entry.connection, DestroyReason::PoolClosed);
        }

        let task = self.eviction.lock().await.take();
        let stopped = match task {
            Some(task) => task.stop(&shared.label).await,
            None => Ok(()),
        };

        match stopped {
            Ok(()) => {
                info!(pool = %shared.label, destroyed, "connection pool closed");
                shared.emit(PoolEvent::Closed {
                    pool: shared.label.clone(),
                });
                Ok(())
            }
            Err(reason) => {
                error!(pool = %shared.label, %reason, "connection pool closed with errors");
                shared.emit(PoolEvent::CloseFailed {
                    pool: shared.label.clone(),
                    error: reason.clone(),
                });
                Err(PoolError::CloseFailed {
                    pool: shared.label.clone(),
                    reason,
                })
            }
        }
    }

    /// Run one eviction sweep now, returning the number of connections
    /// destroyed. The background task runs the same sweep every interval.
    pub async fn evict(&self) -> usize {
        let evicted = self.shared.evict().await;
        self.shared.ensure_min_idle().await;
        evicted
    }

    pub async fn state(&self) -> PoolState {
        if self.shared.is_closed() {
            PoolState::Closed
        } else {
            PoolState::Open
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.state().await == PoolState::Closed
    }

    pub async fn stats(&self) -> PoolStats {
        let inner = self.shared.state.lock().await;
        PoolStats {
            active: self.shared.active(),
            idle: inner.idle.len(),
            created: self.shared.created.load(Ordering::Relaxed),
            destroyed: self.shared.destroyed.load(Ordering::Relaxed),
            wait_count: inner.wait_count,
        }
    }

    /// Swap in `handle` as the eviction task, so close-failure handling can
    /// be exercised from tests.
    #[cfg(any(test, feature = "test-util"))]
    pub async fn replace_eviction_task(&self, handle: tokio::task::JoinHandle<()>) {
        let previous = self
            .eviction
            .lock()
            .await
            .replace(EvictionTask::from_handle(handle));
        if let Some(previous) = previous {
            let _ = previous.stop(&self.shared.label).await;
        }
    }
}

// ── Debug impl (cannot auto-derive due to dyn trait) ────────────────

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("label", &self.shared.label)
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

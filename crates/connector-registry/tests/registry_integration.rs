//! Integration tests for the connection registry.
//!
//! These tests prove that:
//! 1. Registration is first-wins and a losing registration never builds a pool
//! 2. Acquire/release route through the pool for pool entries only
//! 3. Shutdown closes every pool even when a factory fails on destroy or a
//!    pool fails to close
//! 4. The process-wide registry is a single instance across threads
//! 5. Concurrent acquire/release on one key respects the pool's limits

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use connector_pool::{
    Connection, ConnectionFactory, ExhaustedAction, PoolConfig, PoolError, PoolEvent, PoolState,
};
use connector_registry::{ConnectionKey, ConnectionRegistry, RegistryError};

// ── Tracing setup ────────────────────────────────────────────────

static TRACING_INIT: Once = Once::new();

fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

// ── Mock connector ───────────────────────────────────────────────

#[derive(Debug)]
struct Channel {
    id: usize,
}

impl Connection for Channel {}

#[derive(Default)]
struct ChannelFactory {
    created: AtomicUsize,
    destroyed: AtomicUsize,
    fail_destroy: AtomicBool,
}

impl ChannelFactory {
    fn failing_destroy() -> Self {
        let factory = Self::default();
        factory.fail_destroy.store(true, Ordering::SeqCst);
        factory
    }

    fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl ConnectionFactory for ChannelFactory {
    fn create(&self) -> anyhow::Result<Arc<dyn Connection>> {
        let id = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(Channel { id }))
    }

    fn destroy(&self, _connection: Arc<dyn Connection>) -> anyhow::Result<()> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        if self.fail_destroy.load(Ordering::SeqCst) {
            anyhow::bail!("broker went away");
        }
        Ok(())
    }
}

fn registry() -> ConnectionRegistry {
    init_tracing();
    ConnectionRegistry::new()
}

// ── Registration ─────────────────────────────────────────────────

#[tokio::test]
async fn duplicate_registration_keeps_first_pool() {
    let registry = registry();
    let first = Arc::new(ChannelFactory::default());
    let second = Arc::new(ChannelFactory::default());

    registry.register_pool("mq", "orders", first.clone(), PoolConfig::new().with_max_active(2));
    let pool = registry.pool("mq", "orders").unwrap();
    registry.register_pool("mq", "orders", second.clone(), PoolConfig::new().with_max_active(9));

    assert!(Arc::ptr_eq(&pool, &registry.pool("mq", "orders").unwrap()));
    assert_eq!(pool.config().max_active(), 2);
    assert_eq!(registry.len(), 1);

    registry.acquire("mq", "orders").await.unwrap();
    assert_eq!(first.created(), 1);
    assert_eq!(second.created(), 0);
}

#[tokio::test]
async fn single_cannot_replace_pool() {
    let registry = registry();
    registry.register_pool("mq", "orders", Arc::new(ChannelFactory::default()), PoolConfig::new());
    registry.register_single("mq", "orders", Arc::new(Channel { id: 99 }));

    assert!(registry.pool("mq", "orders").is_some());
    let conn = registry.acquire("mq", "orders").await.unwrap();
    assert_eq!(conn.downcast_ref::<Channel>().unwrap().id, 0);
}

#[tokio::test]
async fn keys_with_colons_do_not_collide() {
    let registry = registry();
    registry.register_single("a:b", "c", Arc::new(Channel { id: 1 }));
    registry.register_single("a", "b:c", Arc::new(Channel { id: 2 }));

    assert_eq!(registry.len(), 2);
    let first = registry.acquire("a:b", "c").await.unwrap();
    let second = registry.acquire("a", "b:c").await.unwrap();
    assert_eq!(first.downcast_ref::<Channel>().unwrap().id, 1);
    assert_eq!(second.downcast_ref::<Channel>().unwrap().id, 2);
}

// ── Acquire / release ────────────────────────────────────────────

#[tokio::test]
async fn acquire_missing_key_is_not_found() {
    let registry = registry();
    assert!(!registry.exists("db", "nope"));
    let err = registry.acquire("db", "nope").await.unwrap_err();
    assert!(matches!(err, RegistryError::NotFound(key) if key == ConnectionKey::new("db", "nope")));
}

#[tokio::test]
async fn release_returns_connection_to_pool() {
    let registry = registry();
    let factory = Arc::new(ChannelFactory::default());
    registry.register_pool("db", "main", factory.clone(), PoolConfig::new());

    let conn = registry.acquire("db", "main").await.unwrap();
    registry.release("db", "main", conn).await;
    let again = registry.acquire("db", "main").await.unwrap();

    assert_eq!(again.downcast_ref::<Channel>().unwrap().id, 0);
    assert_eq!(factory.created(), 1);
}

#[tokio::test]
async fn release_on_single_is_noop() {
    let registry = registry();
    let conn: Arc<dyn Connection> = Arc::new(Channel { id: 7 });
    registry.register_single("mq", "events", conn.clone());

    let acquired = registry.acquire("mq", "events").await.unwrap();
    registry.release("mq", "events", acquired).await;

    let again = registry.acquire("mq", "events").await.unwrap();
    assert!(Arc::ptr_eq(&again, &conn));
}

#[tokio::test]
async fn pool_errors_propagate_through_acquire() {
    let registry = registry();
    let config = PoolConfig::new()
        .with_max_active(1)
        .with_exhausted_action(ExhaustedAction::Fail);
    registry.register_pool("db", "tiny", Arc::new(ChannelFactory::default()), config);

    let _held = registry.acquire("db", "tiny").await.unwrap();
    let err = registry.acquire("db", "tiny").await.unwrap_err();
    assert!(matches!(
        err,
        RegistryError::Pool(PoolError::Exhausted { max_active: 1, .. })
    ));
}

// ── Shutdown ─────────────────────────────────────────────────────

#[tokio::test]
async fn shutdown_closes_every_pool_despite_destroy_failure() {
    let registry = registry();
    let factories = [
        Arc::new(ChannelFactory::default()),
        Arc::new(ChannelFactory::failing_destroy()),
        Arc::new(ChannelFactory::default()),
    ];
    for (i, factory) in factories.iter().enumerate() {
        let name = format!("pool-{i}");
        registry.register_pool("db", &name, factory.clone(), PoolConfig::new());
        let conn = registry.acquire("db", &name).await.unwrap();
        registry.release("db", &name, conn).await;
    }
    registry.register_single("mq", "events", Arc::new(Channel { id: 0 }));

    let summary = registry.shutdown().await;

    assert!(summary.is_clean());
    assert_eq!(summary.closed.len(), 3);
    for (i, factory) in factories.iter().enumerate() {
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
        let pool = registry.pool("db", &format!("pool-{i}")).unwrap();
        assert_eq!(pool.state().await, PoolState::Closed);
    }
    // Entries stay registered; closed pools reject borrows.
    assert!(registry.exists("db", "pool-0"));
    assert!(matches!(
        registry.acquire("db", "pool-0").await,
        Err(RegistryError::Pool(PoolError::Closed { .. }))
    ));
    // Singles are untouched.
    assert!(registry.acquire("mq", "events").await.is_ok());
}

#[tokio::test]
async fn shutdown_records_failed_close_and_closes_the_rest() {
    let registry = registry();
    let mut events = registry.subscribe();
    for i in 0..3 {
        registry.register_pool("db", &format!("pool-{i}"), Arc::new(ChannelFactory::default()), PoolConfig::new());
    }
    registry
        .pool("db", "pool-1")
        .unwrap()
        .replace_eviction_task(tokio::spawn(async { panic!("sweep crashed") }))
        .await;
    tokio::task::yield_now().await;

    let summary = registry.shutdown().await;

    assert!(!summary.is_clean());
    assert_eq!(summary.failed.len(), 1);
    let (key, err) = &summary.failed[0];
    assert_eq!(*key, ConnectionKey::new("db", "pool-1"));
    assert!(matches!(err, PoolError::CloseFailed { reason, .. } if reason.contains("panicked")));
    assert_eq!(
        summary.closed,
        vec![ConnectionKey::new("db", "pool-0"), ConnectionKey::new("db", "pool-2")]
    );
    for i in 0..3 {
        let pool = registry.pool("db", &format!("pool-{i}")).unwrap();
        assert_eq!(pool.state().await, PoolState::Closed);
    }

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.iter().any(|e| matches!(e, PoolEvent::CloseFailed { pool, .. } if pool == "db:pool-1")));
    assert!(seen.iter().any(|e| matches!(e, PoolEvent::Closed { pool } if pool == "db:pool-2")));
}

#[tokio::test]
async fn shutdown_publishes_destroy_failures() {
    let registry = registry();
    let mut events = registry.subscribe();
    registry.register_pool("db", "flaky", Arc::new(ChannelFactory::failing_destroy()), PoolConfig::new());
    let conn = registry.acquire("db", "flaky").await.unwrap();
    registry.release("db", "flaky", conn).await;

    registry.shutdown().await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.iter().any(|e| matches!(e, PoolEvent::DestroyFailed { error, .. } if error.contains("broker went away"))));
    assert!(seen.iter().any(|e| matches!(e, PoolEvent::Closed { pool } if pool == "db:flaky")));
}

#[tokio::test]
async fn shutdown_twice_is_harmless() {
    let registry = registry();
    registry.register_pool(
        "db",
        "evicting",
        Arc::new(ChannelFactory::default()),
        PoolConfig::new().with_eviction_check_interval(Duration::from_millis(10)),
    );

    assert!(registry.shutdown().await.is_clean());
    let second = registry.shutdown().await;
    assert!(second.is_clean());
    assert_eq!(second.closed.len(), 1);
}

// ── Process-wide instance ────────────────────────────────────────

#[test]
fn global_is_one_instance_across_threads() {
    let handles: Vec<_> = (0..8)
        .map(|_| std::thread::spawn(|| ConnectionRegistry::global() as *const ConnectionRegistry as usize))
        .collect();
    let addrs: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(addrs.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(addrs[0], ConnectionRegistry::global() as *const ConnectionRegistry as usize);
}

// ── Concurrency ──────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquire_release_on_one_key() {
    let registry = Arc::new(registry());
    let factory = Arc::new(ChannelFactory::default());
    let config = PoolConfig::new()
        .with_max_active(3)
        .with_max_wait_time(Duration::from_secs(10));
    registry.register_pool("db", "shared", factory.clone(), config);

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let registry = registry.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..20 {
                let conn = registry.acquire("db", "shared").await.unwrap();
                tokio::task::yield_now().await;
                registry.release("db", "shared", conn).await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(factory.created() <= 3);
    let stats = registry.stats("db", "shared").await.unwrap();
    assert_eq!(stats.active, 0);
    assert!(registry.shutdown().await.is_clean());
}

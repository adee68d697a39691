//! Tests for dbdeck-rdbc pool module

use async_trait::async_trait;
use dbdeck_rdbc::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ==================== In-memory driver ====================

/// Counters shared by a fake factory and every connection it opened
#[derive(Default)]
struct Counters {
    opened: AtomicUsize,
    closed: AtomicUsize,
    refuse: AtomicBool,
    /// How long `is_valid` takes, in milliseconds
    validate_ms: AtomicU64,
}

struct FakeConnection {
    counters: Arc<Counters>,
    closed: AtomicBool,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn query(&self, sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
        if let Some(code) = sql.strip_prefix("FAIL ") {
            return Err(normalize(
                DatabaseType::MySql,
                code,
                "scripted failure",
                &ErrorContext::new("fake", 3306, "test"),
            ));
        }
        if let Some(ms) = sql.strip_prefix("SLEEP ") {
            let ms: u64 = ms.parse().unwrap();
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        Ok(vec![Row::new(vec!["sql".into()], vec![Value::from(sql)])])
    }

    async fn execute(&self, _sql: &str, _params: &[Value]) -> Result<u64> {
        Ok(1)
    }

    async fn server_version(&self) -> Result<String> {
        Ok("fake-1.0".into())
    }

    async fn is_valid(&self) -> bool {
        let ms = self.counters.validate_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeFactory {
    counters: Arc<Counters>,
}

#[async_trait]
impl ConnectionFactory for FakeFactory {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        if self.counters.refuse.load(Ordering::SeqCst) {
            return Err(normalize(
                DatabaseType::MySql,
                "ECONNREFUSED",
                "connect ECONNREFUSED",
                &ErrorContext::new("fake", 3306, "test"),
            ));
        }
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeConnection {
            counters: self.counters.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::MySql
    }
}

fn fake_pool(config: PoolConfig) -> (Arc<SimpleConnectionPool>, Arc<Counters>) {
    let counters = Arc::new(Counters::default());
    let factory = Arc::new(FakeFactory {
        counters: counters.clone(),
    });
    (SimpleConnectionPool::new(config, factory), counters)
}

// ==================== PoolConfig Tests ====================

#[test]
fn test_pool_config_default() {
    let config = PoolConfig::default();

    assert_eq!(config.max_size, 10);
    assert_eq!(config.acquire_timeout, Duration::from_secs(10));
    assert_eq!(config.connect_timeout, Duration::from_secs(10));
    assert_eq!(config.idle_timeout, Duration::from_secs(60));
    assert_eq!(config.query_timeout, Duration::from_secs(30));
    assert_eq!(config.max_lifetime, Duration::from_secs(1800));
    assert!(config.test_on_borrow);
}

#[test]
fn test_pool_config_builder() {
    let config = PoolConfig::new(20)
        .with_acquire_timeout(Duration::from_secs(60))
        .with_query_timeout(Duration::from_secs(5))
        .with_max_lifetime(Duration::from_secs(3600))
        .with_idle_timeout(Duration::from_secs(300))
        .with_test_on_borrow(false);

    assert_eq!(config.max_size, 20);
    assert_eq!(config.acquire_timeout, Duration::from_secs(60));
    assert_eq!(config.query_timeout, Duration::from_secs(5));
    assert_eq!(config.max_lifetime, Duration::from_secs(3600));
    assert_eq!(config.idle_timeout, Duration::from_secs(300));
    assert!(!config.test_on_borrow);
}

// ==================== Pool behaviour Tests ====================

#[tokio::test]
async fn test_pool_is_lazy() {
    let (pool, counters) = fake_pool(PoolConfig::new(4));

    assert_eq!(counters.opened.load(Ordering::SeqCst), 0);
    let status = pool.status().unwrap();
    assert_eq!(status.total, 4);
    assert_eq!(status.open, 0);
    assert_eq!(status.free, 0);
    assert_eq!(status.pending, 0);

    let rows = pool.query("SELECT 1", &[]).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("sql").and_then(Value::as_str), Some("SELECT 1"));

    let status = pool.status().unwrap();
    assert_eq!(status.open, 1);
    assert_eq!(status.free, 1);
    assert_eq!(counters.opened.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_idle_connection_is_reused() {
    let (pool, counters) = fake_pool(PoolConfig::new(4));

    for _ in 0..5 {
        pool.query("SELECT 1", &[]).await.unwrap();
    }

    assert_eq!(counters.opened.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().acquisitions, 5);
}

#[tokio::test]
async fn test_pool_bounded_by_max_size() {
    let (pool, _counters) =
        fake_pool(PoolConfig::new(1).with_acquire_timeout(Duration::from_millis(50)));

    let held = pool.get().await.unwrap();
    let err = pool.get().await.err().unwrap();
    assert!(matches!(err, Error::PoolExhausted { .. }));
    assert_eq!(err.category(), ErrorCategory::ConnectionTimeout);
    assert_eq!(pool.stats().exhausted_count, 1);

    held.release().await;
    assert!(pool.get().await.is_ok());
}

#[tokio::test]
async fn test_pending_waiters_visible_in_status() {
    let (pool, _counters) =
        fake_pool(PoolConfig::new(1).with_acquire_timeout(Duration::from_secs(5)));

    let held = pool.get().await.unwrap();

    let waiter_pool = pool.clone();
    let waiter = tokio::spawn(async move { waiter_pool.query("SELECT 2", &[]).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    let status = pool.status().unwrap();
    assert_eq!(status.pending, 1);
    assert!(status.is_saturated());

    held.release().await;
    assert!(waiter.await.unwrap().is_ok());
    assert_eq!(pool.status().unwrap().pending, 0);
}

#[tokio::test]
async fn test_close_wakes_waiters_and_fails_later_operations() {
    let (pool, counters) =
        fake_pool(PoolConfig::new(1).with_acquire_timeout(Duration::from_secs(5)));

    pool.warm_up().await.unwrap();
    let held = pool.get().await.unwrap();

    let waiter_pool = pool.clone();
    let waiter = tokio::spawn(async move { waiter_pool.get().await.map(|_| ()) });
    tokio::time::sleep(Duration::from_millis(20)).await;

    pool.close().await.unwrap();

    let waited = waiter.await.unwrap();
    assert!(matches!(waited, Err(Error::PoolClosed)));
    assert!(matches!(pool.query("SELECT 1", &[]).await, Err(Error::PoolClosed)));
    assert!(pool.is_closed());
    assert!(pool.status().is_none());

    // a checked-out connection is closed when it comes back
    held.release().await;
    assert_eq!(counters.closed.load(Ordering::SeqCst), 1);

    // closing again is a no-op
    pool.close().await.unwrap();
    assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_close_drains_idle_connections() {
    let (pool, counters) = fake_pool(PoolConfig::new(3));

    let a = pool.get().await.unwrap();
    let b = pool.get().await.unwrap();
    a.release().await;
    b.release().await;
    assert_eq!(pool.status().unwrap().free, 2);

    pool.close().await.unwrap();
    assert_eq!(counters.closed.load(Ordering::SeqCst), 2);
    assert_eq!(pool.stats().connections_closed, 2);
}

#[tokio::test]
async fn test_query_timeout_discards_connection() {
    let (pool, counters) =
        fake_pool(PoolConfig::new(1).with_query_timeout(Duration::from_millis(20)));

    let err = pool.query("SLEEP 1000", &[]).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::ConnectionTimeout);
    assert_eq!(err.to_string(), "Connection timeout");

    assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    let status = pool.status().unwrap();
    assert_eq!(status.open, 0);
    assert_eq!(status.free, 0);

    // the permit came back
    assert!(pool.query("SELECT 1", &[]).await.is_ok());
}

#[tokio::test]
async fn test_cancelled_query_releases_connection() {
    let (pool, counters) = fake_pool(PoolConfig::new(1));
    let token = CancellationToken::new();

    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let err = pool
        .query_cancellable("SLEEP 1000", &[], &token)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    assert!(pool.query("SELECT 1", &[]).await.is_ok());
}

#[tokio::test]
async fn test_cancelled_before_acquire() {
    let (pool, counters) = fake_pool(PoolConfig::new(1));
    let token = CancellationToken::new();
    token.cancel();

    let err = pool
        .query_cancellable("SELECT 1", &[], &token)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(pool.status().unwrap().pending, 0);
    assert!(counters.opened.load(Ordering::SeqCst) <= 1);
}

#[tokio::test]
async fn test_fatal_errors_discard_but_statement_errors_keep_connection() {
    let (pool, counters) = fake_pool(PoolConfig::new(2));

    let err = pool.query("FAIL ER_PARSE_ERROR", &[]).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::SyntaxError);
    assert_eq!(pool.status().unwrap().free, 1);
    assert_eq!(counters.closed.load(Ordering::SeqCst), 0);

    let err = pool
        .query("FAIL PROTOCOL_CONNECTION_LOST", &[])
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::ConnectionLost);
    assert_eq!(pool.status().unwrap().free, 0);
    assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_connect_failure_marks_pool_unhealthy() {
    let (pool, counters) = fake_pool(PoolConfig::new(2));
    assert!(pool.is_healthy());

    counters.refuse.store(true, Ordering::SeqCst);
    let err = pool.warm_up().await.unwrap_err();
    assert_eq!(err.to_string(), "Connection refused: fake:3306");
    assert!(!pool.is_healthy());
    // the failed attempt did not consume capacity
    assert_eq!(pool.status().unwrap().open, 0);

    counters.refuse.store(false, Ordering::SeqCst);
    pool.warm_up().await.unwrap();
    assert!(pool.is_healthy());
    assert_eq!(pool.status().unwrap().free, 1);
}

#[tokio::test]
async fn test_reap_idle_closes_expired_connections() {
    let (pool, counters) = fake_pool(PoolConfig::new(2).with_idle_timeout(Duration::ZERO));

    pool.warm_up().await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert_eq!(pool.reap_idle().await, 1);
    assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    assert_eq!(pool.status().unwrap().free, 0);
}

#[tokio::test]
async fn test_discarded_guard_closes_connection() {
    let (pool, counters) = fake_pool(PoolConfig::new(1));

    let mut conn = pool.get().await.unwrap();
    assert_eq!(conn.server_version().await.unwrap(), "fake-1.0");
    conn.discard();
    conn.release().await;

    assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    assert_eq!(pool.status().unwrap().open, 0);
}

#[tokio::test]
async fn test_cancelled_during_validation_closes_connection() {
    let (pool, counters) = fake_pool(PoolConfig::new(1));
    pool.warm_up().await.unwrap();
    counters.validate_ms.store(200, Ordering::SeqCst);

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let err = pool
        .query_cancellable("SELECT 1", &[], &token)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));

    // the half-validated connection is closed in the background
    tokio::time::sleep(Duration::from_millis(50)).await;
    let status = pool.status().unwrap();
    assert_eq!(status.open, 0);
    assert_eq!(status.free, 0);
    assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().connections_closed, 1);

    counters.validate_ms.store(0, Ordering::SeqCst);
    assert!(pool.query("SELECT 1", &[]).await.is_ok());
    assert_eq!(counters.opened.load(Ordering::SeqCst), 2);

    pool.close().await.unwrap();
    assert_eq!(counters.closed.load(Ordering::SeqCst), 2);
}

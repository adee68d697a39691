//! Connection pool abstraction for dbdeck-rdbc
//!
//! Bounded, lazily-filled connection pooling with:
//! - A semaphore sized to the profile's `connectionLimit`
//! - Per-connection connect timeout and idle recycling
//! - Health checking on borrow
//! - Read-only status (`total`/`free`/`pending`) and counters
//! - A one-shot close that fails every later operation with `PoolClosed`
//!
//! # Example
//!
//! ```rust,ignore
//! use dbdeck_rdbc::prelude::*;
//!
//! let pool = SimpleConnectionPool::new(
//!     PoolConfig::new(10).with_acquire_timeout(Duration::from_secs(5)),
//!     factory,
//! );
//!
//! let rows = pool.query("SELECT 1", &[]).await?;
//! pool.close().await?;
//! ```

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionFactory, DatabaseType, DriverTimeouts};
use crate::error::{Error, Result};
use crate::types::{Row, Value};

/// Connection pool trait
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Get a connection from the pool
    async fn get(&self) -> Result<PooledConnection>;

    /// Return a connection to the pool; `discard` closes it instead of reusing it
    async fn return_connection(&self, conn: Box<dyn Connection>, created_at: Instant, discard: bool);

    /// Driver behind this pool
    fn database_type(&self) -> DatabaseType;

    /// Current occupancy, or `None` when the pool has no introspectable state
    fn status(&self) -> Option<PoolStatus>;

    /// Get pool statistics
    fn stats(&self) -> PoolStats;

    /// Whether `close` has been called
    fn is_closed(&self) -> bool;

    /// Whether the most recent attempt to open a connection succeeded
    fn is_healthy(&self) -> bool;

    /// Run a query on one pooled connection, giving up when `cancel` fires
    async fn query_cancellable(
        &self,
        sql: &str,
        params: &[Value],
        cancel: &CancellationToken,
    ) -> Result<Vec<Row>>;

    /// Run a query on one pooled connection
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.query_cancellable(sql, params, &CancellationToken::new())
            .await
    }

    /// Open (or reuse) one connection and hand it straight back
    async fn warm_up(&self) -> Result<()> {
        let conn = self.get().await?;
        conn.release().await;
        Ok(())
    }

    /// Close idle connections past the idle timeout, returns how many were closed
    async fn reap_idle(&self) -> usize;

    /// Close all connections and shutdown the pool
    async fn close(&self) -> Result<()>;
}

/// A connection borrowed from the pool
pub struct PooledConnection {
    /// The underlying connection
    conn: Option<Box<dyn Connection>>,
    /// When the underlying connection was opened
    created_at: Instant,
    /// Close instead of reuse on return
    discard: bool,
    /// Reference to the pool for return
    pool: Arc<dyn ConnectionPool>,
}

impl PooledConnection {
    /// Create a new pooled connection wrapper
    pub fn new(conn: Box<dyn Connection>, created_at: Instant, pool: Arc<dyn ConnectionPool>) -> Self {
        Self {
            conn: Some(conn),
            created_at,
            discard: false,
            pool,
        }
    }

    /// Mark the connection as unusable; it is closed when returned
    pub fn discard(&mut self) {
        self.discard = true;
    }

    /// Age of the underlying connection
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Return the connection to the pool now rather than on drop
    pub async fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool
                .return_connection(conn, self.created_at, self.discard)
                .await;
        }
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_ref()
            .expect("connection already returned")
            .as_ref()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let pool = self.pool.clone();
            let created_at = self.created_at;
            let discard = self.discard;
            // Outside a runtime the connection is simply dropped
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    pool.return_connection(conn, created_at, discard).await;
                });
            }
        }
    }
}

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum pool size
    pub max_size: usize,
    /// Maximum time to wait for a connection
    pub acquire_timeout: Duration,
    /// Maximum time to open one connection
    pub connect_timeout: Duration,
    /// Maximum time for one pooled query
    pub query_timeout: Duration,
    /// Maximum time to close one connection
    pub close_timeout: Duration,
    /// Maximum connection lifetime (for recycling)
    pub max_lifetime: Duration,
    /// Idle timeout (connections idle longer are closed)
    pub idle_timeout: Duration,
    /// Whether to test connections on borrow
    pub test_on_borrow: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(10)
    }
}

impl PoolConfig {
    /// Create pool config with default timeouts
    pub fn new(max_size: usize) -> Self {
        Self::from_timeouts(max_size, &DriverTimeouts::default())
    }

    /// Create pool config from adapter timeouts
    pub fn from_timeouts(max_size: usize, timeouts: &DriverTimeouts) -> Self {
        Self {
            max_size: max_size.max(1),
            acquire_timeout: timeouts.acquire,
            connect_timeout: timeouts.pool_connect,
            query_timeout: timeouts.query,
            close_timeout: timeouts.close,
            max_lifetime: Duration::from_secs(1800), // 30 minutes
            idle_timeout: timeouts.pool_idle,
            test_on_borrow: true,
        }
    }

    /// Set acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set query timeout
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Set idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set maximum connection lifetime
    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    /// Enable/disable test on borrow
    pub fn with_test_on_borrow(mut self, test: bool) -> Self {
        self.test_on_borrow = test;
        self
    }
}

/// Read-only pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Configured limit
    pub total: usize,
    /// Connections currently open (idle + in use)
    pub open: usize,
    /// Idle connections ready for reuse
    pub free: usize,
    /// Callers waiting for a connection
    pub pending: usize,
}

impl PoolStatus {
    /// Every connection is busy and someone is waiting
    pub fn is_saturated(&self) -> bool {
        self.pending > 0 && self.free == 0 && self.open >= self.total
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Total number of connections created
    pub connections_created: u64,
    /// Total number of connections closed
    pub connections_closed: u64,
    /// Total number of connection acquisitions
    pub acquisitions: u64,
    /// Number of times pool was exhausted
    pub exhausted_count: u64,
    /// Total wait time for connections (in milliseconds)
    pub total_wait_time_ms: u64,
    /// Number of health check failures
    pub health_check_failures: u64,
}

/// Atomic pool stats for concurrent updates
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicPoolStats {
    pub connections_created: AtomicU64,
    pub connections_closed: AtomicU64,
    pub acquisitions: AtomicU64,
    pub exhausted_count: AtomicU64,
    pub total_wait_time_ms: AtomicU64,
    pub health_check_failures: AtomicU64,
}

impl AtomicPoolStats {
    /// Create new atomic stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection creation
    pub fn record_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection close
    pub fn record_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an acquisition
    pub fn record_acquisition(&self, wait_time_ms: u64) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.total_wait_time_ms
            .fetch_add(wait_time_ms, Ordering::Relaxed);
    }

    /// Record pool exhaustion
    pub fn record_exhausted(&self) {
        self.exhausted_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record health check failure
    pub fn record_health_check_failure(&self) {
        self.health_check_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot current stats
    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            exhausted_count: self.exhausted_count.load(Ordering::Relaxed),
            total_wait_time_ms: self.total_wait_time_ms.load(Ordering::Relaxed),
            health_check_failures: self.health_check_failures.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// SimpleConnectionPool
// ============================================================================

/// A semaphore-bounded connection pool.
///
/// Construction never opens a connection; the first `get` does. Idle
/// connections are kept LIFO and recycled on borrow once they pass the idle
/// timeout or the maximum lifetime.
pub struct SimpleConnectionPool {
    /// Pool configuration
    config: PoolConfig,
    /// Connection factory
    factory: Arc<dyn ConnectionFactory>,
    /// Idle connections (LIFO for better cache locality)
    idle: Mutex<Vec<PoolEntry>>,
    /// Mirror of `idle.len()` readable without the lock
    idle_count: AtomicUsize,
    /// Semaphore to limit total connections
    semaphore: Semaphore,
    /// Current total connection count
    total_connections: AtomicUsize,
    /// Callers waiting on the semaphore
    pending: AtomicUsize,
    /// Statistics
    stats: AtomicPoolStats,
    /// Shutdown flag
    shutdown: AtomicBool,
    /// Last connection attempt succeeded
    healthy: AtomicBool,
    /// Self reference for creating PooledConnections
    self_ref: Weak<Self>,
}

/// Internal pool entry with metadata
struct PoolEntry {
    /// The connection
    conn: Box<dyn Connection>,
    /// When the connection was created
    created_at: Instant,
    /// When last used
    last_used: Instant,
}

/// Decrements the pending counter even if the waiting future is dropped
struct PendingGuard<'a>(&'a AtomicUsize);

impl<'a> PendingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl SimpleConnectionPool {
    /// Create a new connection pool. No connection is opened here.
    pub fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            semaphore: Semaphore::new(config.max_size),
            idle: Mutex::new(Vec::with_capacity(config.max_size)),
            idle_count: AtomicUsize::new(0),
            total_connections: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            stats: AtomicPoolStats::new(),
            shutdown: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            self_ref: self_ref.clone(),
            config,
            factory,
        })
    }

    /// Get pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Create a new connection using the factory
    async fn create_connection(&self) -> Result<Box<dyn Connection>> {
        let opened = tokio::time::timeout(self.config.connect_timeout, self.factory.connect())
            .await
            .map_err(|_| {
                Error::timeout(format!(
                    "connect did not complete within {}ms",
                    self.config.connect_timeout.as_millis()
                ))
            })
            .and_then(|r| r);

        match opened {
            Ok(conn) => {
                self.total_connections.fetch_add(1, Ordering::AcqRel);
                self.stats.record_created();
                self.healthy.store(true, Ordering::Release);
                debug!(
                    db_type = %self.factory.database_type(),
                    open = self.total_connections.load(Ordering::Acquire),
                    "New connection established"
                );
                Ok(conn)
            }
            Err(e) => {
                self.healthy.store(false, Ordering::Release);
                warn!(db_type = %self.factory.database_type(), error = %e, "Failed to open pooled connection");
                Err(e)
            }
        }
    }

    /// Close a connection that will not go back to the idle list
    async fn destroy(&self, conn: Box<dyn Connection>) -> bool {
        Held::new(self, conn).close().await
    }

    /// Forget a connection and close it on a background task
    fn destroy_detached(&self, conn: Box<dyn Connection>) {
        self.total_connections.fetch_sub(1, Ordering::AcqRel);
        self.stats.record_closed();

        let close_timeout = self.config.close_timeout;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = tokio::time::timeout(close_timeout, conn.close()).await;
                });
            }
            Err(_) => debug!("No runtime to close connection; dropping it"),
        }
    }

    /// Check if a connection should be recycled (expired)
    fn should_recycle(&self, entry: &PoolEntry) -> bool {
        entry.created_at.elapsed() > self.config.max_lifetime
            || entry.last_used.elapsed() > self.config.idle_timeout
    }

    /// Pop idle entries until one passes recycling and validation
    async fn take_idle(&self) -> Option<(Box<dyn Connection>, Instant)> {
        loop {
            let entry = self.idle.lock().await.pop()?;
            self.idle_count.fetch_sub(1, Ordering::AcqRel);

            let expired = self.should_recycle(&entry);
            let created_at = entry.created_at;
            // from here until `keep` the caller may be cancelled at any await
            let held = Held::new(self, entry.conn);

            if expired {
                debug!("Recycling expired idle connection");
                held.close().await;
                continue;
            }
            if self.config.test_on_borrow && !held.is_valid().await {
                self.stats.record_health_check_failure();
                debug!("Discarding idle connection that failed validation");
                held.close().await;
                continue;
            }
            return held.keep().map(|conn| (conn, created_at));
        }
    }
}

/// An open connection that is counted in `total_connections` but belongs to
/// neither the idle list nor a caller.
///
/// Dropping it while it still holds the connection (the owning future was
/// cancelled) uncounts the connection and closes it in the background.
struct Held<'a> {
    pool: &'a SimpleConnectionPool,
    conn: Option<Box<dyn Connection>>,
    /// A checked-out connection still owns its semaphore permit
    permit: bool,
}

impl<'a> Held<'a> {
    fn new(pool: &'a SimpleConnectionPool, conn: Box<dyn Connection>) -> Self {
        Self {
            pool,
            conn: Some(conn),
            permit: false,
        }
    }

    fn with_permit(pool: &'a SimpleConnectionPool, conn: Box<dyn Connection>) -> Self {
        Self {
            pool,
            conn: Some(conn),
            permit: true,
        }
    }

    fn release_permit(&mut self) {
        if std::mem::take(&mut self.permit) {
            self.pool.semaphore.add_permits(1);
        }
    }

    async fn is_valid(&self) -> bool {
        match &self.conn {
            Some(conn) => conn.is_valid().await,
            None => false,
        }
    }

    /// Close the connection and uncount it. Returns whether it closed cleanly.
    async fn close(mut self) -> bool {
        let closed = match &self.conn {
            Some(conn) => matches!(
                tokio::time::timeout(self.pool.config.close_timeout, conn.close()).await,
                Ok(Ok(()))
            ),
            None => return false,
        };
        self.conn = None;
        self.pool.total_connections.fetch_sub(1, Ordering::AcqRel);
        self.pool.stats.record_closed();
        self.release_permit();
        closed
    }

    /// Hand the connection on; the caller takes over the permit too
    fn keep(mut self) -> Option<Box<dyn Connection>> {
        self.permit = false;
        self.conn.take()
    }
}

impl Drop for Held<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.destroy_detached(conn);
        }
        self.release_permit();
    }
}

#[async_trait]
impl ConnectionPool for SimpleConnectionPool {
    async fn get(&self) -> Result<PooledConnection> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }

        let start = Instant::now();

        let permit = {
            let _waiting = PendingGuard::enter(&self.pending);
            tokio::time::timeout(self.config.acquire_timeout, self.semaphore.acquire())
                .await
                .map_err(|_| {
                    self.stats.record_exhausted();
                    Error::PoolExhausted {
                        message: format!(
                            "Timeout waiting for connection ({}ms)",
                            self.config.acquire_timeout.as_millis()
                        ),
                    }
                })?
                // the semaphore is only closed by `close`
                .map_err(|_| Error::PoolClosed)?
        };

        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }

        let (conn, created_at) = match self.take_idle().await {
            Some(found) => found,
            None => (self.create_connection().await?, Instant::now()),
        };

        let wait_ms = start.elapsed().as_millis() as u64;
        self.stats.record_acquisition(wait_ms);
        debug!(wait_ms, "Connection acquired");

        // Permit is handed back in `return_connection`
        permit.forget();

        let pool: Arc<dyn ConnectionPool> = match self.self_ref.upgrade() {
            Some(pool) => pool,
            None => {
                self.destroy_detached(conn);
                self.semaphore.add_permits(1);
                return Err(Error::PoolClosed);
            }
        };

        Ok(PooledConnection::new(conn, created_at, pool))
    }

    async fn return_connection(&self, conn: Box<dyn Connection>, created_at: Instant, discard: bool) {
        let held = Held::with_permit(self, conn);
        if discard {
            debug!("Connection discarded on release");
            held.close().await;
            return;
        }

        let mut idle = self.idle.lock().await;
        // checked under the idle lock so `close` cannot miss this entry
        if self.shutdown.load(Ordering::Acquire) {
            drop(idle);
            held.close().await;
            return;
        }
        if let Some(conn) = held.keep() {
            idle.push(PoolEntry {
                conn,
                created_at,
                last_used: Instant::now(),
            });
            self.idle_count.fetch_add(1, Ordering::AcqRel);
        }
        drop(idle);
        self.semaphore.add_permits(1);
        debug!("Connection released");
    }

    fn database_type(&self) -> DatabaseType {
        self.factory.database_type()
    }

    fn status(&self) -> Option<PoolStatus> {
        if self.shutdown.load(Ordering::Acquire) {
            return None;
        }
        Some(PoolStatus {
            total: self.config.max_size,
            open: self.total_connections.load(Ordering::Acquire),
            free: self.idle_count.load(Ordering::Acquire),
            pending: self.pending.load(Ordering::Acquire),
        })
    }

    fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    fn is_closed(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    async fn query_cancellable(
        &self,
        sql: &str,
        params: &[Value],
        cancel: &CancellationToken,
    ) -> Result<Vec<Row>> {
        let mut conn = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            conn = self.get() => conn?,
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(self.config.query_timeout, conn.query(sql, params)) => Some(result),
        };

        let result = match outcome {
            Some(Ok(Ok(rows))) => Ok(rows),
            Some(Ok(Err(e))) => {
                if e.is_fatal() {
                    conn.discard();
                }
                Err(e)
            }
            Some(Err(_)) => {
                conn.discard();
                Err(Error::timeout(format!(
                    "query did not complete within {}ms",
                    self.config.query_timeout.as_millis()
                )))
            }
            None => {
                conn.discard();
                Err(Error::Cancelled)
            }
        };

        conn.release().await;
        result
    }

    async fn reap_idle(&self) -> usize {
        let expired: Vec<PoolEntry> = {
            let mut idle = self.idle.lock().await;
            let (expired, keep): (Vec<_>, Vec<_>) =
                idle.drain(..).partition(|entry| self.should_recycle(entry));
            *idle = keep;
            expired
        };

        let reaped = expired.len();
        self.idle_count.fetch_sub(reaped, Ordering::AcqRel);
        for entry in expired {
            self.destroy(entry.conn).await;
        }
        if reaped > 0 {
            debug!(reaped, "Reaped idle connections");
        }
        reaped
    }

    async fn close(&self) -> Result<()> {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // Wake every waiter with `PoolClosed`
        self.semaphore.close();

        let entries: Vec<PoolEntry> = self.idle.lock().await.drain(..).collect();
        self.idle_count.store(0, Ordering::Release);

        let mut failures = 0usize;
        for entry in entries {
            if !self.destroy(entry.conn).await {
                failures += 1;
            }
        }

        info!(
            db_type = %self.factory.database_type(),
            in_use = self.total_connections.load(Ordering::Acquire),
            failures,
            "Pool closed"
        );

        if failures > 0 {
            return Err(Error::internal(format!(
                "{} connection(s) failed to close cleanly",
                failures
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_from_timeouts() {
        let timeouts = DriverTimeouts::default().with_query(Duration::from_secs(5));
        let config = PoolConfig::from_timeouts(4, &timeouts);

        assert_eq!(config.max_size, 4);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.query_timeout, Duration::from_secs(5));
        assert!(config.test_on_borrow);
    }

    #[test]
    fn test_pool_config_never_zero() {
        assert_eq!(PoolConfig::new(0).max_size, 1);
    }

    #[test]
    fn test_pool_status_saturation() {
        let busy = PoolStatus {
            total: 2,
            open: 2,
            free: 0,
            pending: 3,
        };
        assert!(busy.is_saturated());

        let room = PoolStatus {
            total: 2,
            open: 1,
            free: 0,
            pending: 1,
        };
        assert!(!room.is_saturated());
    }

    #[test]
    fn test_atomic_pool_stats() {
        let stats = AtomicPoolStats::new();

        stats.record_created();
        stats.record_created();
        stats.record_acquisition(100);
        stats.record_acquisition(200);
        stats.record_closed();
        stats.record_exhausted();
        stats.record_health_check_failure();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.connections_created, 2);
        assert_eq!(snapshot.connections_closed, 1);
        assert_eq!(snapshot.acquisitions, 2);
        assert_eq!(snapshot.total_wait_time_ms, 300);
        assert_eq!(snapshot.exhausted_count, 1);
        assert_eq!(snapshot.health_check_failures, 1);
    }
}

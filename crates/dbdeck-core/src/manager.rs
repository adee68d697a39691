//! Connection lifecycle manager
//!
//! Orchestrates connect/disconnect/test/query against the adapter registry
//! and the connection registry. Every public method returns a value; driver
//! failures come back as `success: false` results, never as errors.
//!
//! ```text
//! Idle → Connecting → Connected | Failed
//! Connected → Disconnecting → Closed
//! ```

use dbdeck_rdbc::adapter::{AdapterRegistry, TestOutcome};
use dbdeck_rdbc::connection::{ConnectionConfig, DriverTimeouts};
use dbdeck_rdbc::error::{Error, ErrorCategory};
use dbdeck_rdbc::pool::{ConnectionPool, PoolStats, PoolStatus};
use dbdeck_rdbc::types::{Row, Value};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ManagerError;
use crate::registry::{ConnectionRegistry, ConnectionSummary, RegistryEvent};

/// Pool occupancy plus lifetime counters, the `db:pool-status` result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolReport {
    /// `total`, `open`, `free` and `pending`, at the top level
    #[serde(flatten)]
    pub status: PoolStatus,
    /// Counters since the pool was created
    pub stats: PoolStats,
}

/// Result of `connect`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectOutcome {
    /// Whether a connection was registered
    pub success: bool,
    /// Id of the new connection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Normalized failure message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Driver error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Normalized error category
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<ErrorCategory>,
}

impl ConnectOutcome {
    fn connected(id: String) -> Self {
        Self {
            success: true,
            id: Some(id),
            message: None,
            error_code: None,
            category: None,
        }
    }

    fn failed(err: &ManagerError) -> Self {
        Self {
            success: false,
            id: None,
            message: Some(err.to_string()),
            error_code: err.code().map(str::to_string),
            category: err.category(),
        }
    }
}

/// Result of `query`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOutcome {
    /// Whether the query ran
    pub success: bool,
    /// Rows as JSON objects keyed by column name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<serde_json::Value>>,
    /// Normalized failure message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Driver error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Normalized error category
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<ErrorCategory>,
}

impl QueryOutcome {
    fn rows(rows: &[Row]) -> Self {
        Self {
            success: true,
            rows: Some(rows.iter().map(Row::to_json).collect()),
            message: None,
            error_code: None,
            category: None,
        }
    }

    fn failed(err: &ManagerError) -> Self {
        Self {
            success: false,
            rows: None,
            message: Some(err.to_string()),
            error_code: err.code().map(str::to_string),
            category: err.category(),
        }
    }
}

/// Owns the connection registry and mediates every operation on it
pub struct ConnectionManager {
    adapters: AdapterRegistry,
    timeouts: DriverTimeouts,
    registry: ConnectionRegistry,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(AdapterRegistry::with_defaults(), DriverTimeouts::default())
    }
}

impl ConnectionManager {
    /// Create a manager with an empty registry
    pub fn new(adapters: AdapterRegistry, timeouts: DriverTimeouts) -> Self {
        Self {
            adapters,
            timeouts,
            registry: ConnectionRegistry::new(),
        }
    }

    /// Underlying registry
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Timeouts applied to every adapter call
    pub fn timeouts(&self) -> &DriverTimeouts {
        &self.timeouts
    }

    /// Subscribe to registry add/remove notifications
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.registry.subscribe()
    }

    /// Build a pool for `config`, verify it, and register it
    pub async fn connect(&self, config: ConnectionConfig) -> ConnectOutcome {
        self.connect_cancellable(config, &CancellationToken::new())
            .await
    }

    /// `connect` that gives up (and leaves nothing behind) when `cancel` fires
    pub async fn connect_cancellable(
        &self,
        config: ConnectionConfig,
        cancel: &CancellationToken,
    ) -> ConnectOutcome {
        let kind = config.kind.clone();
        let name = config.name.clone();
        let start = Instant::now();

        match self.try_connect(config, cancel).await {
            Ok(id) => {
                info!(
                    id = %id,
                    db_type = %kind,
                    name = %name,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Connected"
                );
                ConnectOutcome::connected(id)
            }
            Err(e) => {
                warn!(db_type = %kind, name = %name, error = %e, "Connect failed");
                ConnectOutcome::failed(&e)
            }
        }
    }

    async fn try_connect(
        &self,
        config: ConnectionConfig,
        cancel: &CancellationToken,
    ) -> Result<String, ManagerError> {
        let adapter = self.adapters.resolve_config(&config)?;
        let db_type = adapter.database_type();
        let pool = adapter.create_pool(&config, &self.timeouts)?;

        let verified = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = pool.warm_up() => result,
        };

        if let Err(e) = verified {
            if let Err(close_err) = adapter.close(pool.as_ref()).await {
                debug!(error = %close_err, "Failed to close rejected pool");
            }
            return Err(e.into());
        }

        // Allocated only after the pool exists, so ids follow completion order
        Ok(self.registry.put(config, db_type, adapter, pool))
    }

    /// Close and unregister a connection. `false` if the id is unknown.
    pub async fn disconnect(&self, id: &str) -> bool {
        let Some(record) = self.registry.begin_close(id) else {
            debug!(id = %id, "Disconnect for unknown connection");
            return false;
        };

        match record.adapter().close(record.pool().as_ref()).await {
            Ok(()) => info!(id = %id, "Disconnected"),
            // The pool is shut down even when some connection failed to close
            Err(e) => warn!(id = %id, error = %e, "Pool closed with errors"),
        }

        self.registry.remove(id)
    }

    /// Probe a configuration with a throwaway connection. Never registers anything.
    pub async fn test_connection(&self, config: &ConnectionConfig) -> TestOutcome {
        let outcome = match self.adapters.resolve_config(config) {
            Ok(adapter) => adapter.test_connection(config, &self.timeouts).await,
            Err(e) => TestOutcome::failed(&e),
        };

        if outcome.success {
            info!(db_type = %config.kind, version = ?outcome.version, "Test connection succeeded");
        } else {
            info!(db_type = %config.kind, error = ?outcome.error, "Test connection failed");
        }
        outcome
    }

    /// Pool handle for direct use; touches `lastUsed`
    pub fn get_connection(&self, id: &str) -> Option<Arc<dyn ConnectionPool>> {
        self.registry.get(id).map(|record| record.pool().clone())
    }

    /// Every registered connection, in registration order
    pub fn list_connections(&self) -> Vec<ConnectionSummary> {
        self.registry.list()
    }

    /// Run a query on a registered connection
    pub async fn query(&self, id: &str, sql: &str, params: &[Value]) -> QueryOutcome {
        self.query_cancellable(id, sql, params, &CancellationToken::new())
            .await
    }

    /// `query` that gives up and releases its connection when `cancel` fires
    pub async fn query_cancellable(
        &self,
        id: &str,
        sql: &str,
        params: &[Value],
        cancel: &CancellationToken,
    ) -> QueryOutcome {
        match self.try_query(id, sql, params, cancel).await {
            Ok(rows) => {
                debug!(id = %id, rows = rows.len(), "Query completed");
                QueryOutcome::rows(&rows)
            }
            Err(e) => {
                warn!(id = %id, error = %e, "Query failed");
                QueryOutcome::failed(&e)
            }
        }
    }

    async fn try_query(
        &self,
        id: &str,
        sql: &str,
        params: &[Value],
        cancel: &CancellationToken,
    ) -> Result<Vec<Row>, ManagerError> {
        let record = self
            .registry
            .get(id)
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
        let rows = record
            .adapter()
            .query(record.pool().as_ref(), sql, params, cancel)
            .await?;
        record.touch();
        Ok(rows)
    }

    /// Pool occupancy, or `None` for unknown ids and pools without state
    pub fn pool_status(&self, id: &str) -> Option<PoolStatus> {
        let record = self.registry.get(id)?;
        record.adapter().pool_status(record.pool().as_ref())
    }

    /// Pool occupancy together with its counters
    pub fn pool_report(&self, id: &str) -> Option<PoolReport> {
        let record = self.registry.get(id)?;
        let status = record.adapter().pool_status(record.pool().as_ref())?;
        Some(PoolReport {
            status,
            stats: record.pool().stats(),
        })
    }

    /// Close idle connections past their idle timeout in every pool
    pub async fn reap_idle(&self) -> usize {
        let mut reaped = 0;
        for record in self.registry.records() {
            if !record.is_closing() {
                reaped += record.pool().reap_idle().await;
            }
        }
        reaped
    }

    /// Disconnect everything. Used at process teardown.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self
            .registry
            .records()
            .iter()
            .map(|r| r.id().to_string())
            .collect();
        if ids.is_empty() {
            return;
        }

        info!(connections = ids.len(), "Closing all connections");
        futures::future::join_all(ids.iter().map(|id| self.disconnect(id))).await;
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("adapters", &self.adapters)
            .field("connections", &self.registry.len())
            .finish()
    }
}

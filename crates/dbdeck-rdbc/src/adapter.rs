//! Driver adapters
//!
//! An adapter turns a [`ConnectionConfig`] into two capabilities:
//! - a bounded, lazily-filled pool for registered connections
//! - a throwaway single connection used only to probe reachability
//!
//! Adapters are looked up through a static [`AdapterRegistry`] keyed by
//! [`DatabaseType`]; unknown or unregistered types fail with
//! `UnsupportedType`.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::{ConnectionConfig, ConnectionFactory, DatabaseType, DriverTimeouts};
use crate::error::{Error, ErrorCategory, Result};
use crate::pool::{ConnectionPool, PoolConfig, PoolStatus, SimpleConnectionPool};
use crate::types::{Row, Value};

/// Result of a connectivity probe
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestOutcome {
    /// Whether the probe round-trip succeeded
    pub success: bool,
    /// Server version reported by the probe
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Normalized error message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Driver error code, when the driver reported one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Whether the failure left the connection unusable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal: Option<bool>,
    /// Normalized error category
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<ErrorCategory>,
}

impl TestOutcome {
    /// Successful probe
    pub fn ok(version: impl Into<String>) -> Self {
        Self {
            success: true,
            version: Some(version.into()),
            error: None,
            error_code: None,
            fatal: None,
            category: None,
        }
    }

    /// Failed probe
    pub fn failed(err: &Error) -> Self {
        Self {
            success: false,
            version: None,
            error: Some(err.to_string()),
            error_code: err.code().map(str::to_string),
            fatal: Some(err.is_fatal()),
            category: Some(err.category()),
        }
    }
}

/// Per-database-type translation layer
#[async_trait]
pub trait DriverAdapter: Send + Sync {
    /// Driver this adapter serves
    fn database_type(&self) -> DatabaseType;

    /// Build a connection factory for a configuration
    fn connection_factory(&self, config: &ConnectionConfig) -> Result<Arc<dyn ConnectionFactory>>;

    /// Build a pool sized to `connectionLimit`. Opens no connection.
    fn create_pool(
        &self,
        config: &ConnectionConfig,
        timeouts: &DriverTimeouts,
    ) -> Result<Arc<dyn ConnectionPool>> {
        let factory = self.connection_factory(config)?;
        let pool_config = PoolConfig::from_timeouts(config.connection_limit as usize, timeouts);
        debug!(
            db_type = %self.database_type(),
            max_size = pool_config.max_size,
            "Creating connection pool"
        );
        Ok(SimpleConnectionPool::new(pool_config, factory))
    }

    /// Open one throwaway connection, ask for the server version, close it
    async fn test_connection(
        &self,
        config: &ConnectionConfig,
        timeouts: &DriverTimeouts,
    ) -> TestOutcome {
        match self.connection_factory(config) {
            Ok(factory) => probe_connection(factory.as_ref(), timeouts).await,
            Err(e) => TestOutcome::failed(&e),
        }
    }

    /// Run a query on one pooled connection, giving up when `cancel` fires
    async fn query(
        &self,
        pool: &dyn ConnectionPool,
        sql: &str,
        params: &[Value],
        cancel: &CancellationToken,
    ) -> Result<Vec<Row>> {
        pool.query_cancellable(sql, params, cancel).await
    }

    /// Read-only pool occupancy
    fn pool_status(&self, pool: &dyn ConnectionPool) -> Option<PoolStatus> {
        pool.status()
    }

    /// Drain and end a pool
    async fn close(&self, pool: &dyn ConnectionPool) -> Result<()> {
        pool.close().await
    }
}

/// Connect, fetch the server version, and close, each step bounded.
///
/// The connection is closed on every path that opened it.
pub async fn probe_connection(factory: &dyn ConnectionFactory, timeouts: &DriverTimeouts) -> TestOutcome {
    let db_type = factory.database_type();

    let conn = match tokio::time::timeout(timeouts.test_connect, factory.connect()).await {
        Ok(Ok(conn)) => conn,
        Ok(Err(e)) => {
            debug!(db_type = %db_type, error = %e, "Test connection failed");
            return TestOutcome::failed(&e);
        }
        Err(_) => {
            let e = Error::timeout(format!(
                "test connect did not complete within {}ms",
                timeouts.test_connect.as_millis()
            ));
            debug!(db_type = %db_type, "Test connection timed out");
            return TestOutcome::failed(&e);
        }
    };

    let version = match tokio::time::timeout(timeouts.test_query, conn.server_version()).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(format!(
            "version query did not complete within {}ms",
            timeouts.test_query.as_millis()
        ))),
    };

    match tokio::time::timeout(timeouts.close, conn.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(db_type = %db_type, error = %e, "Failed to close test connection"),
        Err(_) => warn!(db_type = %db_type, "Timed out closing test connection"),
    }

    match version {
        Ok(version) => {
            debug!(db_type = %db_type, version = %version, "Test connection succeeded");
            TestOutcome::ok(version)
        }
        Err(e) => TestOutcome::failed(&e),
    }
}

/// Static map from database type to adapter
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<DatabaseType, Arc<dyn DriverAdapter>>,
}

impl AdapterRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every adapter compiled into this build
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();
        #[cfg(feature = "mysql")]
        registry.register(Arc::new(crate::mysql::MySqlAdapter));
        #[cfg(feature = "postgres")]
        registry.register(Arc::new(crate::postgres::PgAdapter));
        registry
    }

    /// Register (or replace) the adapter for its database type
    pub fn register(&mut self, adapter: Arc<dyn DriverAdapter>) -> &mut Self {
        self.adapters.insert(adapter.database_type(), adapter);
        self
    }

    /// Builder-style `register`
    pub fn with_adapter(mut self, adapter: Arc<dyn DriverAdapter>) -> Self {
        self.register(adapter);
        self
    }

    /// Types with a registered adapter
    pub fn supported(&self) -> Vec<DatabaseType> {
        let mut types: Vec<_> = self.adapters.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }

    /// Resolve the adapter for a type name
    pub fn resolve(&self, kind: &str) -> Result<Arc<dyn DriverAdapter>> {
        let db_type: DatabaseType = kind.parse()?;
        self.adapters
            .get(&db_type)
            .cloned()
            .ok_or_else(|| Error::unsupported_type(kind))
    }

    /// Resolve the adapter for a configuration, then validate the configuration
    pub fn resolve_config(&self, config: &ConnectionConfig) -> Result<Arc<dyn DriverAdapter>> {
        let adapter = self.resolve(&config.kind)?;
        config.check()?;
        Ok(adapter)
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("supported", &self.supported())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_serialization() {
        let ok = serde_json::to_value(TestOutcome::ok("8.0.36")).unwrap();
        assert_eq!(ok, serde_json::json!({"success": true, "version": "8.0.36"}));

        let err = Error::AuthenticationFailed {
            code: Some("ER_ACCESS_DENIED_ERROR".into()),
        };
        let failed = serde_json::to_value(TestOutcome::failed(&err)).unwrap();
        assert_eq!(failed["success"], false);
        assert_eq!(failed["error"], "Authentication failed: Invalid credentials");
        assert_eq!(failed["errorCode"], "ER_ACCESS_DENIED_ERROR");
        assert_eq!(failed["fatal"], true);
        assert_eq!(failed["category"], "authenticationFailed");
    }

    #[test]
    fn test_empty_registry_rejects_everything() {
        let registry = AdapterRegistry::new();
        assert!(registry.supported().is_empty());
        assert!(matches!(
            registry.resolve("mysql"),
            Err(Error::UnsupportedType { .. })
        ));
        assert!(matches!(
            registry.resolve("unknown"),
            Err(Error::UnsupportedType { .. })
        ));
    }

    #[cfg(all(feature = "mysql", feature = "postgres"))]
    #[test]
    fn test_default_registry() {
        let registry = AdapterRegistry::with_defaults();
        assert_eq!(
            registry.supported(),
            vec![DatabaseType::MySql, DatabaseType::Postgres]
        );
        assert!(registry.resolve("mysql").is_ok());
        assert!(registry.resolve("postgresql").is_ok());

        let err = registry.resolve("sqlite").err().unwrap();
        assert_eq!(err.to_string(), "Unsupported database type: sqlite");
    }
}

//! Connection traits and configuration for dbdeck-rdbc
//!
//! Core abstractions for database connectivity:
//! - Connection: a single live session with query execution
//! - ConnectionFactory: opens new sessions for a pool or a test probe
//! - ConnectionConfig: the user-supplied profile submitted for an operation
//! - DriverTimeouts: the fixed bounds every adapter applies

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use validator::Validate;

use crate::error::{Error, ErrorContext, Result};
use crate::types::{Row, SensitiveString, Value};

/// A connection to a database
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute a query that returns rows
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Execute a statement that modifies data, returns affected row count
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Ask the server for its version string (one round trip)
    async fn server_version(&self) -> Result<String>;

    /// Check if connection is valid/alive
    async fn is_valid(&self) -> bool;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// Factory for creating connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a new connection
    async fn connect(&self) -> Result<Box<dyn Connection>>;

    /// Get the database type
    fn database_type(&self) -> DatabaseType;
}

/// Database type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// MySQL/MariaDB
    MySql,
    /// PostgreSQL
    Postgres,
    /// SQLite (file based)
    Sqlite,
}

impl DatabaseType {
    /// Short identifier used on the operation surface
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::Postgres => "postgres",
            Self::Sqlite => "sqlite",
        }
    }

    /// Vendor name used in messages
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::MySql => "MySQL",
            Self::Postgres => "PostgreSQL",
            Self::Sqlite => "SQLite",
        }
    }

    /// Default TCP port, if the driver talks over the network
    pub const fn default_port(self) -> Option<u16> {
        match self {
            Self::MySql => Some(3306),
            Self::Postgres => Some(5432),
            Self::Sqlite => None,
        }
    }
}

impl FromStr for DatabaseType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(Self::MySql),
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            _ => Err(Error::unsupported_type(s)),
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// SSL setting as submitted: a flag or a structured policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SslSetting {
    /// `true` enables TLS without certificate verification
    Enabled(bool),
    /// Structured policy; verification defaults to on
    Policy {
        /// Reject servers whose certificate cannot be verified
        #[serde(rename = "rejectUnauthorized", default)]
        reject_unauthorized: Option<bool>,
    },
}

/// Resolved TLS policy handed to a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsPolicy {
    /// Reject servers whose certificate cannot be verified
    pub reject_unauthorized: bool,
}

impl SslSetting {
    /// Resolve to a TLS policy; `None` means plain TCP
    pub fn resolve(&self) -> Option<TlsPolicy> {
        match self {
            Self::Enabled(false) => None,
            Self::Enabled(true) => Some(TlsPolicy {
                reject_unauthorized: false,
            }),
            Self::Policy {
                reject_unauthorized,
            } => Some(TlsPolicy {
                reject_unauthorized: reject_unauthorized.unwrap_or(true),
            }),
        }
    }
}

fn default_connection_limit() -> u32 {
    10
}

fn default_name() -> String {
    "Unnamed".to_string()
}

/// User-supplied connection configuration.
///
/// Immutable once submitted for an operation; the registry keeps a copy for
/// display and reconnects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Driver type as submitted (`mysql`, `postgres`, `sqlite`, ...)
    #[serde(rename = "type")]
    pub kind: String,

    /// Server host (default: localhost)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Server port (default depends on the driver)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// User name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Password (redacted in logs and serialized output)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<SensitiveString>,

    /// Database/schema to select
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// Database file, for file based drivers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// SSL flag or policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl: Option<SslSetting>,

    /// Extra authentication plugin. Any value lets MySQL pools answer a
    /// `mysql_clear_password` request with the configured password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_plugin: Option<String>,

    /// Maximum pooled connections
    #[serde(default = "default_connection_limit")]
    #[validate(range(min = 1, max = 1000))]
    pub connection_limit: u32,

    /// Display label
    #[serde(default = "default_name")]
    #[validate(length(min = 1, max = 256))]
    pub name: String,
}

impl ConnectionConfig {
    /// Create a configuration for a driver type with defaults for everything else
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            host: None,
            port: None,
            user: None,
            password: None,
            database: None,
            path: None,
            ssl: None,
            auth_plugin: None,
            connection_limit: default_connection_limit(),
            name: default_name(),
        }
    }

    /// Set host
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set user and password
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(SensitiveString::new(password));
        self
    }

    /// Set database
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set database file path
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set SSL
    pub fn with_ssl(mut self, ssl: SslSetting) -> Self {
        self.ssl = Some(ssl);
        self
    }

    /// Set the extra authentication plugin
    pub fn with_auth_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.auth_plugin = Some(plugin.into());
        self
    }

    /// Set pool size
    pub fn with_connection_limit(mut self, limit: u32) -> Self {
        self.connection_limit = limit;
        self
    }

    /// Set display label
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Parse the driver type; unknown names yield `UnsupportedType`
    pub fn database_type(&self) -> Result<DatabaseType> {
        self.kind.parse()
    }

    /// Resolve the type and validate the fields that type needs
    pub fn check(&self) -> Result<DatabaseType> {
        let db_type = self.database_type()?;
        self.validate()
            .map_err(|e| Error::config(format!("invalid connection config: {}", e)))?;
        if db_type == DatabaseType::Sqlite && self.path.is_none() {
            return Err(Error::config("sqlite connections require a path"));
        }
        Ok(db_type)
    }

    /// Host, defaulting to localhost
    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or("localhost")
    }

    /// Port, defaulting per driver type
    pub fn port(&self) -> u16 {
        self.port
            .or_else(|| self.database_type().ok().and_then(DatabaseType::default_port))
            .unwrap_or(0)
    }

    /// Resolved TLS policy
    pub fn tls(&self) -> Option<TlsPolicy> {
        self.ssl.as_ref().and_then(SslSetting::resolve)
    }

    /// Context used to fill in normalized error messages
    pub fn error_context(&self) -> ErrorContext {
        ErrorContext::new(
            self.host(),
            self.port(),
            self.database.clone().unwrap_or_default(),
        )
    }
}

/// Fixed time bounds applied by adapters and pools
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverTimeouts {
    /// Opening a pooled connection
    pub pool_connect: Duration,
    /// Idle pooled connections older than this are recycled
    pub pool_idle: Duration,
    /// Waiting for a free pooled connection
    pub acquire: Duration,
    /// Running a query on a pooled connection
    pub query: Duration,
    /// Opening the throwaway test connection
    pub test_connect: Duration,
    /// Running the version probe on the test connection
    pub test_query: Duration,
    /// Closing a connection
    pub close: Duration,
}

impl Default for DriverTimeouts {
    fn default() -> Self {
        Self {
            pool_connect: Duration::from_secs(10),
            pool_idle: Duration::from_secs(60),
            acquire: Duration::from_secs(10),
            query: Duration::from_secs(30),
            test_connect: Duration::from_secs(5),
            test_query: Duration::from_secs(3),
            close: Duration::from_secs(1),
        }
    }
}

impl DriverTimeouts {
    /// Set pooled query timeout
    pub fn with_query(mut self, timeout: Duration) -> Self {
        self.query = timeout;
        self
    }

    /// Set acquire timeout
    pub fn with_acquire(mut self, timeout: Duration) -> Self {
        self.acquire = timeout;
        self
    }

    /// Set pooled connect timeout
    pub fn with_pool_connect(mut self, timeout: Duration) -> Self {
        self.pool_connect = timeout;
        self
    }

    /// Set test connect and test query timeouts
    pub fn with_test(mut self, connect: Duration, query: Duration) -> Self {
        self.test_connect = connect;
        self.test_query = query;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_type_parsing() {
        assert_eq!("mysql".parse::<DatabaseType>().unwrap(), DatabaseType::MySql);
        assert_eq!("PostgreSQL".parse::<DatabaseType>().unwrap(), DatabaseType::Postgres);
        assert_eq!("sqlite".parse::<DatabaseType>().unwrap(), DatabaseType::Sqlite);

        let err = "oracle".parse::<DatabaseType>().unwrap_err();
        assert!(err.to_string().contains("Unsupported"));
        assert!(err.to_string().contains("oracle"));
    }

    #[test]
    fn test_ssl_resolution() {
        assert_eq!(SslSetting::Enabled(false).resolve(), None);
        assert_eq!(
            SslSetting::Enabled(true).resolve(),
            Some(TlsPolicy {
                reject_unauthorized: false
            })
        );
        assert_eq!(
            SslSetting::Policy {
                reject_unauthorized: None
            }
            .resolve(),
            Some(TlsPolicy {
                reject_unauthorized: true
            })
        );
        assert_eq!(
            SslSetting::Policy {
                reject_unauthorized: Some(false)
            }
            .resolve(),
            Some(TlsPolicy {
                reject_unauthorized: false
            })
        );
    }

    #[test]
    fn test_config_defaults_from_json() {
        let config: ConnectionConfig =
            serde_json::from_str(r#"{"type":"mysql","host":"db","user":"root"}"#).unwrap();
        assert_eq!(config.connection_limit, 10);
        assert_eq!(config.name, "Unnamed");
        assert_eq!(config.port(), 3306);
        assert_eq!(config.tls(), None);
        assert_eq!(config.auth_plugin, None);

        let config: ConnectionConfig = serde_json::from_str(
            r#"{"type":"mysql","authPlugin":"mysql_clear_password"}"#,
        )
        .unwrap();
        assert_eq!(config.auth_plugin.as_deref(), Some("mysql_clear_password"));

        let config: ConnectionConfig = serde_json::from_str(
            r#"{"type":"postgres","ssl":{"rejectUnauthorized":false},"connectionLimit":3}"#,
        )
        .unwrap();
        assert_eq!(config.port(), 5432);
        assert_eq!(config.host(), "localhost");
        assert_eq!(config.connection_limit, 3);
        assert_eq!(
            config.tls(),
            Some(TlsPolicy {
                reject_unauthorized: false
            })
        );
    }

    #[test]
    fn test_config_check() {
        assert!(ConnectionConfig::new("mysql").check().is_ok());
        assert!(matches!(
            ConnectionConfig::new("unknown").check(),
            Err(Error::UnsupportedType { .. })
        ));
        assert!(matches!(
            ConnectionConfig::new("mysql").with_connection_limit(0).check(),
            Err(Error::Configuration { .. })
        ));
        assert!(ConnectionConfig::new("sqlite").check().is_err());
        assert!(ConnectionConfig::new("sqlite")
            .with_path("/tmp/app.db")
            .check()
            .is_ok());
    }

    #[test]
    fn test_password_redacted_in_debug() {
        let config = ConnectionConfig::new("mysql").with_credentials("root", "s3cret");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("s3cret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_driver_timeouts_default() {
        let t = DriverTimeouts::default();
        assert_eq!(t.pool_connect, Duration::from_secs(10));
        assert_eq!(t.pool_idle, Duration::from_secs(60));
        assert_eq!(t.test_connect, Duration::from_secs(5));
        assert_eq!(t.test_query, Duration::from_secs(3));
    }
}

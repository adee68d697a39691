//! # dbdeck-rdbc
//!
//! Driver layer for the dbdeck connection manager.
//!
//! This crate turns a user-supplied connection profile into something the
//! manager can own: a bounded connection pool, a throwaway probe connection,
//! and errors that speak one vocabulary whatever the driver.
//!
//! ## Features
//!
//! - **Driver Adapters**: MySQL and PostgreSQL behind one `DriverAdapter` trait
//! - **Connection Pooling**: Lazy, semaphore-bounded pools with idle recycling
//! - **Error Normalization**: Driver codes mapped to a closed taxonomy
//! - **Cancellation**: Pooled queries honour a `CancellationToken` and a timeout
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dbdeck_rdbc::prelude::*;
//!
//! let adapters = AdapterRegistry::with_defaults();
//! let config = ConnectionConfig::new("mysql")
//!     .with_host("localhost")
//!     .with_credentials("root", "secret")
//!     .with_database("test");
//!
//! let adapter = adapters.resolve_config(&config)?;
//! let outcome = adapter.test_connection(&config, &DriverTimeouts::default()).await;
//!
//! let pool = adapter.create_pool(&config, &DriverTimeouts::default())?;
//! let rows = pool.query("SELECT 1 AS one", &[]).await?;
//! pool.close().await?;
//! ```
//!
//! ## Feature Flags
//!
//! - `mysql` - MySQL/MariaDB support via mysql_async
//! - `postgres` - PostgreSQL support via tokio-postgres (rustls for TLS)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod adapter;
pub mod connection;
pub mod error;
pub mod pool;
pub mod types;

// Backend implementations (conditionally compiled)
#[cfg(feature = "mysql")]
pub mod mysql;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "postgres")]
pub mod tls;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{normalize, Error, ErrorCategory, ErrorContext, Result};

    // Value and type system
    pub use crate::types::{Row, SensitiveString, Value};

    // Connection traits and config
    pub use crate::connection::{
        Connection, ConnectionConfig, ConnectionFactory, DatabaseType, DriverTimeouts,
        SslSetting, TlsPolicy,
    };

    // Pool types
    pub use crate::pool::{
        AtomicPoolStats, ConnectionPool, PoolConfig, PoolStats, PoolStatus, PooledConnection,
        SimpleConnectionPool,
    };

    // Adapter types
    pub use crate::adapter::{probe_connection, AdapterRegistry, DriverAdapter, TestOutcome};
}

// Re-export commonly used items at crate root
pub use error::{Error, Result};
pub use types::Value;

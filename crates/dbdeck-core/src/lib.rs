//! # dbdeck-core
//!
//! Connection registry and lifecycle manager for dbdeck.
//!
//! The [`ConnectionManager`](manager::ConnectionManager) owns every live
//! pool, hands out `conn_<n>` ids, and turns every driver failure into a
//! `{success: false, message}` result. The [`ops`] module exposes it as a
//! name-addressed operation surface (`db:connect`, `db:disconnect`, ...).
//!
//! ```rust,ignore
//! use dbdeck_core::prelude::*;
//!
//! let manager = ConnectionManager::default();
//! let outcome = manager
//!     .connect(ConnectionConfig::new("mysql").with_credentials("root", "secret"))
//!     .await;
//! if let Some(id) = outcome.id {
//!     let rows = manager.query(&id, "SELECT 1 AS one", &[]).await;
//!     manager.disconnect(&id).await;
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod error;
pub mod manager;
pub mod ops;
pub mod profile;
pub mod registry;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{ManagerError, Result};
    pub use crate::manager::{ConnectOutcome, ConnectionManager, PoolReport, QueryOutcome};
    pub use crate::ops::{dispatch, dispatch_cancellable, handle_request, Operation, OperationRequest, OperationResponse};
    pub use crate::profile::{MemoryProfileStore, ProfileStore};
    pub use crate::registry::{
        ConnectionRecord, ConnectionRegistry, ConnectionStatus, ConnectionSummary, RegistryEvent,
    };

    pub use dbdeck_rdbc::prelude::{
        AdapterRegistry, ConnectionConfig, DatabaseType, DriverTimeouts, SslSetting, TestOutcome,
        Value,
    };
}

pub use error::{ManagerError, Result};
pub use manager::ConnectionManager;

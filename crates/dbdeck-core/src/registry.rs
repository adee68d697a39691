//! Connection registry
//!
//! In-memory table of live connections keyed by generated ids (`conn_<n>`).
//! The registry does no I/O: it owns the pool handles but closing them is
//! the lifecycle manager's job. Every `put`/`remove` is announced on a
//! broadcast channel; nobody listening is fine.

use chrono::{DateTime, Utc};
use dbdeck_rdbc::adapter::DriverAdapter;
use dbdeck_rdbc::connection::{ConnectionConfig, DatabaseType};
use dbdeck_rdbc::pool::ConnectionPool;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Observable status of a registered connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Pool is open and its last connect attempt succeeded
    Connected,
    /// Pool is open but failing to connect or saturated with waiters
    Degraded,
    /// Pool is closed or being closed
    Closed,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Degraded => write!(f, "degraded"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Registry change notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RegistryEvent {
    /// A connection became visible
    Added {
        /// Connection id
        id: String,
    },
    /// A connection was removed
    Removed {
        /// Connection id
        id: String,
    },
}

/// One registered connection. Owns its pool exclusively.
pub struct ConnectionRecord {
    id: String,
    seq: u64,
    config: ConnectionConfig,
    db_type: DatabaseType,
    adapter: Arc<dyn DriverAdapter>,
    pool: Arc<dyn ConnectionPool>,
    created_at: DateTime<Utc>,
    last_used: Mutex<DateTime<Utc>>,
    closing: AtomicBool,
}

impl ConnectionRecord {
    /// Connection id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Originating configuration
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Driver type
    pub fn database_type(&self) -> DatabaseType {
        self.db_type
    }

    /// Adapter that built the pool
    pub fn adapter(&self) -> &Arc<dyn DriverAdapter> {
        &self.adapter
    }

    /// Pool handle
    pub fn pool(&self) -> &Arc<dyn ConnectionPool> {
        &self.pool
    }

    /// Registration time
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Last successful access
    pub fn last_used(&self) -> DateTime<Utc> {
        *self.last_used.lock()
    }

    /// Record an access
    pub fn touch(&self) {
        *self.last_used.lock() = Utc::now();
    }

    /// Whether a disconnect has claimed this record
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Status derived from the pool's health and occupancy
    pub fn status(&self) -> ConnectionStatus {
        if self.is_closing() || self.pool.is_closed() {
            return ConnectionStatus::Closed;
        }
        if !self.pool.is_healthy() {
            return ConnectionStatus::Degraded;
        }
        match self.adapter.pool_status(self.pool.as_ref()) {
            Some(status) if status.is_saturated() => ConnectionStatus::Degraded,
            _ => ConnectionStatus::Connected,
        }
    }

    /// Display row for listings
    pub fn summary(&self) -> ConnectionSummary {
        ConnectionSummary {
            id: self.id.clone(),
            db_type: self.db_type,
            name: self.config.name.clone(),
            status: self.status(),
            created_at: self.created_at,
            last_used: self.last_used(),
        }
    }
}

impl std::fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("id", &self.id)
            .field("type", &self.db_type)
            .field("name", &self.config.name)
            .field("closing", &self.is_closing())
            .finish()
    }
}

/// Listing entry for a registered connection
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSummary {
    /// Connection id
    pub id: String,
    /// Driver type
    #[serde(rename = "type")]
    pub db_type: DatabaseType,
    /// Display label
    pub name: String,
    /// Current status
    pub status: ConnectionStatus,
    /// Registration time
    pub created_at: DateTime<Utc>,
    /// Last successful access
    pub last_used: DateTime<Utc>,
}

/// Thread-safe id → record table
pub struct ConnectionRegistry {
    records: RwLock<HashMap<String, Arc<ConnectionRecord>>>,
    next_id: AtomicU64,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            records: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            events,
        }
    }

    /// Subscribe to add/remove notifications
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Store a pool under the next id. Ids are never reused.
    pub fn put(
        &self,
        config: ConnectionConfig,
        db_type: DatabaseType,
        adapter: Arc<dyn DriverAdapter>,
        pool: Arc<dyn ConnectionPool>,
    ) -> String {
        let seq = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = format!("conn_{}", seq);
        let now = Utc::now();

        let record = Arc::new(ConnectionRecord {
            id: id.clone(),
            seq,
            config,
            db_type,
            adapter,
            pool,
            created_at: now,
            last_used: Mutex::new(now),
            closing: AtomicBool::new(false),
        });
        self.records.write().insert(id.clone(), record);

        debug!(id = %id, db_type = %db_type, "Connection registered");
        // No subscribers is not an error
        let _ = self.events.send(RegistryEvent::Added { id: id.clone() });
        id
    }

    /// Look up a record and mark it used. Records being closed are hidden.
    pub fn get(&self, id: &str) -> Option<Arc<ConnectionRecord>> {
        let record = self.records.read().get(id).cloned()?;
        if record.is_closing() {
            return None;
        }
        record.touch();
        Some(record)
    }

    /// Claim a record for closing. Only the first caller gets it.
    pub fn begin_close(&self, id: &str) -> Option<Arc<ConnectionRecord>> {
        let record = self.records.read().get(id).cloned()?;
        record
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| record)
    }

    /// Remove a record. Does not close its pool.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.records.write().remove(id).is_some();
        if removed {
            debug!(id = %id, "Connection unregistered");
            let _ = self.events.send(RegistryEvent::Removed { id: id.to_string() });
        }
        removed
    }

    /// Every record, in registration order
    pub fn records(&self) -> Vec<Arc<ConnectionRecord>> {
        let mut records: Vec<_> = self.records.read().values().cloned().collect();
        records.sort_by_key(|r| r.seq);
        records
    }

    /// Listing of every record, in registration order
    pub fn list(&self) -> Vec<ConnectionSummary> {
        self.records().iter().map(|r| r.summary()).collect()
    }

    /// Number of registered connections
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

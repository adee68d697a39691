//! Saved connection profiles
//!
//! Profiles live outside the connection registry: the registry only knows
//! about live pools, a profile store only knows about configurations. A
//! process starts with an empty registry whatever the store holds.

use async_trait::async_trait;
use dbdeck_rdbc::connection::ConnectionConfig;
use parking_lot::RwLock;
use std::collections::BTreeMap;

use crate::error::{ManagerError, Result};

/// Trait for connection profile persistence.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Profile names, sorted.
    async fn list(&self) -> Result<Vec<String>>;

    /// Load a profile.
    async fn get(&self, name: &str) -> Result<Option<ConnectionConfig>>;

    /// Create or replace a profile.
    async fn save(&self, name: &str, config: ConnectionConfig) -> Result<()>;

    /// Delete a profile. Returns whether it existed.
    async fn remove(&self, name: &str) -> Result<bool>;

    /// Load a profile that must exist.
    async fn require(&self, name: &str) -> Result<ConnectionConfig> {
        self.get(name)
            .await?
            .ok_or_else(|| ManagerError::ProfileNotFound(name.to_string()))
    }
}

/// In-memory profile store.
#[derive(Debug, Default)]
pub struct MemoryProfileStore {
    profiles: RwLock<BTreeMap<String, ConnectionConfig>>,
}

impl MemoryProfileStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with named configurations
    pub fn from_profiles(profiles: impl IntoIterator<Item = (String, ConnectionConfig)>) -> Self {
        Self {
            profiles: RwLock::new(profiles.into_iter().collect()),
        }
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.profiles.read().keys().cloned().collect())
    }

    async fn get(&self, name: &str) -> Result<Option<ConnectionConfig>> {
        Ok(self.profiles.read().get(name).cloned())
    }

    async fn save(&self, name: &str, config: ConnectionConfig) -> Result<()> {
        self.profiles.write().insert(name.to_string(), config);
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<bool> {
        Ok(self.profiles.write().remove(name).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryProfileStore::new();
        assert!(store.list().await.unwrap().is_empty());

        store
            .save("local", ConnectionConfig::new("mysql").with_host("localhost"))
            .await
            .unwrap();
        store
            .save("analytics", ConnectionConfig::new("postgres"))
            .await
            .unwrap();

        assert_eq!(store.list().await.unwrap(), vec!["analytics", "local"]);
        let local = store.require("local").await.unwrap();
        assert_eq!(local.host.as_deref(), Some("localhost"));

        assert!(store.remove("local").await.unwrap());
        assert!(!store.remove("local").await.unwrap());
        assert!(matches!(
            store.require("local").await,
            Err(ManagerError::ProfileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_seeded_store() {
        let store = MemoryProfileStore::from_profiles([(
            "dev".to_string(),
            ConnectionConfig::new("mysql").with_name("Dev"),
        )]);
        assert_eq!(store.get("dev").await.unwrap().unwrap().name, "Dev");
    }
}

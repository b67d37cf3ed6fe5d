// ABOUTME: Resource registry - lifecycle status of every managed account.
// ABOUTME: Defines the registry contract and a thread-safe in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::StoreError;

/// Lifecycle status of a resource. Only `Active` resources receive work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Active,
    /// Temporarily taken out of rotation by an operator.
    Paused,
    /// Terminal health state; waits for external replacement.
    Suspended,
    /// Permanently removed from rotation.
    Retired,
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceStatus::Active => write!(f, "active"),
            ResourceStatus::Paused => write!(f, "paused"),
            ResourceStatus::Suspended => write!(f, "suspended"),
            ResourceStatus::Retired => write!(f, "retired"),
        }
    }
}

/// One managed account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub status: ResourceStatus,
    #[serde(default)]
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl Resource {
    pub fn active(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ResourceStatus::Active,
            last_activity_at: None,
        }
    }
}

/// Storage for resource lifecycle state, independent of the core's caches.
#[async_trait]
pub trait ResourceRegistry: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Resource>, StoreError>;

    async fn list(&self) -> Result<Vec<Resource>, StoreError>;

    /// Insert or replace a resource.
    async fn upsert(&self, resource: Resource) -> Result<(), StoreError>;

    async fn set_status(&self, id: &str, status: ResourceStatus) -> Result<(), StoreError>;

    /// Record that the resource just did something.
    async fn touch(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Resources eligible for work, sorted by id.
    async fn list_active(&self) -> Result<Vec<Resource>, StoreError> {
        let mut active: Vec<_> = self
            .list()
            .await?
            .into_iter()
            .filter(|r| r.status == ResourceStatus::Active)
            .collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(active)
    }
}

/// In-memory registry.
#[derive(Default)]
pub struct MemoryResourceRegistry {
    resources: RwLock<HashMap<String, Resource>>,
}

impl MemoryResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry pre-populated with active resources.
    pub fn with_active<I, S>(ids: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let resources = ids
            .into_iter()
            .map(|id| {
                let resource = Resource::active(id);
                (resource.id.clone(), resource)
            })
            .collect();
        Arc::new(Self {
            resources: RwLock::new(resources),
        })
    }
}

#[async_trait]
impl ResourceRegistry for MemoryResourceRegistry {
    async fn get(&self, id: &str) -> Result<Option<Resource>, StoreError> {
        Ok(self.resources.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Resource>, StoreError> {
        Ok(self.resources.read().await.values().cloned().collect())
    }

    async fn upsert(&self, resource: Resource) -> Result<(), StoreError> {
        self.resources
            .write()
            .await
            .insert(resource.id.clone(), resource);
        Ok(())
    }

    async fn set_status(&self, id: &str, status: ResourceStatus) -> Result<(), StoreError> {
        let mut resources = self.resources.write().await;
        let resource = resources
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        resource.status = status;
        Ok(())
    }

    async fn touch(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut resources = self.resources.write().await;
        let resource = resources
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        resource.last_activity_at = Some(at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_active_filters_and_sorts() {
        let registry = MemoryResourceRegistry::with_active(["b", "a", "c"]);
        registry.set_status("c", ResourceStatus::Paused).await.unwrap();

        let active: Vec<_> = registry
            .list_active()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(active, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_set_status_unknown_resource() {
        let registry = MemoryResourceRegistry::new();
        let result = registry.set_status("ghost", ResourceStatus::Retired).await;
        assert!(matches!(result, Err(StoreError::NotFound(id)) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_touch_records_activity() {
        let registry = MemoryResourceRegistry::with_active(["a"]);
        let now = Utc::now();
        registry.touch("a", now).await.unwrap();
        let resource = registry.get("a").await.unwrap().unwrap();
        assert_eq!(resource.last_activity_at, Some(now));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ResourceStatus::Active.to_string(), "active");
        assert_eq!(ResourceStatus::Suspended.to_string(), "suspended");
    }
}

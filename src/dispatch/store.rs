// ABOUTME: Durable task store contract polled by the dispatcher.
// ABOUTME: Includes an in-memory implementation with conditional status updates.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::task::{Task, TaskStatus};
use crate::error::StoreError;

/// Storage for task records.
///
/// `claim` must be a conditional update (`pending → in_progress` only if the
/// task is still pending) so two dispatch cycles can never both run a task.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: Task) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Task>, StoreError>;

    /// The most urgent due pending task for a resource: lowest priority
    /// number first, then earliest `scheduled_at`.
    async fn find_next_eligible(
        &self,
        resource_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError>;

    /// Move a pending task to in-progress. Returns false if it was not pending.
    async fn claim(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn complete(&self, id: Uuid) -> Result<(), StoreError>;

    /// Put a task back to pending, not before `at`.
    async fn reschedule(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        attempts: u32,
        last_error: Option<String>,
    ) -> Result<(), StoreError>;

    /// Mark a task permanently failed.
    async fn fail(&self, id: Uuid, attempts: u32, reason: String) -> Result<(), StoreError>;

    /// Cancel a pending task. Returns false if it was not pending.
    async fn cancel(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Push every pending task of a resource scheduled before `before`
    /// later by `by`. Returns the number of tasks moved.
    async fn defer_pending(
        &self,
        resource_id: &str,
        before: DateTime<Utc>,
        by: Duration,
    ) -> Result<usize, StoreError>;

    /// Return tasks left in progress by a previous process to pending.
    async fn reset_in_progress(&self) -> Result<usize, StoreError>;

    async fn list_for_resource(&self, resource_id: &str) -> Result<Vec<Task>, StoreError>;
}

/// In-memory task store.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<Uuid, Task>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new store wrapped in Arc for sharing.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    async fn update<F>(&self, id: Uuid, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Task) + Send,
    {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        f(task);
        task.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert(&self, task: Task) -> Result<(), StoreError> {
        self.tasks.write().await.insert(task.id, task);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn find_next_eligible(
        &self,
        resource_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .values()
            .filter(|t| t.resource_id == resource_id && t.is_due(now))
            .min_by_key(|t| (t.priority, t.scheduled_at, t.created_at))
            .cloned())
    }

    async fn claim(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if task.status != TaskStatus::Pending {
            return Ok(false);
        }
        task.status = TaskStatus::InProgress;
        task.updated_at = Utc::now();
        Ok(true)
    }

    async fn complete(&self, id: Uuid) -> Result<(), StoreError> {
        self.update(id, |t| {
            t.status = TaskStatus::Completed;
            t.last_error = None;
        })
        .await
    }

    async fn reschedule(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        attempts: u32,
        last_error: Option<String>,
    ) -> Result<(), StoreError> {
        self.update(id, |t| {
            t.status = TaskStatus::Pending;
            t.scheduled_at = at;
            t.attempts = attempts;
            if last_error.is_some() {
                t.last_error = last_error;
            }
        })
        .await
    }

    async fn fail(&self, id: Uuid, attempts: u32, reason: String) -> Result<(), StoreError> {
        self.update(id, |t| {
            t.status = TaskStatus::Failed;
            t.attempts = attempts;
            t.last_error = Some(reason);
        })
        .await
    }

    async fn cancel(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if task.status != TaskStatus::Pending {
            return Ok(false);
        }
        task.status = TaskStatus::Cancelled;
        task.updated_at = Utc::now();
        Ok(true)
    }

    async fn defer_pending(
        &self,
        resource_id: &str,
        before: DateTime<Utc>,
        by: Duration,
    ) -> Result<usize, StoreError> {
        let mut tasks = self.tasks.write().await;
        let mut moved = 0;
        for task in tasks.values_mut().filter(|t| {
            t.resource_id == resource_id && t.status == TaskStatus::Pending && t.scheduled_at < before
        }) {
            task.scheduled_at += by;
            task.updated_at = Utc::now();
            moved += 1;
        }
        Ok(moved)
    }

    async fn reset_in_progress(&self) -> Result<usize, StoreError> {
        let mut tasks = self.tasks.write().await;
        let mut reset = 0;
        for task in tasks
            .values_mut()
            .filter(|t| t.status == TaskStatus::InProgress)
        {
            task.status = TaskStatus::Pending;
            task.updated_at = Utc::now();
            reset += 1;
        }
        Ok(reset)
    }

    async fn list_for_resource(&self, resource_id: &str) -> Result<Vec<Task>, StoreError> {
        let tasks = self.tasks.read().await;
        let mut found: Vec<_> = tasks
            .values()
            .filter(|t| t.resource_id == resource_id)
            .cloned()
            .collect();
        found.sort_by_key(|t| (t.scheduled_at, t.priority));
        Ok(found)
    }
}

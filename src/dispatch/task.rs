// ABOUTME: Task data model - one scheduled unit of work against one resource.
// ABOUTME: Tracks scheduling, priority, attempts, and lifecycle status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::ActionSpec;

/// Default priority for new tasks. Lower is more urgent.
pub const DEFAULT_TASK_PRIORITY: u32 = 5;

/// Lifecycle state of a task.
///
/// Transitions: `Pending → InProgress → Completed | Failed`, `InProgress →
/// Pending` on a retryable failure, and `Pending → Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether the task will never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A unit of scheduled work bound to one resource and one action kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub resource_id: String,
    /// Action kind; also the quota bucket the task draws from.
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Not dispatched before this instant.
    pub scheduled_at: DateTime<Utc>,
    pub priority: u32,
    pub attempts: u32,
    pub status: TaskStatus,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a pending task at the default priority.
    pub fn new(
        resource_id: impl Into<String>,
        kind: impl Into<String>,
        payload: serde_json::Value,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            resource_id: resource_id.into(),
            kind: kind.into(),
            payload,
            scheduled_at,
            priority: DEFAULT_TASK_PRIORITY,
            attempts: 0,
            status: TaskStatus::Pending,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Whether the dispatcher may pick this task at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.scheduled_at <= now
    }

    /// The action handed to the automation backend.
    pub fn action_spec(&self) -> ActionSpec {
        ActionSpec {
            kind: self.kind.clone(),
            payload: self.payload.clone(),
            task_id: Some(self.id),
        }
    }
}

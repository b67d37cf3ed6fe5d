// ABOUTME: Contracts for the external automation backend that opens sessions and acts.
// ABOUTME: The core never inspects actions; it only bounds, orders, and counts them.

mod scripted;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use scripted::ScriptedBackend;

/// Opaque handle returned by the backend when it opens a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle(pub String);

/// A live, expensive external session bound to one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: Uuid,
    pub resource_id: String,
    pub handle: SessionHandle,
    pub created_at: DateTime<Utc>,
}

/// What the backend is asked to do. The payload is domain specific.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Task this action executes, when dispatched from the task store.
    #[serde(default)]
    pub task_id: Option<Uuid>,
}

impl ActionSpec {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            task_id: None,
        }
    }
}

/// Result of one action as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl ActionOutcome {
    pub fn success() -> Self {
        Self {
            success: true,
            error_detail: None,
        }
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            error_detail: Some(detail.into()),
        }
    }
}

/// Opens and closes the expensive per-resource sessions.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Open a session for a resource.
    async fn open(&self, resource_id: &str) -> Result<SessionHandle, anyhow::Error>;

    /// Close a session. Must be safe to call on a session that already died.
    async fn close(&self, session: &Session) -> Result<(), anyhow::Error>;
}

/// Performs domain actions inside an open session.
///
/// Implementations should return promptly: the caller holds the resource's
/// lock for the duration and additionally bounds each call with
/// `CoreConfig::action_timeout`.
#[async_trait]
pub trait AutomationBackend: Send + Sync {
    async fn perform_action(
        &self,
        resource_id: &str,
        session: &Session,
        action: &ActionSpec,
    ) -> ActionOutcome;
}

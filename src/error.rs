// ABOUTME: Defines all error types for the campaign core using thiserror.
// ABOUTME: Each component has its own error enum, unified under CoreError.

use std::time::Duration;

/// Top-level error type for the campaign core.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Quota error: {0}")]
    Quota(#[from] QuotaError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors from the per-resource action coordinator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    /// The resource's wait queue is at capacity. Not retried internally.
    #[error("queue for resource '{resource_id}' is full ({depth} waiting)")]
    QueueFull { resource_id: String, depth: usize },

    /// The request was not granted before its deadline.
    #[error("'{requester}' timed out after {waited:?} waiting for resource '{resource_id}'")]
    Timeout {
        resource_id: String,
        requester: String,
        waited: Duration,
    },

    /// The coordinator was shut down while the request was pending.
    #[error("coordinator shut down")]
    Shutdown,
}

/// Errors from the quota ledger.
#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    /// The daily limit for this resource and action kind is spent.
    #[error("daily quota for '{kind}' on resource '{resource_id}' exhausted ({limit}/day)")]
    Exhausted {
        resource_id: String,
        kind: String,
        limit: u32,
    },

    #[error("quota store failure: {0}")]
    Store(#[source] anyhow::Error),
}

/// Errors from the session pool.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to open session for '{resource_id}': {source}")]
    Open {
        resource_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to close session for '{resource_id}': {source}")]
    Close {
        resource_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("session pool is stopped")]
    Stopped,
}

/// Errors from the task store and resource registry.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("store backend failure: {0}")]
    Backend(#[source] anyhow::Error),
}

/// Errors from configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ABOUTME: Collaborator hooks the health monitor calls out to.
// ABOUTME: Remediation runs on suspension; the engagement probe reports stale resources.

use std::sync::Arc;

use async_trait::async_trait;

/// Called when a resource is suspended, e.g. to provision a replacement.
///
/// Invoked fire-and-forget, exactly once per suspension.
#[async_trait]
pub trait RemediationHook: Send + Sync {
    async fn on_suspended(&self, resource_id: &str) -> Result<(), anyhow::Error>;
}

/// Reports whether a resource's recent activity is drawing no engagement.
#[async_trait]
pub trait EngagementProbe: Send + Sync {
    async fn is_stale(&self, resource_id: &str) -> Result<bool, anyhow::Error>;
}

/// Remediation that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRemediation;

#[async_trait]
impl RemediationHook for NoopRemediation {
    async fn on_suspended(&self, resource_id: &str) -> Result<(), anyhow::Error> {
        tracing::info!(resource_id, "resource suspended, no remediation configured");
        Ok(())
    }
}

/// Probe that never reports staleness.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverStale;

#[async_trait]
impl EngagementProbe for NeverStale {
    async fn is_stale(&self, _resource_id: &str) -> Result<bool, anyhow::Error> {
        Ok(false)
    }
}

/// Adapts a closure into a remediation hook.
pub struct RemediationFn<F> {
    callback: F,
}

impl<F> RemediationFn<F>
where
    F: Fn(&str) + Send + Sync + 'static,
{
    pub fn new(callback: F) -> Arc<Self> {
        Arc::new(Self { callback })
    }
}

#[async_trait]
impl<F> RemediationHook for RemediationFn<F>
where
    F: Fn(&str) + Send + Sync + 'static,
{
    async fn on_suspended(&self, resource_id: &str) -> Result<(), anyhow::Error> {
        (self.callback)(resource_id);
        Ok(())
    }
}

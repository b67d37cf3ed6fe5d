// ABOUTME: Runtime context handed to a campaign pass on one resource.
// ABOUTME: Actions performed through it are quota-checked, time-bounded, and fed to health.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::backend::{ActionOutcome, ActionSpec, AutomationBackend, Session};
use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::coordinator::Coordinator;
use crate::dispatch::{Task, TaskStore};
use crate::error::{QuotaError, StoreError};
use crate::health::HealthMonitor;
use crate::quota::QuotaLedger;
use crate::registry::ResourceRegistry;
use crate::session::SessionPool;

/// Shared collaborators every workstream uses.
pub struct CampaignDeps {
    pub config: Arc<CoreConfig>,
    pub clock: Arc<dyn Clock>,
    pub coordinator: Arc<Coordinator>,
    pub pool: Arc<SessionPool>,
    pub ledger: Arc<QuotaLedger>,
    pub tasks: Arc<dyn TaskStore>,
    pub registry: Arc<dyn ResourceRegistry>,
    pub automation: Arc<dyn AutomationBackend>,
    pub health: Arc<HealthMonitor>,
}

/// What a campaign sees during one pass.
pub struct CampaignContext<'a> {
    resource_id: &'a str,
    session: &'a Session,
    deps: &'a CampaignDeps,
}

impl<'a> CampaignContext<'a> {
    pub(crate) fn new(resource_id: &'a str, session: &'a Session, deps: &'a CampaignDeps) -> Self {
        Self {
            resource_id,
            session,
            deps,
        }
    }

    pub fn resource_id(&self) -> &str {
        self.resource_id
    }

    pub fn session(&self) -> &Session {
        self.session
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.deps.clock.now()
    }

    /// Today's remaining allowance for `kind`, `None` when unlimited.
    pub async fn remaining(&self, kind: &str) -> Result<Option<u32>, QuotaError> {
        self.deps.ledger.remaining(self.resource_id, kind).await
    }

    /// Perform an action now on the locked resource.
    ///
    /// Fails with `QuotaError::Exhausted` without acting when the kind is
    /// out of quota. The outcome is recorded for health classification.
    pub async fn perform(&self, action: &ActionSpec) -> Result<ActionOutcome, QuotaError> {
        self.deps
            .ledger
            .try_reserve(self.resource_id, &action.kind)
            .await?;

        let timeout = self.deps.config.action_timeout();
        let outcome = tokio::time::timeout(
            timeout,
            self.deps
                .automation
                .perform_action(self.resource_id, self.session, action),
        )
        .await
        .unwrap_or_else(|_| ActionOutcome::failure(format!("action timed out after {:?}", timeout)));

        self.deps.health.record(self.resource_id, outcome.success);
        if outcome.success {
            if let Err(e) = self
                .deps
                .registry
                .touch(self.resource_id, self.deps.clock.now())
                .await
            {
                tracing::warn!(resource_id = self.resource_id, error = %e, "failed to record activity");
            }
        }
        Ok(outcome)
    }

    /// Queue work for the dispatcher.
    pub async fn schedule(&self, task: Task) -> Result<(), StoreError> {
        tracing::debug!(
            resource_id = self.resource_id,
            task_id = %task.id,
            kind = %task.kind,
            scheduled_at = %task.scheduled_at,
            "task scheduled"
        );
        self.deps.tasks.insert(task).await
    }
}

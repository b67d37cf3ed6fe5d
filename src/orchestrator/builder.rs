// ABOUTME: Builder wiring every collaborator into an Orchestrator.
// ABOUTME: Stores, clock, and hooks default to in-memory and no-op implementations.

use std::sync::Arc;

use crate::backend::{AutomationBackend, SessionBackend};
use crate::campaign::Campaign;
use crate::clock::{Clock, SystemClock};
use crate::config::CoreConfig;
use crate::dispatch::{MemoryTaskStore, TaskStore};
use crate::error::{ConfigError, CoreError};
use crate::health::{EngagementProbe, NeverStale, NoopRemediation, RemediationHook};
use crate::quota::{MemoryQuotaStore, QuotaStore};
use crate::registry::{MemoryResourceRegistry, ResourceRegistry};

use super::orchestrator::Orchestrator;

/// Builder for constructing an orchestrator.
///
/// Only the two backends are required.
pub struct OrchestratorBuilder {
    pub(super) config: CoreConfig,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) tasks: Arc<dyn TaskStore>,
    pub(super) quotas: Arc<dyn QuotaStore>,
    pub(super) registry: Arc<dyn ResourceRegistry>,
    pub(super) sessions: Option<Arc<dyn SessionBackend>>,
    pub(super) automation: Option<Arc<dyn AutomationBackend>>,
    pub(super) remediation: Arc<dyn RemediationHook>,
    pub(super) probe: Arc<dyn EngagementProbe>,
    pub(super) campaigns: Vec<Arc<dyn Campaign>>,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            config: CoreConfig::default(),
            clock: Arc::new(SystemClock),
            tasks: MemoryTaskStore::shared(),
            quotas: MemoryQuotaStore::shared(),
            registry: Arc::new(MemoryResourceRegistry::new()),
            sessions: None,
            automation: None,
            remediation: Arc::new(NoopRemediation),
            probe: Arc::new(NeverStale),
            campaigns: Vec::new(),
        }
    }

    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn task_store(mut self, tasks: Arc<dyn TaskStore>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn quota_store(mut self, quotas: Arc<dyn QuotaStore>) -> Self {
        self.quotas = quotas;
        self
    }

    pub fn registry(mut self, registry: Arc<dyn ResourceRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn session_backend(mut self, backend: Arc<dyn SessionBackend>) -> Self {
        self.sessions = Some(backend);
        self
    }

    pub fn automation_backend(mut self, backend: Arc<dyn AutomationBackend>) -> Self {
        self.automation = Some(backend);
        self
    }

    /// Use one object as both session and automation backend.
    pub fn backend<B>(self, backend: Arc<B>) -> Self
    where
        B: SessionBackend + AutomationBackend + 'static,
    {
        self.session_backend(backend.clone())
            .automation_backend(backend)
    }

    pub fn remediation(mut self, hook: Arc<dyn RemediationHook>) -> Self {
        self.remediation = hook;
        self
    }

    pub fn engagement_probe(mut self, probe: Arc<dyn EngagementProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Add a campaign run on every active resource.
    pub fn campaign(mut self, campaign: Arc<dyn Campaign>) -> Self {
        self.campaigns.push(campaign);
        self
    }

    /// Validate the configuration and wire the components.
    pub fn build(self) -> Result<Orchestrator, CoreError> {
        self.config.validate()?;
        let (Some(sessions), Some(automation)) = (self.sessions.clone(), self.automation.clone())
        else {
            return Err(ConfigError::Invalid(
                "both a session backend and an automation backend are required".into(),
            )
            .into());
        };
        Ok(Orchestrator::assemble(self, sessions, automation))
    }
}

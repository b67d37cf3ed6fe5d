// ABOUTME: Prelude module - convenient imports for common use cases.
// ABOUTME: Use `use campaign_core::prelude::*;` to get started quickly.

pub use crate::backend::{
    ActionOutcome, ActionSpec, AutomationBackend, ScriptedBackend, Session, SessionBackend,
    SessionHandle,
};
pub use crate::campaign::{Campaign, CampaignContext, CampaignDeps, Workstreams};
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::config::{
    CoreConfig, CoreConfigBuilder, DISPATCHER_REQUESTER, HealthThresholds, PacingConfig,
    RequesterProfile,
};
pub use crate::coordinator::{ActionPacer, Coordinator, LockGrant};
pub use crate::dispatch::{Dispatcher, DispatcherParts, MemoryTaskStore, Task, TaskStatus, TaskStore};
pub use crate::error::{ConfigError, CoreError, LockError, QuotaError, SessionError, StoreError};
pub use crate::health::{
    EngagementProbe, HealthFlags, HealthMonitor, HealthReport, HealthState, NeverStale,
    NoopRemediation, RemediationFn, RemediationHook,
};
pub use crate::orchestrator::{Orchestrator, OrchestratorBuilder, ReconcileReport, ShutdownReport};
pub use crate::quota::{MemoryQuotaStore, QuotaKey, QuotaLedger, QuotaStore, QuotaUsage, Reservation};
pub use crate::registry::{MemoryResourceRegistry, Resource, ResourceRegistry, ResourceStatus};
pub use crate::session::{SessionPool, StopReport};

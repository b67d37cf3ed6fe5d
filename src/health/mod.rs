// ABOUTME: Health module - classifies resources from action outcomes.
// ABOUTME: Contains the state machine, its monitor, and the remediation and probe hooks.

mod hooks;
mod monitor;
mod state;

pub use hooks::{EngagementProbe, NeverStale, NoopRemediation, RemediationFn, RemediationHook};
pub use monitor::HealthMonitor;
pub use state::{HealthFlags, HealthReport, HealthState};

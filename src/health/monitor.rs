// ABOUTME: Rolling-window health monitor driving each resource's state machine.
// ABOUTME: Runs quota halving, task deferral, and suspension side effects on entry.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Duration;

use super::hooks::{EngagementProbe, RemediationHook};
use super::state::{HealthFlags, HealthReport, HealthState};
use crate::clock::Clock;
use crate::config::HealthThresholds;
use crate::dispatch::TaskStore;
use crate::error::CoreError;
use crate::quota::QuotaLedger;
use crate::registry::{ResourceRegistry, ResourceStatus};

#[derive(Default)]
struct ResourceHealth {
    /// Newest outcome at the back.
    window: VecDeque<bool>,
    state: HealthState,
    flags: HealthFlags,
    /// Entered state whose side effects failed and are retried on the next check.
    unapplied: Option<HealthState>,
}

impl ResourceHealth {
    fn success_rate(&self, min_samples: usize) -> Option<f64> {
        if self.window.is_empty() || self.window.len() < min_samples {
            return None;
        }
        let successes = self.window.iter().filter(|ok| **ok).count();
        Some(successes as f64 / self.window.len() as f64)
    }

    fn consecutive_failures(&self) -> usize {
        self.window.iter().rev().take_while(|ok| !**ok).count()
    }
}

/// Evaluates resource health and applies transitions.
///
/// Outcomes are fed in with `record` by whoever ran the action. `classify`
/// derives a candidate state from three signals and moves the resource's
/// state machine, all under one lock so concurrent checks of the same
/// resource cannot both enter a state. Side effects run after the lock is
/// dropped, once per entered state. If they fail, the next `classify` of
/// the same state runs them again; the remediation hook is not repeated.
pub struct HealthMonitor {
    records: Mutex<HashMap<String, ResourceHealth>>,
    thresholds: HealthThresholds,
    ledger: Arc<QuotaLedger>,
    tasks: Arc<dyn TaskStore>,
    registry: Arc<dyn ResourceRegistry>,
    remediation: Arc<dyn RemediationHook>,
    probe: Arc<dyn EngagementProbe>,
    clock: Arc<dyn Clock>,
}

impl HealthMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        thresholds: HealthThresholds,
        ledger: Arc<QuotaLedger>,
        tasks: Arc<dyn TaskStore>,
        registry: Arc<dyn ResourceRegistry>,
        remediation: Arc<dyn RemediationHook>,
        probe: Arc<dyn EngagementProbe>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            thresholds,
            ledger,
            tasks,
            registry,
            remediation,
            probe,
            clock,
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, ResourceHealth>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add one action outcome to the resource's rolling window.
    pub fn record(&self, resource_id: &str, success: bool) {
        let window_size = self.thresholds.window_size.max(1);
        let mut records = self.records();
        let health = records.entry(resource_id.to_string()).or_default();
        health.window.push_back(success);
        while health.window.len() > window_size {
            health.window.pop_front();
        }
    }

    /// Current state without re-evaluating. Unknown resources are healthy.
    pub fn state(&self, resource_id: &str) -> HealthState {
        self.records()
            .get(resource_id)
            .map(|h| h.state)
            .unwrap_or_default()
    }

    /// Snapshot of the resource's window, state, and last flags.
    pub fn report(&self, resource_id: &str) -> HealthReport {
        let records = self.records();
        let empty = ResourceHealth::default();
        let health = records.get(resource_id).unwrap_or(&empty);
        HealthReport {
            resource_id: resource_id.to_string(),
            state: health.state,
            samples: health.window.len(),
            success_rate: health.success_rate(self.thresholds.min_samples),
            consecutive_failures: health.consecutive_failures(),
            flags: health.flags,
        }
    }

    /// Clear a resource's record after it was reactivated externally.
    pub fn reactivate(&self, resource_id: &str) {
        if let Some(previous) = self.records().remove(resource_id) {
            tracing::info!(resource_id, from = %previous.state, "health record reset");
        }
    }

    /// Evaluate the resource and apply any resulting transition.
    pub async fn classify(&self, resource_id: &str) -> Result<HealthState, CoreError> {
        let stale = match self.probe.is_stale(resource_id).await {
            Ok(stale) => stale,
            Err(e) => {
                tracing::warn!(resource_id, error = %e, "engagement probe failed, ignoring");
                false
            }
        };

        let (from, to, retry) = {
            let mut records = self.records();
            let health = records.entry(resource_id.to_string()).or_default();
            let (candidate, flags) = self.evaluate(health, stale);
            health.flags = flags;

            let from = health.state;
            let to = if from == HealthState::RateLimited && candidate < from {
                HealthState::Healthy
            } else if candidate > from && from.can_transition_to(candidate) {
                candidate
            } else {
                from
            };
            health.state = to;
            (from, to, from == to && health.unapplied == Some(to))
        };

        let applied = if from != to {
            tracing::info!(resource_id, %from, %to, "health transition");
            self.on_enter(resource_id, to).await
        } else if retry {
            tracing::info!(resource_id, state = %to, "retrying health side effects");
            self.apply_effects(resource_id, to).await
        } else {
            return Ok(to);
        };

        if let Err(e) = &applied {
            tracing::warn!(resource_id, state = %to, error = %e, "health side effects failed");
        }
        self.mark_applied(resource_id, to, applied.is_ok());
        applied.map(|()| to)
    }

    fn mark_applied(&self, resource_id: &str, state: HealthState, applied: bool) {
        let mut records = self.records();
        if let Some(health) = records.get_mut(resource_id).filter(|h| h.state == state) {
            health.unapplied = (!applied).then_some(state);
        }
    }

    fn evaluate(&self, health: &ResourceHealth, stale: bool) -> (HealthState, HealthFlags) {
        let t = &self.thresholds;
        let mut flags = HealthFlags {
            stale_engagement: stale,
            ..HealthFlags::default()
        };
        let mut candidate = HealthState::Healthy;

        if let Some(rate) = health.success_rate(t.min_samples) {
            if rate < t.suspend_below {
                flags.critical_success_rate = true;
                candidate = candidate.max(HealthState::Suspended);
            } else if rate < t.restrict_below {
                flags.low_success_rate = true;
                candidate = candidate.max(HealthState::ShadowRestricted);
            }
        }
        if health.consecutive_failures() >= t.consecutive_failures.max(1) {
            flags.failure_streak = true;
            candidate = candidate.max(HealthState::RateLimited);
        }
        if stale {
            candidate = candidate.max(HealthState::ShadowRestricted);
        }
        (candidate, flags)
    }

    async fn on_enter(&self, resource_id: &str, state: HealthState) -> Result<(), CoreError> {
        if state == HealthState::Suspended {
            let hook = Arc::clone(&self.remediation);
            let id = resource_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = hook.on_suspended(&id).await {
                    tracing::error!(resource_id = %id, error = %e, "remediation hook failed");
                }
            });
        }
        self.apply_effects(resource_id, state).await
    }

    async fn apply_effects(&self, resource_id: &str, state: HealthState) -> Result<(), CoreError> {
        match state {
            HealthState::Healthy => {}
            HealthState::RateLimited => {
                self.ledger.halve_remaining(resource_id).await?;
            }
            HealthState::ShadowRestricted => {
                let pause = Duration::hours(self.thresholds.shadow_pause_hours);
                let horizon = self.clock.now() + pause;
                let deferred = self.tasks.defer_pending(resource_id, horizon, pause).await?;
                tracing::info!(resource_id, deferred, "pending tasks deferred");
            }
            HealthState::Suspended => {
                self.registry
                    .set_status(resource_id, ResourceStatus::Suspended)
                    .await?;
            }
        }
        Ok(())
    }
}

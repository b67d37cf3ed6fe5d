// ABOUTME: Quota-aware dispatcher turning due tasks into serialized backend actions.
// ABOUTME: Keeps at most one task in flight per resource and settles every outcome in the store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::store::TaskStore;
use super::task::Task;
use crate::backend::{ActionOutcome, AutomationBackend};
use crate::clock::Clock;
use crate::config::{CoreConfig, DISPATCHER_REQUESTER};
use crate::coordinator::{ActionPacer, Coordinator};
use crate::error::{CoreError, QuotaError, SessionError};
use crate::health::{HealthMonitor, HealthState};
use crate::quota::{QuotaLedger, Reservation};
use crate::registry::ResourceRegistry;
use crate::session::SessionPool;

/// Collaborators the dispatcher drives.
pub struct DispatcherParts {
    pub config: Arc<CoreConfig>,
    pub clock: Arc<dyn Clock>,
    pub tasks: Arc<dyn TaskStore>,
    pub registry: Arc<dyn ResourceRegistry>,
    pub ledger: Arc<QuotaLedger>,
    pub coordinator: Arc<Coordinator>,
    pub pool: Arc<SessionPool>,
    pub automation: Arc<dyn AutomationBackend>,
    pub health: Arc<HealthMonitor>,
    pub pacer: Option<Arc<ActionPacer>>,
}

/// Why an accepted task did not get to run.
enum Deferral {
    Lock(String),
    Session(SessionError),
    Paced,
    Closed,
}

impl std::fmt::Display for Deferral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Deferral::Lock(reason) => write!(f, "{}", reason),
            Deferral::Session(e) => write!(f, "{}", e),
            Deferral::Paced => write!(f, "pacing wait cancelled"),
            Deferral::Closed => write!(f, "dispatcher closed"),
        }
    }
}

/// A resource's entry in the in-flight map.
enum Slot {
    /// A cycle is choosing and claiming the resource's next task.
    Dispatching,
    Running(JoinHandle<()>),
}

/// Holds a resource's `Slot::Dispatching` entry until an execution is
/// spawned. Dropped without spawning, it frees the slot.
struct SlotGuard<'a> {
    dispatcher: &'a Dispatcher,
    resource_id: &'a str,
    armed: bool,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut in_flight = self.dispatcher.in_flight_map();
        if matches!(in_flight.get(self.resource_id), Some(Slot::Dispatching)) {
            in_flight.remove(self.resource_id);
        }
    }
}

/// Polls the task store and executes due work.
///
/// Each cycle visits every active, non-suspended resource with nothing in
/// flight, reserves quota for its most urgent due task, claims it, and
/// spawns the execution. Quota is taken at acceptance; it is given back only
/// when the action never ran.
pub struct Dispatcher {
    parts: DispatcherParts,
    in_flight: Mutex<HashMap<String, Slot>>,
    pacing_cancel: CancellationToken,
    closed: AtomicBool,
}

impl Dispatcher {
    pub fn new(parts: DispatcherParts) -> Self {
        Self {
            parts,
            in_flight: Mutex::new(HashMap::new()),
            pacing_cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn in_flight_map(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark a resource as being dispatched unless something already is.
    fn reserve_slot<'a>(&'a self, resource_id: &'a str) -> Option<SlotGuard<'a>> {
        let mut in_flight = self.in_flight_map();
        if in_flight.contains_key(resource_id) {
            return None;
        }
        in_flight.insert(resource_id.to_string(), Slot::Dispatching);
        Some(SlotGuard {
            dispatcher: self,
            resource_id,
            armed: true,
        })
    }

    /// Run one dispatch cycle. Returns the number of executions started.
    ///
    /// A failure on one resource is logged and does not stop the cycle.
    pub async fn dispatch_ready(self: &Arc<Self>) -> Result<usize, CoreError> {
        if self.is_closed() {
            return Ok(0);
        }
        let resources = self.parts.registry.list_active().await?;
        let mut started = 0;

        for resource in resources {
            let resource_id = resource.id;
            if self.parts.health.state(&resource_id) == HealthState::Suspended {
                continue;
            }
            let Some(slot) = self.reserve_slot(&resource_id) else {
                continue;
            };
            match self.dispatch_resource(&resource_id, slot).await {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(resource_id = %resource_id, error = %e, "dispatch failed for resource")
                }
            }
        }

        if started > 0 {
            tracing::info!(started, "dispatch cycle");
        }
        Ok(started)
    }

    /// Accept the resource's most urgent due task.
    ///
    /// A task whose kind is out of quota moves to the next day and the
    /// resource is left alone until the next cycle.
    async fn dispatch_resource(
        self: &Arc<Self>,
        resource_id: &str,
        mut slot: SlotGuard<'_>,
    ) -> Result<bool, CoreError> {
        let now = self.parts.clock.now();
        while let Some(task) = self.parts.tasks.find_next_eligible(resource_id, now).await? {
            let reservation = match self.parts.ledger.try_reserve(resource_id, &task.kind).await {
                Ok(reservation) => reservation,
                Err(QuotaError::Exhausted { limit, .. }) => {
                    let at = self.parts.ledger.next_reset();
                    self.parts
                        .tasks
                        .reschedule(task.id, at, task.attempts, None)
                        .await?;
                    tracing::info!(
                        resource_id,
                        task_id = %task.id,
                        kind = %task.kind,
                        limit,
                        %at,
                        "daily quota exhausted, task moved to next day"
                    );
                    return Ok(false);
                }
                Err(e) => return Err(e.into()),
            };

            if self.is_closed() {
                self.parts
                    .ledger
                    .refund(resource_id, &task.kind, reservation)
                    .await?;
                return Ok(false);
            }
            if !self.parts.tasks.claim(task.id).await? {
                self.parts
                    .ledger
                    .refund(resource_id, &task.kind, reservation)
                    .await?;
                tracing::debug!(resource_id, task_id = %task.id, "task claimed elsewhere");
                continue;
            }

            tracing::debug!(
                resource_id,
                task_id = %task.id,
                kind = %task.kind,
                priority = task.priority,
                "task dispatched"
            );
            return match self.spawn_execution(task, reservation, &mut slot) {
                None => Ok(true),
                Some((task, reservation)) => {
                    self.defer(&task, reservation, Deferral::Closed).await;
                    Ok(false)
                }
            };
        }
        Ok(false)
    }

    /// Start the execution in the resource's reserved slot.
    ///
    /// Hands the work back unspawned if `wait_idle` closed the dispatcher
    /// meanwhile.
    fn spawn_execution(
        self: &Arc<Self>,
        task: Task,
        reservation: Reservation,
        slot: &mut SlotGuard<'_>,
    ) -> Option<(Task, Reservation)> {
        // Held across spawn so the task cannot deregister before it is registered.
        let mut in_flight = self.in_flight_map();
        if self.is_closed() {
            return Some((task, reservation));
        }
        let resource_id = task.resource_id.clone();
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let resource_id = task.resource_id.clone();
            this.execute(task, reservation).await;
            this.in_flight_map().remove(&resource_id);
        });
        in_flight.insert(resource_id, Slot::Running(handle));
        slot.armed = false;
        None
    }

    async fn execute(&self, task: Task, reservation: Reservation) {
        let resource_id = task.resource_id.as_str();

        if let Some(pacer) = &self.parts.pacer {
            if pacer.pace(resource_id, &self.pacing_cancel).await.is_err() {
                self.defer(&task, reservation, Deferral::Paced).await;
                return;
            }
        }

        let action = &task.action_spec();
        let action_timeout = self.parts.config.action_timeout();
        let priority = self.parts.config.priority(DISPATCHER_REQUESTER);
        let result = self
            .parts
            .coordinator
            .run_exclusive(resource_id, DISPATCHER_REQUESTER, priority, move || async move {
                let session = self.parts.pool.obtain(resource_id).await?;
                let outcome = tokio::time::timeout(
                    action_timeout,
                    self.parts
                        .automation
                        .perform_action(resource_id, &session, action),
                )
                .await
                .unwrap_or_else(|_| {
                    ActionOutcome::failure(format!("action timed out after {:?}", action_timeout))
                });
                self.parts.pool.release(resource_id);
                Ok::<_, SessionError>(outcome)
            })
            .await;

        match result {
            Ok(Ok(outcome)) => self.settle(&task, outcome).await,
            Ok(Err(e)) => self.defer(&task, reservation, Deferral::Session(e)).await,
            Err(e) => self.defer(&task, reservation, Deferral::Lock(e.to_string())).await,
        }
    }

    /// Record the result of an action that ran.
    async fn settle(&self, task: &Task, outcome: ActionOutcome) {
        let resource_id = task.resource_id.as_str();
        let now = self.parts.clock.now();
        self.parts.health.record(resource_id, outcome.success);

        let result = if outcome.success {
            tracing::debug!(resource_id, task_id = %task.id, "task completed");
            let completed = self.parts.tasks.complete(task.id).await;
            let touched = self.parts.registry.touch(resource_id, now).await;
            completed.and(touched)
        } else {
            let attempts = task.attempts + 1;
            let detail = outcome
                .error_detail
                .unwrap_or_else(|| "action failed".to_string());
            if attempts < self.parts.config.max_attempts {
                let at = now + to_chrono(self.parts.config.retry_backoff());
                tracing::warn!(
                    resource_id,
                    task_id = %task.id,
                    attempts,
                    error = %detail,
                    %at,
                    "action failed, retrying later"
                );
                self.parts
                    .tasks
                    .reschedule(task.id, at, attempts, Some(detail))
                    .await
            } else {
                tracing::error!(
                    resource_id,
                    task_id = %task.id,
                    attempts,
                    error = %detail,
                    "action failed, giving up"
                );
                self.parts.tasks.fail(task.id, attempts, detail).await
            }
        };

        if let Err(e) = result {
            tracing::error!(resource_id, task_id = %task.id, error = %e, "failed to record task outcome");
        }
    }

    /// Give back the reservation of an action that never ran and retry later
    /// without spending an attempt.
    async fn defer(&self, task: &Task, reservation: Reservation, reason: Deferral) {
        let resource_id = task.resource_id.as_str();
        let delay = match reason {
            Deferral::Paced | Deferral::Closed => Duration::ZERO,
            _ => self.parts.config.lock_retry_delay(),
        };
        let at = self.parts.clock.now() + to_chrono(delay);
        tracing::warn!(
            resource_id,
            task_id = %task.id,
            reason = %reason,
            %at,
            "action did not run, rescheduling"
        );

        if let Err(e) = self
            .parts
            .ledger
            .refund(resource_id, &task.kind, reservation)
            .await
        {
            tracing::error!(resource_id, task_id = %task.id, error = %e, "quota refund failed");
        }
        if let Err(e) = self
            .parts
            .tasks
            .reschedule(task.id, at, task.attempts, Some(reason.to_string()))
            .await
        {
            tracing::error!(resource_id, task_id = %task.id, error = %e, "failed to reschedule task");
        }
    }

    /// Drop pacing state for a resource taken out of rotation.
    pub async fn forget(&self, resource_id: &str) {
        if let Some(pacer) = &self.parts.pacer {
            pacer.forget(resource_id).await;
        }
    }

    /// Whether `wait_idle` has stopped the dispatcher accepting work.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resources with an execution in flight, sorted.
    pub fn in_flight(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .in_flight_map()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Running(_)))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Stop accepting work, wait up to `timeout` for in-flight executions,
    /// then abort the rest.
    ///
    /// Pacing waits are cancelled first so paced tasks go straight back to
    /// the store. Returns the number of executions aborted.
    pub async fn wait_idle(&self, timeout: Duration) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        self.pacing_cancel.cancel();
        let handles: Vec<(String, JoinHandle<()>)> = self
            .in_flight_map()
            .drain()
            .filter_map(|(id, slot)| match slot {
                Slot::Running(handle) => Some((id, handle)),
                Slot::Dispatching => None,
            })
            .collect();
        if handles.is_empty() {
            return 0;
        }

        let aborts: Vec<_> = handles.iter().map(|(_, h)| h.abort_handle()).collect();
        let waiting = handles.len();
        let joined = tokio::time::timeout(timeout, join_all(handles.into_iter().map(|(_, h)| h))).await;
        if joined.is_ok() {
            tracing::debug!(waiting, "in-flight executions drained");
            return 0;
        }

        let mut aborted = 0;
        for abort in aborts {
            if !abort.is_finished() {
                abort.abort();
                aborted += 1;
            }
        }
        tracing::warn!(aborted, ?timeout, "aborted in-flight executions at shutdown");
        aborted
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

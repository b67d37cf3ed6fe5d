// ABOUTME: Composition root owning the lifecycle of every core component.
// ABOUTME: Runs the dispatch, health, sweep, and reconcile loops and tears them down in order.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::builder::OrchestratorBuilder;
use crate::backend::{AutomationBackend, SessionBackend};
use crate::campaign::{CampaignDeps, Workstreams};
use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::coordinator::{ActionPacer, Coordinator};
use crate::dispatch::{Dispatcher, DispatcherParts, TaskStore};
use crate::error::CoreError;
use crate::health::{HealthMonitor, HealthState};
use crate::quota::QuotaLedger;
use crate::registry::{ResourceRegistry, ResourceStatus};
use crate::session::{SessionPool, StopReport};

/// What one reconcile pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Resources whose workstreams were started.
    pub started: Vec<String>,
    /// Resources whose workstreams and sessions were stopped.
    pub stopped: Vec<String>,
}

/// Outcome of an orchestrator shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// In-flight executions aborted after the grace period.
    pub aborted: usize,
    pub sessions: StopReport,
}

struct Inner {
    config: Arc<CoreConfig>,
    tasks: Arc<dyn TaskStore>,
    registry: Arc<dyn ResourceRegistry>,
    ledger: Arc<QuotaLedger>,
    coordinator: Arc<Coordinator>,
    pool: Arc<SessionPool>,
    health: Arc<HealthMonitor>,
    dispatcher: Arc<Dispatcher>,
    workstreams: Workstreams,
}

/// Owns the coordinator, pool, dispatcher, health monitor, and campaign
/// workstreams, and drives them on fixed cadences.
///
/// # Example
///
/// ```ignore
/// let backend = Arc::new(ScriptedBackend::new());
/// let orchestrator = Orchestrator::builder()
///     .config(config)
///     .backend(backend)
///     .registry(registry)
///     .build()?;
/// orchestrator.start().await?;
/// // ...
/// orchestrator.shutdown().await;
/// ```
pub struct Orchestrator {
    inner: Arc<Inner>,
    shutdown: CancellationToken,
    loops: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub(super) fn assemble(
        builder: OrchestratorBuilder,
        sessions: Arc<dyn SessionBackend>,
        automation: Arc<dyn AutomationBackend>,
    ) -> Self {
        let config = Arc::new(builder.config);
        let clock: Arc<dyn Clock> = builder.clock;
        let shutdown = CancellationToken::new();

        let ledger = Arc::new(QuotaLedger::new(
            builder.quotas,
            config.clone(),
            clock.clone(),
        ));
        let coordinator = Arc::new(Coordinator::new(config.clone()));
        let pool = Arc::new(SessionPool::new(sessions, &config, clock.clone()));
        let health = Arc::new(HealthMonitor::new(
            config.health.clone(),
            ledger.clone(),
            builder.tasks.clone(),
            builder.registry.clone(),
            builder.remediation,
            builder.probe,
            clock.clone(),
        ));
        let pacer = config.pacing.map(|p| Arc::new(ActionPacer::new(p)));
        let dispatcher = Arc::new(Dispatcher::new(DispatcherParts {
            config: config.clone(),
            clock: clock.clone(),
            tasks: builder.tasks.clone(),
            registry: builder.registry.clone(),
            ledger: ledger.clone(),
            coordinator: coordinator.clone(),
            pool: pool.clone(),
            automation: automation.clone(),
            health: health.clone(),
            pacer,
        }));
        let deps = Arc::new(CampaignDeps {
            config: config.clone(),
            clock,
            coordinator: coordinator.clone(),
            pool: pool.clone(),
            ledger: ledger.clone(),
            tasks: builder.tasks.clone(),
            registry: builder.registry.clone(),
            automation,
            health: health.clone(),
        });
        let workstreams = Workstreams::new(deps, builder.campaigns, &shutdown);

        Self {
            inner: Arc::new(Inner {
                config,
                tasks: builder.tasks,
                registry: builder.registry,
                ledger,
                coordinator,
                pool,
                health,
                dispatcher,
                workstreams,
            }),
            shutdown,
            loops: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    fn loops(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.loops.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &CoreConfig {
        &self.inner.config
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.inner.coordinator
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.inner.pool
    }

    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.inner.ledger
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.inner.health
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    pub fn tasks(&self) -> &Arc<dyn TaskStore> {
        &self.inner.tasks
    }

    pub fn registry(&self) -> &Arc<dyn ResourceRegistry> {
        &self.inner.registry
    }

    pub fn workstreams(&self) -> &Workstreams {
        &self.inner.workstreams
    }

    /// Recover interrupted work, reconcile once, and start the background loops.
    ///
    /// Calling it again while running does nothing.
    pub async fn start(&self) -> Result<(), CoreError> {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::warn!("orchestrator already started");
            return Ok(());
        }

        let recovered = self.inner.tasks.reset_in_progress().await?;
        if recovered > 0 {
            tracing::info!(recovered, "returned interrupted tasks to pending");
        }
        self.inner.reconcile().await?;

        let config = &self.inner.config;
        let mut loops = self.loops();

        let inner = Arc::clone(&self.inner);
        loops.push(spawn_loop(
            "dispatch",
            config.dispatch_interval(),
            true,
            self.shutdown.child_token(),
            move || {
                let inner = Arc::clone(&inner);
                async move {
                    if let Err(e) = inner.dispatcher.dispatch_ready().await {
                        tracing::error!(error = %e, "dispatch cycle failed");
                    }
                }
            },
        ));

        let inner = Arc::clone(&self.inner);
        loops.push(spawn_loop(
            "health",
            config.health_check_interval(),
            false,
            self.shutdown.child_token(),
            move || {
                let inner = Arc::clone(&inner);
                async move { inner.check_health().await }
            },
        ));

        let inner = Arc::clone(&self.inner);
        loops.push(spawn_loop(
            "session-sweep",
            config.session_sweep_interval(),
            false,
            self.shutdown.child_token(),
            move || {
                let inner = Arc::clone(&inner);
                async move {
                    inner.pool.sweep_idle().await;
                }
            },
        ));

        let inner = Arc::clone(&self.inner);
        loops.push(spawn_loop(
            "reconcile",
            config.reconcile_interval(),
            false,
            self.shutdown.child_token(),
            move || {
                let inner = Arc::clone(&inner);
                async move {
                    if let Err(e) = inner.reconcile().await {
                        tracing::error!(error = %e, "reconcile failed");
                    }
                }
            },
        ));

        tracing::info!(
            dispatch_interval = ?config.dispatch_interval(),
            health_interval = ?config.health_check_interval(),
            "orchestrator started"
        );
        Ok(())
    }

    /// Align running workstreams with the registry's active resources.
    pub async fn reconcile(&self) -> Result<ReconcileReport, CoreError> {
        self.inner.reconcile().await
    }

    /// Classify every active resource now.
    pub async fn check_health(&self) {
        self.inner.check_health().await
    }

    /// Put a resource back into rotation after external repair.
    pub async fn reactivate(&self, resource_id: &str) -> Result<(), CoreError> {
        self.inner
            .registry
            .set_status(resource_id, ResourceStatus::Active)
            .await?;
        self.inner.health.reactivate(resource_id);
        tracing::info!(resource_id, "resource reactivated");
        Ok(())
    }

    /// Ordered teardown.
    ///
    /// Loops are cancelled, queued lock requests rejected, in-flight
    /// dispatches given the configured grace period, loops joined, and
    /// finally every session closed. Returns once all of that is done.
    pub async fn shutdown(&self) -> ShutdownReport {
        tracing::info!("orchestrator shutting down");
        self.shutdown.cancel();
        self.inner.coordinator.shutdown();

        let aborted = self
            .inner
            .dispatcher
            .wait_idle(self.inner.config.shutdown_grace())
            .await;

        let loops: Vec<_> = self.loops().drain(..).collect();
        for handle in loops {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    tracing::error!("background loop panicked");
                }
            }
        }
        self.inner.workstreams.stop_all().await;

        let sessions = self.inner.pool.stop_all().await;
        let report = ShutdownReport { aborted, sessions };
        tracing::info!(?report, "orchestrator stopped");
        report
    }
}

impl Inner {
    async fn reconcile(&self) -> Result<ReconcileReport, CoreError> {
        let active: HashSet<String> = self
            .registry
            .list_active()
            .await?
            .into_iter()
            .map(|r| r.id)
            .filter(|id| self.health.state(id) != HealthState::Suspended)
            .collect();

        let mut report = ReconcileReport::default();

        let mut wanted: Vec<_> = active.iter().cloned().collect();
        wanted.sort();
        for id in wanted {
            if self.workstreams.start(&id) > 0 {
                report.started.push(id);
            }
        }

        let mut unwanted: HashSet<String> = self.workstreams.resources().into_iter().collect();
        unwanted.extend(self.pool.live_resources());
        unwanted.retain(|id| !active.contains(id));
        let mut unwanted: Vec<_> = unwanted.into_iter().collect();
        unwanted.sort();
        for id in unwanted {
            self.retire(&id).await;
            report.stopped.push(id);
        }

        if !report.started.is_empty() || !report.stopped.is_empty() {
            tracing::info!(started = ?report.started, stopped = ?report.stopped, "reconciled workstreams");
        }
        Ok(report)
    }

    async fn check_health(&self) {
        let resources = match self.registry.list_active().await {
            Ok(resources) => resources,
            Err(e) => {
                tracing::error!(error = %e, "health check could not list resources");
                return;
            }
        };
        for resource in resources {
            match self.health.classify(&resource.id).await {
                Ok(HealthState::Suspended) => self.retire(&resource.id).await,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(resource_id = %resource.id, error = %e, "health check failed")
                }
            }
        }
    }

    /// Stop a resource's workstreams and close its session.
    async fn retire(&self, resource_id: &str) {
        self.workstreams.stop(resource_id).await;
        self.dispatcher.forget(resource_id).await;
        if let Err(e) = self.pool.stop(resource_id).await {
            tracing::warn!(resource_id, error = %e, "failed to close session of retired resource");
        }
    }
}

/// Run `tick` every `period` until `cancel` fires.
///
/// A tick in progress always runs to completion.
fn spawn_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    eager: bool,
    cancel: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        if !eager {
            ticker.tick().await;
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => tick().await,
            }
        }
        tracing::debug!(loop_name = name, "loop stopped");
    })
}

// ABOUTME: Tests for the task dispatcher.
// ABOUTME: Covers ordering, quota handling, retries, deferrals, and in-flight tracking.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Semaphore;
use uuid::Uuid;

use super::*;
use crate::backend::ScriptedBackend;
use crate::clock::{self, Clock, ManualClock};
use crate::config::{CoreConfig, HealthThresholds};
use crate::coordinator::Coordinator;
use crate::error::StoreError;
use crate::health::{HealthMonitor, HealthState, NeverStale, NoopRemediation};
use crate::quota::{MemoryQuotaStore, QuotaKey, QuotaLedger};
use crate::registry::{MemoryResourceRegistry, ResourceRegistry, ResourceStatus};
use crate::session::SessionPool;

struct Fixture {
    dispatcher: Arc<Dispatcher>,
    tasks: Arc<MemoryTaskStore>,
    quotas: Arc<MemoryQuotaStore>,
    ledger: Arc<QuotaLedger>,
    registry: Arc<MemoryResourceRegistry>,
    coordinator: Arc<Coordinator>,
    backend: Arc<ScriptedBackend>,
    health: Arc<HealthMonitor>,
    clock: Arc<ManualClock>,
}

fn base_config() -> crate::config::CoreConfigBuilder {
    CoreConfig::builder()
        .daily_limit("follow", 10)
        .max_attempts(3)
        .retry_backoff(Duration::from_secs(30 * 60))
        .lock_retry_delay(Duration::from_secs(60))
        .action_timeout(Duration::from_secs(5))
}

/// Task store that yields inside reads and claims, and holds claims until
/// permits are released.
struct SlowTaskStore {
    inner: Arc<MemoryTaskStore>,
    claim_permits: Semaphore,
    claims_started: AtomicUsize,
}

impl SlowTaskStore {
    fn new(inner: Arc<MemoryTaskStore>, permits: usize) -> Arc<Self> {
        Arc::new(Self {
            inner,
            claim_permits: Semaphore::new(permits),
            claims_started: AtomicUsize::new(0),
        })
    }

    fn claims_started(&self) -> usize {
        self.claims_started.load(Ordering::SeqCst)
    }

    fn release_claims(&self) {
        self.claim_permits.add_permits(Semaphore::MAX_PERMITS / 2);
    }
}

#[async_trait]
impl TaskStore for SlowTaskStore {
    async fn insert(&self, task: Task) -> Result<(), StoreError> {
        self.inner.insert(task).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        self.inner.get(id).await
    }

    async fn find_next_eligible(
        &self,
        resource_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        tokio::task::yield_now().await;
        self.inner.find_next_eligible(resource_id, now).await
    }

    async fn claim(&self, id: Uuid) -> Result<bool, StoreError> {
        self.claims_started.fetch_add(1, Ordering::SeqCst);
        let _permit = self
            .claim_permits
            .acquire()
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        tokio::task::yield_now().await;
        self.inner.claim(id).await
    }

    async fn complete(&self, id: Uuid) -> Result<(), StoreError> {
        self.inner.complete(id).await
    }

    async fn reschedule(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        attempts: u32,
        last_error: Option<String>,
    ) -> Result<(), StoreError> {
        self.inner.reschedule(id, at, attempts, last_error).await
    }

    async fn fail(&self, id: Uuid, attempts: u32, reason: String) -> Result<(), StoreError> {
        self.inner.fail(id, attempts, reason).await
    }

    async fn cancel(&self, id: Uuid) -> Result<bool, StoreError> {
        self.inner.cancel(id).await
    }

    async fn defer_pending(
        &self,
        resource_id: &str,
        before: DateTime<Utc>,
        by: chrono::Duration,
    ) -> Result<usize, StoreError> {
        self.inner.defer_pending(resource_id, before, by).await
    }

    async fn reset_in_progress(&self) -> Result<usize, StoreError> {
        self.inner.reset_in_progress().await
    }

    async fn list_for_resource(&self, resource_id: &str) -> Result<Vec<Task>, StoreError> {
        self.inner.list_for_resource(resource_id).await
    }
}

fn fixture_with(config: CoreConfig, resources: &[&str]) -> Fixture {
    fixture_wrapping(config, resources, |tasks| tasks as Arc<dyn TaskStore>)
}

/// Build a fixture whose dispatcher sees the task store through `wrap`.
fn fixture_wrapping<W>(config: CoreConfig, resources: &[&str], wrap: W) -> Fixture
where
    W: FnOnce(Arc<MemoryTaskStore>) -> Arc<dyn TaskStore>,
{
    let config = Arc::new(config);
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap(),
    ));
    let tasks = MemoryTaskStore::shared();
    let quotas = MemoryQuotaStore::shared();
    let ledger = Arc::new(QuotaLedger::new(quotas.clone(), config.clone(), clock.clone()));
    let registry = MemoryResourceRegistry::with_active(resources.iter().copied());
    let coordinator = Arc::new(Coordinator::new(config.clone()));
    let backend = Arc::new(ScriptedBackend::new());
    let pool = Arc::new(SessionPool::new(backend.clone(), &config, clock.clone()));
    let health = Arc::new(HealthMonitor::new(
        HealthThresholds::default(),
        ledger.clone(),
        tasks.clone(),
        registry.clone(),
        Arc::new(NoopRemediation),
        Arc::new(NeverStale),
        clock.clone(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(DispatcherParts {
        config,
        clock: clock.clone(),
        tasks: wrap(tasks.clone()),
        registry: registry.clone(),
        ledger: ledger.clone(),
        coordinator: coordinator.clone(),
        pool,
        automation: backend.clone(),
        health: health.clone(),
        pacer: None,
    }));
    Fixture {
        dispatcher,
        tasks,
        quotas,
        ledger,
        registry,
        coordinator,
        backend,
        health,
        clock,
    }
}

fn fixture() -> Fixture {
    fixture_with(base_config().build().unwrap(), &["acct-1"])
}

impl Fixture {
    async fn add_task(&self, resource_id: &str, kind: &str, priority: u32) -> Task {
        let task = Task::new(resource_id, kind, serde_json::Value::Null, self.clock.now())
            .with_priority(priority);
        self.tasks.insert(task.clone()).await.unwrap();
        task
    }

    async fn task(&self, task: &Task) -> Task {
        self.tasks.get(task.id).await.unwrap().unwrap()
    }

    /// Wait until nothing is in flight.
    async fn settle(&self) {
        for _ in 0..200 {
            if self.dispatcher.in_flight().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("executions still in flight: {:?}", self.dispatcher.in_flight());
    }
}

#[tokio::test]
async fn test_successful_task_completes() {
    let f = fixture();
    let task = f.add_task("acct-1", "follow", 5).await;

    assert_eq!(f.dispatcher.dispatch_ready().await.unwrap(), 1);
    f.settle().await;

    let task = f.task(&task).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(f.ledger.used_today("acct-1", "follow").await.unwrap(), 1);
    assert_eq!(f.health.report("acct-1").samples, 1);

    let resource = f.registry.get("acct-1").await.unwrap().unwrap();
    assert_eq!(resource.last_activity_at, Some(f.clock.now()));
    assert_eq!(f.coordinator.holder("acct-1"), None);
}

#[tokio::test]
async fn test_most_urgent_task_goes_first() {
    let f = fixture();
    let _normal = f.add_task("acct-1", "follow", 5).await;
    let urgent = f.add_task("acct-1", "follow", 1).await;

    f.dispatcher.dispatch_ready().await.unwrap();
    f.settle().await;

    let performed = f.backend.performed();
    assert_eq!(performed.len(), 1);
    assert_eq!(performed[0].1.task_id, Some(urgent.id));
}

#[tokio::test]
async fn test_one_task_in_flight_per_resource() {
    let f = fixture();
    f.backend.set_action_delay(Duration::from_millis(100));
    f.add_task("acct-1", "follow", 5).await;
    f.add_task("acct-1", "follow", 5).await;

    assert_eq!(f.dispatcher.dispatch_ready().await.unwrap(), 1);
    assert_eq!(f.dispatcher.in_flight(), vec!["acct-1".to_string()]);
    assert_eq!(f.dispatcher.dispatch_ready().await.unwrap(), 0);

    f.settle().await;
    assert_eq!(f.dispatcher.dispatch_ready().await.unwrap(), 1);
    f.settle().await;
    assert_eq!(f.backend.performed().len(), 2);
}

#[tokio::test]
async fn test_overlapping_cycles_claim_one_task_per_resource() {
    let f = fixture_wrapping(base_config().build().unwrap(), &["acct-1"], |tasks| {
        SlowTaskStore::new(tasks, Semaphore::MAX_PERMITS / 2) as Arc<dyn TaskStore>
    });
    f.backend.set_action_delay(Duration::from_millis(100));
    f.add_task("acct-1", "follow", 5).await;
    f.add_task("acct-1", "follow", 5).await;

    let (a, b) = tokio::join!(f.dispatcher.dispatch_ready(), f.dispatcher.dispatch_ready());
    assert_eq!(a.unwrap() + b.unwrap(), 1);

    let in_progress = f
        .tasks
        .list_for_resource("acct-1")
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.status == TaskStatus::InProgress)
        .count();
    assert_eq!(in_progress, 1);
    assert_eq!(f.dispatcher.in_flight(), vec!["acct-1".to_string()]);

    f.settle().await;
    assert_eq!(f.backend.performed().len(), 1);
    assert_eq!(f.ledger.used_today("acct-1", "follow").await.unwrap(), 1);
}

#[tokio::test]
async fn test_resources_dispatch_independently() {
    let f = fixture_with(base_config().build().unwrap(), &["acct-1", "acct-2"]);
    f.add_task("acct-1", "follow", 5).await;
    f.add_task("acct-2", "follow", 5).await;

    assert_eq!(f.dispatcher.dispatch_ready().await.unwrap(), 2);
    f.settle().await;
    assert_eq!(f.backend.performed().len(), 2);
}

#[tokio::test]
async fn test_exhausted_quota_moves_task_to_next_day() {
    let f = fixture();
    f.quotas
        .set_count(QuotaKey::new("acct-1", "follow"), f.clock.today(), 9);
    let first = f.add_task("acct-1", "follow", 5).await;
    let second = f.add_task("acct-1", "follow", 5).await;

    assert_eq!(f.dispatcher.dispatch_ready().await.unwrap(), 1);
    f.settle().await;
    assert_eq!(f.dispatcher.dispatch_ready().await.unwrap(), 0);

    let ran = f.backend.performed()[0].1.task_id;
    let (done, waiting) = if ran == Some(first.id) {
        (first, second)
    } else {
        (second, first)
    };
    assert_eq!(f.task(&done).await.status, TaskStatus::Completed);
    let waiting = f.task(&waiting).await;
    assert_eq!(waiting.status, TaskStatus::Pending);
    assert_eq!(waiting.attempts, 0);
    assert_eq!(waiting.scheduled_at, clock::start_of_next_day(f.clock.now()));
    assert_eq!(f.ledger.used_today("acct-1", "follow").await.unwrap(), 10);
}

#[tokio::test]
async fn test_exhausted_quota_leaves_resource_until_next_cycle() {
    let f = fixture();
    f.quotas
        .set_count(QuotaKey::new("acct-1", "follow"), f.clock.today(), 10);
    let follow = f.add_task("acct-1", "follow", 1).await;
    let like = f.add_task("acct-1", "like", 5).await;

    assert_eq!(f.dispatcher.dispatch_ready().await.unwrap(), 0);
    let follow = f.task(&follow).await;
    assert_eq!(follow.status, TaskStatus::Pending);
    assert_eq!(follow.scheduled_at, clock::start_of_next_day(f.clock.now()));
    assert_eq!(f.task(&like).await.status, TaskStatus::Pending);
    assert!(f.backend.performed().is_empty());

    // The follow is no longer due, so the like goes next cycle.
    assert_eq!(f.dispatcher.dispatch_ready().await.unwrap(), 1);
    f.settle().await;
    assert_eq!(f.task(&like).await.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_failed_action_is_retried_after_backoff() {
    let f = fixture();
    f.backend.script_outcomes("acct-1", [false]);
    let task = f.add_task("acct-1", "follow", 5).await;

    f.dispatcher.dispatch_ready().await.unwrap();
    f.settle().await;

    let task = f.task(&task).await;
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempts, 1);
    assert_eq!(task.scheduled_at, f.clock.now() + chrono::Duration::minutes(30));
    assert!(task.last_error.is_some());
    // The action ran, so its quota stays spent.
    assert_eq!(f.ledger.used_today("acct-1", "follow").await.unwrap(), 1);
}

#[tokio::test]
async fn test_last_attempt_fails_task() {
    let f = fixture();
    f.backend.script_outcomes("acct-1", [false]);
    let mut task = Task::new("acct-1", "follow", serde_json::Value::Null, f.clock.now());
    task.attempts = 2;
    f.tasks.insert(task.clone()).await.unwrap();

    f.dispatcher.dispatch_ready().await.unwrap();
    f.settle().await;

    let task = f.task(&task).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 3);
}

#[tokio::test]
async fn test_session_failure_refunds_and_keeps_attempts() {
    let f = fixture();
    f.backend.fail_open_for("acct-1");
    let task = f.add_task("acct-1", "follow", 5).await;

    f.dispatcher.dispatch_ready().await.unwrap();
    f.settle().await;

    let task = f.task(&task).await;
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempts, 0);
    assert_eq!(task.scheduled_at, f.clock.now() + chrono::Duration::seconds(60));
    assert_eq!(f.ledger.used_today("acct-1", "follow").await.unwrap(), 0);
    assert!(f.backend.performed().is_empty());
}

#[tokio::test]
async fn test_lock_timeout_refunds_and_reschedules() {
    let config = base_config()
        .requester("dispatcher", 5, Duration::from_millis(50))
        .build()
        .unwrap();
    let f = fixture_with(config, &["acct-1"]);
    f.coordinator
        .acquire("acct-1", "monitor", 1, None)
        .await
        .unwrap();
    let task = f.add_task("acct-1", "follow", 5).await;

    f.dispatcher.dispatch_ready().await.unwrap();
    f.settle().await;

    let task = f.task(&task).await;
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempts, 0);
    assert!(task.last_error.unwrap().contains("timed out"));
    assert_eq!(f.ledger.used_today("acct-1", "follow").await.unwrap(), 0);
    assert_eq!(f.coordinator.holder("acct-1").as_deref(), Some("monitor"));
}

#[tokio::test]
async fn test_slow_action_counts_as_failure() {
    let config = base_config()
        .action_timeout(Duration::from_millis(50))
        .build()
        .unwrap();
    let f = fixture_with(config, &["acct-1"]);
    f.backend.set_action_delay(Duration::from_millis(500));
    let task = f.add_task("acct-1", "follow", 5).await;

    f.dispatcher.dispatch_ready().await.unwrap();
    f.settle().await;

    let task = f.task(&task).await;
    assert_eq!(task.attempts, 1);
    assert!(task.last_error.unwrap().contains("timed out"));
    assert_eq!(f.coordinator.holder("acct-1"), None);
}

#[tokio::test]
async fn test_future_tasks_wait() {
    let f = fixture();
    let task = Task::new(
        "acct-1",
        "follow",
        serde_json::Value::Null,
        f.clock.now() + chrono::Duration::minutes(10),
    );
    f.tasks.insert(task.clone()).await.unwrap();

    assert_eq!(f.dispatcher.dispatch_ready().await.unwrap(), 0);

    f.clock.advance(chrono::Duration::minutes(10));
    assert_eq!(f.dispatcher.dispatch_ready().await.unwrap(), 1);
    f.settle().await;
}

#[tokio::test]
async fn test_inactive_and_suspended_resources_are_skipped() {
    let f = fixture_with(base_config().build().unwrap(), &["acct-1", "acct-2"]);
    f.registry
        .set_status("acct-1", ResourceStatus::Paused)
        .await
        .unwrap();
    for _ in 0..50 {
        f.health.record("acct-2", false);
    }
    assert_eq!(
        f.health.classify("acct-2").await.unwrap(),
        HealthState::Suspended
    );
    // Registry says active again, but the health record still says suspended.
    f.registry
        .set_status("acct-2", ResourceStatus::Active)
        .await
        .unwrap();
    f.add_task("acct-1", "follow", 5).await;
    f.add_task("acct-2", "follow", 5).await;

    assert_eq!(f.dispatcher.dispatch_ready().await.unwrap(), 0);
    assert!(f.backend.performed().is_empty());
}

#[tokio::test]
async fn test_wait_idle_aborts_stragglers() {
    let f = fixture();
    f.backend.set_action_delay(Duration::from_secs(10));
    f.add_task("acct-1", "follow", 5).await;

    f.dispatcher.dispatch_ready().await.unwrap();
    let aborted = f.dispatcher.wait_idle(Duration::from_millis(50)).await;

    assert_eq!(aborted, 1);
    assert!(f.dispatcher.in_flight().is_empty());
}

#[tokio::test]
async fn test_wait_idle_closes_dispatcher() {
    let f = fixture();
    assert_eq!(f.dispatcher.wait_idle(Duration::from_millis(10)).await, 0);
    assert!(f.dispatcher.is_closed());

    let task = f.add_task("acct-1", "follow", 5).await;
    assert_eq!(f.dispatcher.dispatch_ready().await.unwrap(), 0);
    assert_eq!(f.task(&task).await.status, TaskStatus::Pending);
}

#[tokio::test]
async fn test_close_during_claim_returns_task_unrun() {
    let mut slow = None;
    let f = fixture_wrapping(base_config().build().unwrap(), &["acct-1"], |tasks| {
        let store = SlowTaskStore::new(tasks, 0);
        slow = Some(store.clone());
        store as Arc<dyn TaskStore>
    });
    let slow = slow.unwrap();
    let task = f.add_task("acct-1", "follow", 5).await;

    let dispatcher = f.dispatcher.clone();
    let cycle = tokio::spawn(async move { dispatcher.dispatch_ready().await });
    for _ in 0..200 {
        if slow.claims_started() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(slow.claims_started(), 1);

    assert_eq!(f.dispatcher.wait_idle(Duration::from_millis(50)).await, 0);
    slow.release_claims();
    assert_eq!(cycle.await.unwrap().unwrap(), 0);

    let task = f.task(&task).await;
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempts, 0);
    assert_eq!(f.ledger.used_today("acct-1", "follow").await.unwrap(), 0);
    assert!(f.dispatcher.in_flight().is_empty());
    assert!(f.backend.performed().is_empty());
}

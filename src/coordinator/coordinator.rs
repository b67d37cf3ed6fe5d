// ABOUTME: Per-resource priority mutex serializing campaign actions on one account.
// ABOUTME: Waiters queue by (priority, arrival); release hands the lock over synchronously.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::config::CoreConfig;
use crate::error::LockError;

/// Proof that a requester holds a resource.
#[derive(Debug, Clone)]
pub struct LockGrant {
    pub resource_id: String,
    pub requester: String,
    pub priority: u32,
    /// Time spent queued before the grant.
    pub waited: Duration,
}

struct Holder {
    requester: String,
    acquired_at: Instant,
}

impl Holder {
    fn new(requester: &str) -> Self {
        Self {
            requester: requester.to_string(),
            acquired_at: Instant::now(),
        }
    }
}

struct Waiter {
    id: u64,
    requester: String,
    priority: u32,
    enqueued_at: Instant,
    tx: oneshot::Sender<Result<(), LockError>>,
}

/// Lock state for a single resource.
#[derive(Default)]
struct ResourceQueue {
    holder: Option<Holder>,
    /// Sorted by priority, then arrival.
    waiters: Vec<Waiter>,
}

impl ResourceQueue {
    fn enqueue(&mut self, waiter: Waiter) {
        // Behind everyone at the same or a more urgent priority.
        let pos = self
            .waiters
            .iter()
            .position(|w| w.priority > waiter.priority)
            .unwrap_or(self.waiters.len());
        self.waiters.insert(pos, waiter);
    }

    fn remove_waiter(&mut self, id: u64) -> bool {
        match self.waiters.iter().position(|w| w.id == id) {
            Some(pos) => {
                self.waiters.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Grant the lock to the most urgent live waiter.
    fn hand_off(&mut self) -> Option<(String, Duration)> {
        while !self.waiters.is_empty() {
            let waiter = self.waiters.remove(0);
            if waiter.tx.send(Ok(())).is_ok() {
                self.holder = Some(Holder::new(&waiter.requester));
                return Some((waiter.requester, waiter.enqueued_at.elapsed()));
            }
            // Receiver gone: the requester stopped waiting.
        }
        None
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Per-resource priority coordinator.
///
/// Each resource has an independent queue and at most one active holder.
/// A request on an idle resource is granted at once; otherwise it waits in
/// the resource's queue until a `release()` hands the lock over, its timeout
/// elapses, or the coordinator shuts down.
///
/// # Lock Semantics
///
/// - **Ordering:** waiters are granted by ascending priority number, FIFO
///   within a priority.
/// - **Backpressure:** a request that finds the queue at `max_queue_depth`
///   fails with `LockError::QueueFull` without waiting.
/// - **Timeouts:** timing out and being granted are decided under the
///   resource's lock, so exactly one of them happens.
/// - **Benign release:** releasing a lock the caller does not hold logs a
///   warning and does nothing.
pub struct Coordinator {
    queues: Mutex<HashMap<String, Arc<Mutex<ResourceQueue>>>>,
    config: Arc<CoreConfig>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new(Arc::new(CoreConfig::default()))
    }
}

impl Coordinator {
    /// Create a coordinator using the queue bound and requester profiles in `config`.
    pub fn new(config: Arc<CoreConfig>) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            config,
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Acquire exclusive access to a resource.
    ///
    /// `timeout` of `None` uses the requester class default from configuration.
    ///
    /// # Arguments
    ///
    /// * `resource_id` - The resource to lock.
    /// * `requester` - Name of the requesting campaign; also its requester class.
    /// * `priority` - Lower numbers are granted first.
    /// * `timeout` - Maximum time to wait in the queue.
    pub async fn acquire(
        &self,
        resource_id: &str,
        requester: &str,
        priority: u32,
        timeout: Option<Duration>,
    ) -> Result<LockGrant, LockError> {
        let timeout = timeout.unwrap_or_else(|| self.config.lock_timeout(requester));
        let grant = |waited| LockGrant {
            resource_id: resource_id.to_string(),
            requester: requester.to_string(),
            priority,
            waited,
        };

        let queue = self.queue_for(resource_id)?;
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut q = lock(&queue);
            if self.closed.load(Ordering::SeqCst) {
                return Err(LockError::Shutdown);
            }

            if q.holder.is_none() && q.waiters.is_empty() {
                q.holder = Some(Holder::new(requester));
                tracing::debug!(resource_id, requester, priority, "lock granted immediately");
                return Ok(grant(Duration::ZERO));
            }

            if q.waiters.len() >= self.config.max_queue_depth {
                tracing::warn!(
                    resource_id,
                    requester,
                    depth = q.waiters.len(),
                    "lock queue full, rejecting request"
                );
                return Err(LockError::QueueFull {
                    resource_id: resource_id.to_string(),
                    depth: q.waiters.len(),
                });
            }

            q.enqueue(Waiter {
                id,
                requester: requester.to_string(),
                priority,
                enqueued_at: Instant::now(),
                tx,
            });
            tracing::debug!(
                resource_id,
                requester,
                priority,
                depth = q.waiters.len(),
                "lock request queued"
            );
        }

        let mut pending = PendingRequest {
            coordinator: self,
            queue,
            resource_id,
            requester,
            id,
            rx: Some(rx),
        };
        let started = Instant::now();

        let outcome = match pending.rx.as_mut() {
            Some(rx) => tokio::time::timeout(timeout, rx).await,
            None => return Err(LockError::Shutdown),
        };
        match outcome {
            Ok(Ok(result)) => {
                pending.settle();
                result.map(|()| grant(started.elapsed()))
            }
            Ok(Err(_)) => {
                pending.settle();
                Err(LockError::Shutdown)
            }
            Err(_) => pending.expire(timeout).map(|()| grant(started.elapsed())),
        }
    }

    /// Release a resource held by `requester` and grant it to the next waiter.
    ///
    /// Releasing a lock that `requester` does not hold is a no-op.
    pub fn release(&self, resource_id: &str, requester: &str) {
        let queue = lock(&self.queues).get(resource_id).cloned();
        match queue {
            Some(queue) => self.release_in(&queue, resource_id, requester),
            None if self.is_shut_down() => {
                tracing::debug!(resource_id, requester, "release after shutdown")
            }
            None => tracing::warn!(
                resource_id,
                requester,
                "release of a lock that is not held, ignoring"
            ),
        }
    }

    /// Acquire, run `f`, and release, even if `f` errors or the future is dropped.
    pub async fn run_exclusive<F, Fut, T>(
        &self,
        resource_id: &str,
        requester: &str,
        priority: u32,
        f: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.acquire(resource_id, requester, priority, None).await?;
        let _guard = ReleaseOnDrop {
            coordinator: self,
            resource_id,
            requester,
        };
        Ok(f().await)
    }

    /// Reject every queued request on every resource and clear all state.
    ///
    /// Later acquires fail with `LockError::Shutdown`.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let queues: Vec<_> = lock(&self.queues).drain().collect();

        let mut rejected = 0;
        for (_, queue) in queues {
            let mut q = lock(&queue);
            for waiter in q.waiters.drain(..) {
                let _ = waiter.tx.send(Err(LockError::Shutdown));
                rejected += 1;
            }
            q.holder = None;
        }
        tracing::info!(rejected, "coordinator shut down");
    }

    /// Whether `shutdown()` has been called.
    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Current holder of a resource, if any.
    pub fn holder(&self, resource_id: &str) -> Option<String> {
        let queue = lock(&self.queues).get(resource_id).cloned()?;
        let q = lock(&queue);
        q.holder.as_ref().map(|h| h.requester.clone())
    }

    /// Number of requests waiting on a resource.
    pub fn queue_depth(&self, resource_id: &str) -> usize {
        match lock(&self.queues).get(resource_id).cloned() {
            Some(queue) => lock(&queue).waiters.len(),
            None => 0,
        }
    }

    fn queue_for(&self, resource_id: &str) -> Result<Arc<Mutex<ResourceQueue>>, LockError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LockError::Shutdown);
        }
        let mut queues = lock(&self.queues);
        Ok(queues.entry(resource_id.to_string()).or_default().clone())
    }

    fn release_in(&self, queue: &Mutex<ResourceQueue>, resource_id: &str, requester: &str) {
        let mut q = lock(queue);
        let held_for = match &q.holder {
            Some(holder) if holder.requester == requester => holder.acquired_at.elapsed(),
            Some(holder) => {
                tracing::warn!(
                    resource_id,
                    requester,
                    holder = %holder.requester,
                    "release by a requester that does not hold the lock, ignoring"
                );
                return;
            }
            None => {
                tracing::warn!(
                    resource_id,
                    requester,
                    "release of a lock that is not held, ignoring"
                );
                return;
            }
        };
        q.holder = None;
        tracing::debug!(resource_id, requester, ?held_for, "lock released");

        if let Some((next, waited)) = q.hand_off() {
            tracing::debug!(resource_id, requester = %next, ?waited, "lock handed to next waiter");
        }
    }
}

/// A queued request whose outcome is not yet known.
///
/// Dropping it before it settles withdraws the request, or gives the lock
/// back if the grant raced the drop.
struct PendingRequest<'a> {
    coordinator: &'a Coordinator,
    queue: Arc<Mutex<ResourceQueue>>,
    resource_id: &'a str,
    requester: &'a str,
    id: u64,
    rx: Option<oneshot::Receiver<Result<(), LockError>>>,
}

impl PendingRequest<'_> {
    fn settle(&mut self) {
        self.rx = None;
    }

    /// Resolve a deadline: either withdraw from the queue or accept a grant
    /// that was sent before the queue lock was taken.
    fn expire(&mut self, timeout: Duration) -> Result<(), LockError> {
        let mut rx = self.rx.take();
        {
            let mut q = lock(&self.queue);
            if q.remove_waiter(self.id) {
                tracing::debug!(
                    resource_id = self.resource_id,
                    requester = self.requester,
                    ?timeout,
                    "lock request timed out"
                );
                return Err(LockError::Timeout {
                    resource_id: self.resource_id.to_string(),
                    requester: self.requester.to_string(),
                    waited: timeout,
                });
            }
        }
        match rx.as_mut().map(|rx| rx.try_recv()) {
            Some(Ok(result)) => result,
            _ => Err(LockError::Shutdown),
        }
    }
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        if lock(&self.queue).remove_waiter(self.id) {
            return;
        }
        if let Ok(Ok(())) = rx.try_recv() {
            self.coordinator
                .release_in(&self.queue, self.resource_id, self.requester);
        }
    }
}

struct ReleaseOnDrop<'a> {
    coordinator: &'a Coordinator,
    resource_id: &'a str,
    requester: &'a str,
}

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        self.coordinator.release(self.resource_id, self.requester);
    }
}

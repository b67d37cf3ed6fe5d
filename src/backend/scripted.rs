// ABOUTME: In-process backend with scripted outcomes for tests and simulations.
// ABOUTME: Records every open, close, and action so callers can assert on them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{ActionOutcome, ActionSpec, AutomationBackend, Session, SessionBackend, SessionHandle};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Backend whose behaviour is set up ahead of time.
///
/// Actions succeed unless an outcome was scripted for the resource or a
/// failure cadence was configured. Opens and closes can be made to fail per
/// resource.
#[derive(Default)]
pub struct ScriptedBackend {
    opened: AtomicUsize,
    closed: AtomicUsize,
    live: Mutex<HashSet<SessionHandle>>,
    max_live: AtomicUsize,
    fail_open: Mutex<HashSet<String>>,
    fail_close: Mutex<HashSet<String>>,
    outcomes: Mutex<HashMap<String, VecDeque<bool>>>,
    fail_every: AtomicUsize,
    action_delay: Mutex<Duration>,
    open_delay: Mutex<Duration>,
    performed: Mutex<Vec<(String, ActionSpec)>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `open` for this resource fail.
    pub fn fail_open_for(&self, resource_id: &str) {
        lock(&self.fail_open).insert(resource_id.to_string());
    }

    /// Make every `close` for this resource fail.
    pub fn fail_close_for(&self, resource_id: &str) {
        lock(&self.fail_close).insert(resource_id.to_string());
    }

    /// Queue outcomes for the next actions on a resource, `true` meaning success.
    pub fn script_outcomes(&self, resource_id: &str, outcomes: impl IntoIterator<Item = bool>) {
        lock(&self.outcomes)
            .entry(resource_id.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// Fail every `n`-th unscripted action. Zero disables.
    pub fn fail_every(&self, n: usize) {
        self.fail_every.store(n, Ordering::SeqCst);
    }

    /// Make each action take this long.
    pub fn set_action_delay(&self, delay: Duration) {
        *lock(&self.action_delay) = delay;
    }

    /// Make each `open` take this long.
    pub fn set_open_delay(&self, delay: Duration) {
        *lock(&self.open_delay) = delay;
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sessions opened and not yet closed.
    pub fn live(&self) -> usize {
        lock(&self.live).len()
    }

    /// Highest number of simultaneously live sessions seen.
    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    /// Every action performed so far, as `(resource_id, action)`.
    pub fn performed(&self) -> Vec<(String, ActionSpec)> {
        lock(&self.performed).clone()
    }
}

#[async_trait]
impl SessionBackend for ScriptedBackend {
    async fn open(&self, resource_id: &str) -> Result<SessionHandle, anyhow::Error> {
        let delay = *lock(&self.open_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if lock(&self.fail_open).contains(resource_id) {
            anyhow::bail!("scripted open failure for {}", resource_id);
        }
        let n = self.opened.fetch_add(1, Ordering::SeqCst);
        let handle = SessionHandle(format!("{}#{}", resource_id, n));
        let mut live = lock(&self.live);
        live.insert(handle.clone());
        self.max_live.fetch_max(live.len(), Ordering::SeqCst);
        Ok(handle)
    }

    async fn close(&self, session: &Session) -> Result<(), anyhow::Error> {
        lock(&self.live).remove(&session.handle);
        self.closed.fetch_add(1, Ordering::SeqCst);
        if lock(&self.fail_close).contains(&session.resource_id) {
            anyhow::bail!("scripted close failure for {}", session.resource_id);
        }
        Ok(())
    }
}

#[async_trait]
impl AutomationBackend for ScriptedBackend {
    async fn perform_action(
        &self,
        resource_id: &str,
        _session: &Session,
        action: &ActionSpec,
    ) -> ActionOutcome {
        let delay = *lock(&self.action_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let count = {
            let mut performed = lock(&self.performed);
            performed.push((resource_id.to_string(), action.clone()));
            performed.len()
        };

        let scripted = lock(&self.outcomes)
            .get_mut(resource_id)
            .and_then(|queue| queue.pop_front());
        let success = match scripted {
            Some(success) => success,
            None => {
                let every = self.fail_every.load(Ordering::SeqCst);
                every == 0 || count % every != 0
            }
        };

        if success {
            ActionOutcome::success()
        } else {
            ActionOutcome::failure(format!("{} failed on {}", action.kind, resource_id))
        }
    }
}

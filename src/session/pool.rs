// ABOUTME: Bounded pool of per-resource sessions with LRU eviction and idle reclamation.
// ABOUTME: Opening and closing is delegated to the SessionBackend; the pool enforces the cap.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::backend::{Session, SessionBackend};
use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::error::SessionError;

struct Entry {
    session: Session,
    last_used: DateTime<Utc>,
    in_use: bool,
}

#[derive(Default)]
struct PoolState {
    live: HashMap<String, Entry>,
    /// Resources whose session is being opened; they count against the cap.
    opening: HashSet<String>,
}

impl PoolState {
    fn occupied(&self) -> usize {
        self.live.len() + self.opening.len()
    }

    /// Least recently used live session, preferring ones nobody is using.
    fn eviction_candidate(&self) -> Option<String> {
        self.live
            .iter()
            .min_by_key(|(_, entry)| (entry.in_use, entry.last_used))
            .map(|(id, _)| id.clone())
    }
}

/// Summary of a `stop_all` teardown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopReport {
    pub closed: usize,
    pub failed: usize,
}

enum Next {
    Ready(Session),
    Wait,
    Open(Option<Entry>),
}

/// Holds a resource's `opening` mark. If the obtaining future is dropped
/// before the open finishes, the mark is released and waiters are woken.
struct OpeningSlot<'a> {
    pool: &'a SessionPool,
    resource_id: &'a str,
    armed: bool,
}

impl Drop for OpeningSlot<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.pool.state().opening.remove(self.resource_id);
        self.pool.changed.notify_waiters();
        tracing::debug!(resource_id = self.resource_id, "abandoned session open released");
    }
}

/// Pool of live sessions, at most one per resource and at most
/// `max_concurrent_sessions` overall.
///
/// Sessions being opened count against the cap, so concurrent `obtain`
/// calls can never push the pool over it. A caller asking for a resource
/// whose session is mid-open waits for that open instead of starting a
/// second one.
pub struct SessionPool {
    backend: Arc<dyn SessionBackend>,
    clock: Arc<dyn Clock>,
    state: Mutex<PoolState>,
    changed: Notify,
    max_concurrent: usize,
    idle_timeout: chrono::Duration,
    stopped: AtomicBool,
}

impl SessionPool {
    pub fn new(backend: Arc<dyn SessionBackend>, config: &CoreConfig, clock: Arc<dyn Clock>) -> Self {
        let idle_timeout = chrono::Duration::from_std(config.session_idle_timeout())
            .unwrap_or_else(|_| chrono::Duration::days(365));
        Self {
            backend,
            clock,
            state: Mutex::new(PoolState::default()),
            changed: Notify::new(),
            max_concurrent: config.max_concurrent_sessions.max(1),
            idle_timeout,
            stopped: AtomicBool::new(false),
        }
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get the resource's session, opening one (and evicting if full) when needed.
    pub async fn obtain(&self, resource_id: &str) -> Result<Session, SessionError> {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return Err(SessionError::Stopped);
            }

            let notified = self.changed.notified();
            let next = {
                let mut state = self.state();
                let now = self.clock.now();
                if let Some(entry) = state.live.get_mut(resource_id) {
                    entry.last_used = now;
                    entry.in_use = true;
                    Next::Ready(entry.session.clone())
                } else if state.opening.contains(resource_id) {
                    Next::Wait
                } else if state.occupied() < self.max_concurrent {
                    state.opening.insert(resource_id.to_string());
                    Next::Open(None)
                } else {
                    match state.eviction_candidate() {
                        Some(victim) => {
                            let evicted = state.live.remove(&victim);
                            state.opening.insert(resource_id.to_string());
                            Next::Open(evicted)
                        }
                        // Every slot is mid-open.
                        None => Next::Wait,
                    }
                }
            };

            match next {
                Next::Ready(session) => return Ok(session),
                Next::Wait => notified.await,
                Next::Open(evicted) => {
                    let slot = OpeningSlot {
                        pool: self,
                        resource_id,
                        armed: true,
                    };
                    if let Some(entry) = evicted {
                        tracing::info!(
                            resource_id = %entry.session.resource_id,
                            for_resource = resource_id,
                            in_use = entry.in_use,
                            "evicting least recently used session"
                        );
                        self.close_quietly(&entry.session).await;
                    }
                    return self.open(resource_id, slot).await;
                }
            }
        }
    }

    async fn open(&self, resource_id: &str, mut slot: OpeningSlot<'_>) -> Result<Session, SessionError> {
        let result = self.backend.open(resource_id).await;
        let now = self.clock.now();

        let outcome = {
            let mut state = self.state();
            state.opening.remove(resource_id);
            slot.armed = false;
            match result {
                Ok(handle) => {
                    let session = Session {
                        id: Uuid::new_v4(),
                        resource_id: resource_id.to_string(),
                        handle,
                        created_at: now,
                    };
                    state.live.insert(
                        resource_id.to_string(),
                        Entry {
                            session: session.clone(),
                            last_used: now,
                            in_use: true,
                        },
                    );
                    Ok(session)
                }
                Err(source) => Err(SessionError::Open {
                    resource_id: resource_id.to_string(),
                    source,
                }),
            }
        };
        self.changed.notify_waiters();

        match &outcome {
            Ok(session) => tracing::info!(resource_id, session_id = %session.id, "session opened"),
            Err(e) => tracing::warn!(resource_id, error = %e, "session open failed"),
        }
        outcome
    }

    /// Mark the resource's session idle. It stays cached for reuse.
    pub fn release(&self, resource_id: &str) {
        let mut state = self.state();
        let now = self.clock.now();
        if let Some(entry) = state.live.get_mut(resource_id) {
            entry.in_use = false;
            entry.last_used = now;
        }
    }

    /// Close every idle session unused for longer than the idle timeout.
    ///
    /// Returns the number of sessions closed.
    pub async fn sweep_idle(&self) -> usize {
        let cutoff = self.clock.now() - self.idle_timeout;
        let expired: Vec<Entry> = {
            let mut state = self.state();
            let ids: Vec<String> = state
                .live
                .iter()
                .filter(|(_, e)| !e.in_use && e.last_used < cutoff)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| state.live.remove(id)).collect()
        };
        if expired.is_empty() {
            return 0;
        }
        self.changed.notify_waiters();

        for entry in &expired {
            tracing::debug!(resource_id = %entry.session.resource_id, "closing idle session");
            self.close_quietly(&entry.session).await;
        }
        tracing::info!(closed = expired.len(), "idle session sweep");
        expired.len()
    }

    /// Close one resource's session, if it has one.
    pub async fn stop(&self, resource_id: &str) -> Result<bool, SessionError> {
        let entry = self.state().live.remove(resource_id);
        let Some(entry) = entry else {
            return Ok(false);
        };
        self.changed.notify_waiters();

        self.backend
            .close(&entry.session)
            .await
            .map_err(|source| SessionError::Close {
                resource_id: resource_id.to_string(),
                source,
            })?;
        tracing::info!(resource_id, "session stopped");
        Ok(true)
    }

    /// Close every live session and refuse further `obtain` calls.
    ///
    /// Close failures are logged and counted; they never stop the remaining closes.
    pub async fn stop_all(&self) -> StopReport {
        self.stopped.store(true, Ordering::SeqCst);
        let entries: Vec<Entry> = self.state().live.drain().map(|(_, e)| e).collect();
        self.changed.notify_waiters();

        let results = join_all(entries.iter().map(|e| self.backend.close(&e.session))).await;

        let mut report = StopReport::default();
        for (entry, result) in entries.iter().zip(results) {
            match result {
                Ok(()) => report.closed += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        resource_id = %entry.session.resource_id,
                        error = %e,
                        "failed to close session during shutdown"
                    );
                }
            }
        }
        tracing::info!(closed = report.closed, failed = report.failed, "session pool stopped");
        report
    }

    /// Number of live sessions.
    pub fn live_count(&self) -> usize {
        self.state().live.len()
    }

    /// Resources with a live session, sorted.
    pub fn live_resources(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.state().live.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether the resource currently has a live session.
    pub fn contains(&self, resource_id: &str) -> bool {
        self.state().live.contains_key(resource_id)
    }

    async fn close_quietly(&self, session: &Session) {
        if let Err(e) = self.backend.close(session).await {
            tracing::warn!(
                resource_id = %session.resource_id,
                error = %e,
                "failed to close session"
            );
        }
    }
}

// ABOUTME: Tests for the session pool.
// ABOUTME: Covers reuse, the concurrency cap, LRU eviction, idle sweeps, and teardown.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};

use super::pool::{SessionPool, StopReport};
use crate::backend::ScriptedBackend;
use crate::clock::ManualClock;
use crate::config::CoreConfig;
use crate::error::SessionError;

struct Fixture {
    pool: Arc<SessionPool>,
    backend: Arc<ScriptedBackend>,
    clock: Arc<ManualClock>,
}

fn fixture(max: usize) -> Fixture {
    let config = CoreConfig::builder()
        .max_concurrent_sessions(max)
        .session_idle_timeout(Duration::from_secs(600))
        .build()
        .unwrap();
    let backend = Arc::new(ScriptedBackend::new());
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap(),
    ));
    let pool = Arc::new(SessionPool::new(backend.clone(), &config, clock.clone()));
    Fixture {
        pool,
        backend,
        clock,
    }
}

#[tokio::test]
async fn test_obtain_reuses_live_session() {
    let f = fixture(3);

    let first = f.pool.obtain("acct-1").await.unwrap();
    f.pool.release("acct-1");
    let second = f.pool.obtain("acct-1").await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(f.backend.opened(), 1);
    assert_eq!(f.pool.live_count(), 1);
}

#[tokio::test]
async fn test_never_exceeds_cap() {
    let f = fixture(3);

    for i in 0..10 {
        let id = format!("acct-{}", i % 7);
        f.pool.obtain(&id).await.unwrap();
        f.pool.release(&id);
        f.clock.advance(chrono::Duration::seconds(1));
        assert!(f.pool.live_count() <= 3);
    }

    assert!(f.backend.max_live() <= 3);
    assert_eq!(f.backend.live(), f.pool.live_count());
}

#[tokio::test]
async fn test_concurrent_obtains_respect_cap() {
    let f = fixture(2);
    let mut handles = Vec::new();

    for i in 0..8 {
        let pool = f.pool.clone();
        handles.push(tokio::spawn(async move {
            let id = format!("acct-{}", i);
            let session = pool.obtain(&id).await;
            pool.release(&id);
            session
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    assert!(f.backend.max_live() <= 2);
    assert!(f.pool.live_count() <= 2);
}

#[tokio::test]
async fn test_evicts_least_recently_used() {
    let f = fixture(3);

    for id in ["a", "b", "c"] {
        f.pool.obtain(id).await.unwrap();
        f.pool.release(id);
        f.clock.advance(chrono::Duration::seconds(10));
    }
    // Touch "a" so "b" becomes the oldest.
    f.pool.obtain("a").await.unwrap();
    f.pool.release("a");

    f.pool.obtain("d").await.unwrap();

    assert!(f.pool.contains("a"));
    assert!(!f.pool.contains("b"));
    assert!(f.pool.contains("c"));
    assert!(f.pool.contains("d"));
    assert_eq!(f.backend.closed(), 1);
}

#[tokio::test]
async fn test_idle_sessions_evicted_before_busy_ones() {
    let f = fixture(2);

    f.pool.obtain("busy").await.unwrap();
    f.clock.advance(chrono::Duration::seconds(10));
    f.pool.obtain("idle").await.unwrap();
    f.pool.release("idle");

    f.pool.obtain("new").await.unwrap();

    assert!(f.pool.contains("busy"));
    assert!(!f.pool.contains("idle"));
}

#[tokio::test]
async fn test_evicted_resource_gets_new_session() {
    let f = fixture(1);

    let original = f.pool.obtain("a").await.unwrap();
    f.pool.release("a");
    f.pool.obtain("b").await.unwrap();
    f.pool.release("b");
    let reopened = f.pool.obtain("a").await.unwrap();

    assert_ne!(original.id, reopened.id);
    assert_ne!(original.handle, reopened.handle);
    assert_eq!(f.backend.opened(), 3);
    assert_eq!(f.pool.live_count(), 1);
}

#[tokio::test]
async fn test_sweep_closes_only_stale_idle_sessions() {
    let f = fixture(5);

    f.pool.obtain("stale").await.unwrap();
    f.pool.release("stale");
    f.pool.obtain("busy").await.unwrap();
    f.clock.advance(chrono::Duration::minutes(11));
    f.pool.obtain("fresh").await.unwrap();
    f.pool.release("fresh");

    let closed = f.pool.sweep_idle().await;

    assert_eq!(closed, 1);
    assert!(!f.pool.contains("stale"));
    assert!(f.pool.contains("busy"));
    assert!(f.pool.contains("fresh"));
}

#[tokio::test]
async fn test_open_failure_frees_slot() {
    let f = fixture(1);
    f.backend.fail_open_for("broken");

    match f.pool.obtain("broken").await.unwrap_err() {
        SessionError::Open { resource_id, .. } => assert_eq!(resource_id, "broken"),
        other => panic!("Expected Open error, got {:?}", other),
    }
    assert_eq!(f.pool.live_count(), 0);
    assert!(f.pool.obtain("working").await.is_ok());
}

#[tokio::test]
async fn test_concurrent_obtain_same_resource_opens_once() {
    let f = fixture(3);
    let (a, b) = tokio::join!(f.pool.obtain("acct-1"), f.pool.obtain("acct-1"));

    assert_eq!(a.unwrap().id, b.unwrap().id);
    assert_eq!(f.backend.opened(), 1);
}

#[tokio::test]
async fn test_stop_closes_one_session() {
    let f = fixture(3);
    f.pool.obtain("acct-1").await.unwrap();

    assert!(f.pool.stop("acct-1").await.unwrap());
    assert!(!f.pool.stop("acct-1").await.unwrap());
    assert_eq!(f.pool.live_count(), 0);
}

#[tokio::test]
async fn test_stop_all_tolerates_close_failures() {
    let f = fixture(3);
    f.backend.fail_close_for("acct-2");
    for id in ["acct-1", "acct-2", "acct-3"] {
        f.pool.obtain(id).await.unwrap();
    }

    let report = f.pool.stop_all().await;

    assert_eq!(report, StopReport { closed: 2, failed: 1 });
    assert_eq!(f.backend.closed(), 3);
    assert_eq!(f.pool.live_count(), 0);
    assert!(matches!(
        f.pool.obtain("acct-1").await,
        Err(SessionError::Stopped)
    ));
}

#[tokio::test]
async fn test_abandoned_open_frees_its_slot() {
    let f = fixture(1);
    f.backend.set_open_delay(Duration::from_millis(200));

    let pool = f.pool.clone();
    let abandoned = tokio::spawn(async move { pool.obtain("acct-1").await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    abandoned.abort();
    assert!(abandoned.await.unwrap_err().is_cancelled());

    f.backend.set_open_delay(Duration::ZERO);
    let same = tokio::time::timeout(Duration::from_secs(1), f.pool.obtain("acct-1")).await;
    assert_eq!(same.unwrap().unwrap().resource_id, "acct-1");
    f.pool.release("acct-1");

    let other = tokio::time::timeout(Duration::from_secs(1), f.pool.obtain("acct-2")).await;
    assert_eq!(other.unwrap().unwrap().resource_id, "acct-2");
    assert_eq!(f.pool.live_count(), 1);
}

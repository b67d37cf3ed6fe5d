// ABOUTME: Tests for the per-resource action pacer.
// ABOUTME: Covers bursts, throttling, per-resource isolation, and cancellation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::pacer::{ActionPacer, Cancelled};
use crate::config::PacingConfig;

fn pacer(burst: f64, per_minute: f64) -> ActionPacer {
    ActionPacer::new(PacingConfig { burst, per_minute })
}

#[tokio::test]
async fn test_new_resource_starts_full() {
    let pacer = pacer(3.0, 60.0);
    let available = pacer.available("acct-1").await;
    assert!((available - 3.0).abs() < 0.01, "got {}", available);
}

#[tokio::test]
async fn test_burst_is_immediate() {
    let pacer = pacer(3.0, 60.0);
    let never = CancellationToken::new();

    let start = Instant::now();
    for _ in 0..3 {
        pacer.pace("acct-1", &never).await.unwrap();
    }
    assert!(
        start.elapsed() < Duration::from_millis(50),
        "burst took {:?}",
        start.elapsed()
    );
    assert!(pacer.available("acct-1").await < 0.5);
}

#[tokio::test]
async fn test_waits_when_bucket_empty() {
    // One token, refilled at 10 per second.
    let pacer = pacer(1.0, 600.0);
    let never = CancellationToken::new();

    pacer.pace("acct-1", &never).await.unwrap();

    let start = Instant::now();
    pacer.pace("acct-1", &never).await.unwrap();
    let elapsed = start.elapsed();

    assert!(elapsed >= Duration::from_millis(50), "waited {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(400), "waited {:?}", elapsed);
}

#[tokio::test]
async fn test_resources_are_paced_independently() {
    let pacer = pacer(1.0, 1.0);
    let never = CancellationToken::new();

    pacer.pace("acct-1", &never).await.unwrap();

    let start = Instant::now();
    pacer.pace("acct-2", &never).await.unwrap();
    assert!(start.elapsed() < Duration::from_millis(50));
}

#[tokio::test]
async fn test_cancel_interrupts_wait() {
    let pacer = pacer(1.0, 1.0);
    let cancel = CancellationToken::new();

    pacer.pace("acct-1", &cancel).await.unwrap();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let start = Instant::now();
    let result = pacer.pace("acct-1", &cancel).await;
    assert_eq!(result, Err(Cancelled));
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_forget_resets_bucket() {
    let pacer = pacer(2.0, 1.0);
    let never = CancellationToken::new();

    pacer.pace("acct-1", &never).await.unwrap();
    pacer.pace("acct-1", &never).await.unwrap();
    pacer.forget("acct-1").await;

    assert!((pacer.available("acct-1").await - 2.0).abs() < 0.01);
}

#[tokio::test]
async fn test_concurrent_paces_complete() {
    let pacer = Arc::new(pacer(5.0, 6000.0));
    let mut handles = Vec::new();

    for i in 0..5 {
        let pacer = pacer.clone();
        handles.push(tokio::spawn(async move {
            let never = CancellationToken::new();
            pacer.pace(&format!("acct-{}", i % 2), &never).await
        }));
    }

    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }
}

#[test]
fn test_cancelled_display() {
    assert_eq!(Cancelled.to_string(), "pacing wait cancelled");
}

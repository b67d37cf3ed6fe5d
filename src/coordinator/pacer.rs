// ABOUTME: Per-resource token bucket spacing out actions on one account.
// ABOUTME: Allows short bursts while holding each resource to a sustained action rate.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::PacingConfig;

/// Error returned when a pacing wait is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("pacing wait cancelled")]
pub struct Cancelled;

/// Bucket state for one resource.
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket pacer keyed by resource.
///
/// Every resource starts with `burst` tokens and regains `per_minute / 60`
/// tokens per second. Each action costs one token; when a resource's bucket
/// is empty the caller waits until a token is available or the wait is
/// cancelled. Buckets are independent, so pacing one resource never delays
/// another.
pub struct ActionPacer {
    buckets: Mutex<HashMap<String, Bucket>>,
    capacity: f64,
    refill_rate: f64,
}

impl ActionPacer {
    /// Create a pacer from configuration.
    ///
    /// # Panics
    ///
    /// Panics if `burst` or `per_minute` is not positive. `CoreConfig::validate`
    /// rejects such values before a pacer is built.
    pub fn new(config: PacingConfig) -> Self {
        assert!(config.burst > 0.0, "burst must be positive");
        assert!(config.per_minute > 0.0, "per_minute must be positive");

        Self {
            buckets: Mutex::new(HashMap::new()),
            capacity: config.burst,
            refill_rate: config.per_minute / 60.0,
        }
    }

    /// Wait until `resource_id` may perform one more action.
    ///
    /// Returns `Err(Cancelled)` if `cancel` fires first.
    pub async fn pace(&self, resource_id: &str, cancel: &CancellationToken) -> Result<(), Cancelled> {
        loop {
            let wait_time = self.try_take(resource_id).await;
            if wait_time.is_zero() {
                return Ok(());
            }

            // Avoid spinning on timer granularity.
            let wait_time = wait_time.max(Duration::from_millis(10));
            tracing::debug!(resource_id, ?wait_time, "pacing action");

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Err(Cancelled);
                }
                () = tokio::time::sleep(wait_time) => {}
            }
        }
    }

    /// Take one token without waiting.
    ///
    /// Returns `Duration::ZERO` on success, otherwise the estimated wait.
    async fn try_take(&self, resource_id: &str) -> Duration {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(resource_id.to_string())
            .or_insert_with(|| Bucket {
                tokens: self.capacity,
                last_refill: Instant::now(),
            });
        self.refill(bucket);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Duration::ZERO;
        }

        let needed = 1.0 - bucket.tokens;
        Duration::from_secs_f64(needed / self.refill_rate)
    }

    /// Tokens currently available to a resource.
    pub async fn available(&self, resource_id: &str) -> f64 {
        let mut buckets = self.buckets.lock().await;
        match buckets.get_mut(resource_id) {
            Some(bucket) => {
                self.refill(bucket);
                bucket.tokens
            }
            None => self.capacity,
        }
    }

    /// Drop a resource's bucket, e.g. when it stops receiving work.
    pub async fn forget(&self, resource_id: &str) {
        self.buckets.lock().await.remove(resource_id);
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.last_refill = now;
        bucket.tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.capacity);
    }
}

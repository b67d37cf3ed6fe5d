// ABOUTME: Durable counter store behind the quota ledger.
// ABOUTME: Every mutation is a single conditional update, never a read-then-write pair.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::QuotaError;

/// Identifies one counter: a resource and an action kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuotaKey {
    pub resource_id: String,
    pub kind: String,
}

impl QuotaKey {
    pub fn new(resource_id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            kind: kind.into(),
        }
    }
}

/// Snapshot of one counter for a given day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QuotaUsage {
    pub count: u32,
    /// Reduced limit in force for the day, if any.
    pub limit_override: Option<u32>,
}

impl QuotaUsage {
    /// The limit that actually applies given the configured one.
    pub fn effective_limit(&self, configured: u32) -> u32 {
        self.limit_override.map_or(configured, |o| o.min(configured))
    }
}

/// Storage for per-resource, per-kind, per-day counters.
///
/// Implementations must make each method atomic with respect to the others
/// for the same key: a database implementation would use a conditional
/// `UPDATE ... WHERE count < limit` or compare-and-swap. A counter whose
/// stored day differs from `day` is treated as zero and reset on first write.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Increment the counter if it is below `limit`.
    ///
    /// Returns the new count, or `QuotaError::Exhausted` without changing anything.
    async fn try_increment(
        &self,
        key: &QuotaKey,
        day: NaiveDate,
        limit: u32,
    ) -> Result<u32, QuotaError>;

    /// Give back one unit reserved on `day`. Does nothing if the counter
    /// has since moved on to another day.
    async fn decrement(&self, key: &QuotaKey, day: NaiveDate) -> Result<(), QuotaError>;

    /// Read the counter for `day`.
    async fn usage(&self, key: &QuotaKey, day: NaiveDate) -> Result<QuotaUsage, QuotaError>;

    /// Cut the remaining allowance for `day` in half, rounding down.
    ///
    /// Returns the new effective limit.
    async fn halve_remaining(
        &self,
        key: &QuotaKey,
        day: NaiveDate,
        limit: u32,
    ) -> Result<u32, QuotaError>;
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    day: NaiveDate,
    usage: QuotaUsage,
}

/// In-memory counter store.
///
/// A single mutex guards all counters, so each operation is trivially atomic.
pub struct MemoryQuotaStore {
    counters: Mutex<HashMap<QuotaKey, Counter>>,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Create a new store wrapped in Arc for sharing.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Seed a counter, e.g. to resume from a known state.
    pub fn set_count(&self, key: QuotaKey, day: NaiveDate, count: u32) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.insert(
            key,
            Counter {
                day,
                usage: QuotaUsage {
                    count,
                    limit_override: None,
                },
            },
        );
    }

    fn with_counter<T>(&self, key: &QuotaKey, day: NaiveDate, f: impl FnOnce(&mut QuotaUsage) -> T) -> T {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let counter = counters.entry(key.clone()).or_insert(Counter {
            day,
            usage: QuotaUsage::default(),
        });
        if counter.day != day {
            // Lazy reset on first touch of a new day.
            counter.day = day;
            counter.usage = QuotaUsage::default();
        }
        f(&mut counter.usage)
    }
}

impl Default for MemoryQuotaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn try_increment(
        &self,
        key: &QuotaKey,
        day: NaiveDate,
        limit: u32,
    ) -> Result<u32, QuotaError> {
        self.with_counter(key, day, |usage| {
            let effective = usage.effective_limit(limit);
            if usage.count >= effective {
                return Err(QuotaError::Exhausted {
                    resource_id: key.resource_id.clone(),
                    kind: key.kind.clone(),
                    limit: effective,
                });
            }
            usage.count += 1;
            Ok(usage.count)
        })
    }

    async fn decrement(&self, key: &QuotaKey, day: NaiveDate) -> Result<(), QuotaError> {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(counter) = counters.get_mut(key).filter(|c| c.day == day) {
            counter.usage.count = counter.usage.count.saturating_sub(1);
        }
        Ok(())
    }

    async fn usage(&self, key: &QuotaKey, day: NaiveDate) -> Result<QuotaUsage, QuotaError> {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        Ok(match counters.get(key) {
            Some(counter) if counter.day == day => counter.usage,
            _ => QuotaUsage::default(),
        })
    }

    async fn halve_remaining(
        &self,
        key: &QuotaKey,
        day: NaiveDate,
        limit: u32,
    ) -> Result<u32, QuotaError> {
        Ok(self.with_counter(key, day, |usage| {
            let effective = usage.effective_limit(limit);
            let remaining = effective.saturating_sub(usage.count);
            let reduced = usage.count.min(effective) + remaining / 2;
            usage.limit_override = Some(reduced);
            reduced
        }))
    }
}

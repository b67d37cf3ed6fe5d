// ABOUTME: Per-resource, per-day action quotas backed by a QuotaStore.
// ABOUTME: Reserves a slot when work is accepted and answers remaining-allowance queries.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};

use super::store::{QuotaKey, QuotaStore};
use crate::clock::{self, Clock};
use crate::config::CoreConfig;
use crate::error::QuotaError;

/// Outcome of a successful reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// A slot was taken on `day`; `used` of `limit` are now spent that day.
    Reserved { day: NaiveDate, used: u32, limit: u32 },
    /// The action kind has no daily limit.
    Unlimited,
}

/// Daily quota ledger.
///
/// Limits come from `CoreConfig::daily_limits`; kinds without an entry are
/// unlimited. Days are UTC calendar days read from the injected clock, and
/// counters reset lazily the first time they are touched on a new day.
pub struct QuotaLedger {
    store: Arc<dyn QuotaStore>,
    config: Arc<CoreConfig>,
    clock: Arc<dyn Clock>,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn QuotaStore>, config: Arc<CoreConfig>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    /// Atomically check the limit and take one slot for `kind` today.
    pub async fn try_reserve(&self, resource_id: &str, kind: &str) -> Result<Reservation, QuotaError> {
        let Some(limit) = self.config.daily_limit(kind) else {
            return Ok(Reservation::Unlimited);
        };
        let key = QuotaKey::new(resource_id, kind);
        let day = self.clock.today();
        let used = self.store.try_increment(&key, day, limit).await?;
        tracing::debug!(resource_id, kind, used, limit, "quota reserved");
        Ok(Reservation::Reserved { day, used, limit })
    }

    /// Return a reservation whose action never ran.
    ///
    /// The slot goes back to the day it was taken from. Once that day has
    /// rolled over there is nothing left to give back.
    pub async fn refund(&self, resource_id: &str, kind: &str, reservation: Reservation) -> Result<(), QuotaError> {
        if let Reservation::Reserved { day, .. } = reservation {
            let key = QuotaKey::new(resource_id, kind);
            self.store.decrement(&key, day).await?;
            tracing::debug!(resource_id, kind, %day, "quota refunded");
        }
        Ok(())
    }

    /// Whether another `kind` action fits today's allowance.
    pub async fn can_perform(&self, resource_id: &str, kind: &str) -> Result<bool, QuotaError> {
        Ok(self.remaining(resource_id, kind).await?.is_none_or(|r| r > 0))
    }

    /// Slots left today, or `None` for unlimited kinds.
    pub async fn remaining(&self, resource_id: &str, kind: &str) -> Result<Option<u32>, QuotaError> {
        let Some(limit) = self.config.daily_limit(kind) else {
            return Ok(None);
        };
        let key = QuotaKey::new(resource_id, kind);
        let usage = self.store.usage(&key, self.clock.today()).await?;
        Ok(Some(usage.effective_limit(limit).saturating_sub(usage.count)))
    }

    /// Units of `kind` spent today.
    pub async fn used_today(&self, resource_id: &str, kind: &str) -> Result<u32, QuotaError> {
        let key = QuotaKey::new(resource_id, kind);
        Ok(self.store.usage(&key, self.clock.today()).await?.count)
    }

    /// Halve today's remaining allowance for every limited kind.
    ///
    /// Returns the new limits as `(kind, limit)` pairs.
    pub async fn halve_remaining(&self, resource_id: &str) -> Result<Vec<(String, u32)>, QuotaError> {
        let today = self.clock.today();
        let mut kinds: Vec<_> = self.config.daily_limits.iter().collect();
        kinds.sort();

        let mut reduced = Vec::with_capacity(kinds.len());
        for (kind, limit) in kinds {
            let key = QuotaKey::new(resource_id, kind.as_str());
            let new_limit = self.store.halve_remaining(&key, today, *limit).await?;
            reduced.push((kind.clone(), new_limit));
        }
        tracing::info!(resource_id, ?reduced, "daily quotas halved");
        Ok(reduced)
    }

    /// When exhausted work should next be tried: the start of the next day.
    pub fn next_reset(&self) -> DateTime<Utc> {
        clock::start_of_next_day(self.clock.now())
    }
}

// ABOUTME: Quota module - per-resource, per-kind, per-day action limits.
// ABOUTME: Contains the ledger and its counter store abstraction.

mod ledger;
mod store;

pub use ledger::{QuotaLedger, Reservation};
pub use store::{MemoryQuotaStore, QuotaKey, QuotaStore, QuotaUsage};

// ABOUTME: Coordinator module for serializing actions on shared resources.
// ABOUTME: Contains the per-resource priority lock and per-resource action pacing.

mod coordinator;
mod pacer;

pub use coordinator::{Coordinator, LockGrant};
pub use pacer::{ActionPacer, Cancelled};

#[cfg(test)]
mod pacer_test;

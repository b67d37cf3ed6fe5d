// ABOUTME: Session module - bounded reuse of expensive per-resource sessions.
// ABOUTME: Contains the session pool and its teardown report.

mod pool;

pub use pool::{SessionPool, StopReport};

#[cfg(test)]
mod pool_test;

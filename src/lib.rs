// ABOUTME: Root module for campaign-core - per-resource coordination for campaign automation.
// ABOUTME: Re-exports all public types from submodules.

pub mod backend;
pub mod campaign;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod orchestrator;
pub mod prelude;
pub mod quota;
pub mod registry;
pub mod session;

pub use error::CoreError;

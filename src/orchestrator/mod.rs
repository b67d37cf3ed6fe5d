// ABOUTME: Orchestrator module - the composition root of the campaign core.
// ABOUTME: Contains the orchestrator, its builder, and lifecycle reports.

mod builder;
mod orchestrator;

pub use builder::OrchestratorBuilder;
pub use orchestrator::{Orchestrator, ReconcileReport, ShutdownReport};

// ABOUTME: Campaign module - recurring per-resource work that runs under the resource lock.
// ABOUTME: Defines the Campaign trait, the context it runs with, and the workstream manager.

mod context;
mod workstream;

use std::time::Duration;

use async_trait::async_trait;

pub use context::{CampaignContext, CampaignDeps};
pub use workstream::Workstreams;

/// A recurring activity run once per interval for every active resource.
///
/// The campaign's name doubles as its requester class: lock priority and
/// timeout defaults come from the matching `CoreConfig::requesters` entry.
#[async_trait]
pub trait Campaign: Send + Sync {
    /// Requester name used when locking the resource.
    fn name(&self) -> &str;

    /// Lock priority. Lower is more urgent.
    fn priority(&self) -> u32;

    /// Time between runs on one resource.
    fn interval(&self) -> Duration;

    /// One pass over one resource. The resource is locked and its session
    /// is open for the duration.
    async fn run_once(&self, ctx: &CampaignContext<'_>) -> Result<(), anyhow::Error>;
}

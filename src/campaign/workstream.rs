// ABOUTME: One background loop per (resource, campaign) pair.
// ABOUTME: Each tick locks the resource as the campaign's requester and runs one pass.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::Campaign;
use super::context::{CampaignContext, CampaignDeps};
use crate::health::HealthState;

struct Running {
    campaign: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Starts and stops campaign loops per resource.
pub struct Workstreams {
    deps: Arc<CampaignDeps>,
    campaigns: Vec<Arc<dyn Campaign>>,
    running: Mutex<HashMap<String, Vec<Running>>>,
    shutdown: CancellationToken,
}

impl Workstreams {
    /// Loops are cancelled when `shutdown` is.
    pub fn new(
        deps: Arc<CampaignDeps>,
        campaigns: Vec<Arc<dyn Campaign>>,
        shutdown: &CancellationToken,
    ) -> Self {
        Self {
            deps,
            campaigns,
            running: Mutex::new(HashMap::new()),
            shutdown: shutdown.clone(),
        }
    }

    fn running_map(&self) -> MutexGuard<'_, HashMap<String, Vec<Running>>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start every campaign on a resource that is not already running there.
    ///
    /// Returns the number of loops started.
    pub fn start(&self, resource_id: &str) -> usize {
        let mut running = self.running_map();
        let loops = running.entry(resource_id.to_string()).or_default();
        let mut started = 0;
        for campaign in &self.campaigns {
            if loops.iter().any(|r| r.campaign == campaign.name()) {
                continue;
            }
            let cancel = self.shutdown.child_token();
            let handle = tokio::spawn(run_loop(
                Arc::clone(&self.deps),
                Arc::clone(campaign),
                resource_id.to_string(),
                cancel.clone(),
            ));
            loops.push(Running {
                campaign: campaign.name().to_string(),
                cancel,
                handle,
            });
            started += 1;
        }
        if started > 0 {
            tracing::info!(resource_id, started, "workstreams started");
        }
        started
    }

    /// Stop every loop on a resource and wait for them to exit.
    pub async fn stop(&self, resource_id: &str) -> usize {
        let loops = self.running_map().remove(resource_id).unwrap_or_default();
        let stopped = loops.len();
        join_loops(loops).await;
        if stopped > 0 {
            tracing::info!(resource_id, stopped, "workstreams stopped");
        }
        stopped
    }

    /// Stop every loop on every resource.
    pub async fn stop_all(&self) {
        let loops: Vec<Running> = self
            .running_map()
            .drain()
            .flat_map(|(_, loops)| loops)
            .collect();
        join_loops(loops).await;
    }

    /// Resources with at least one loop, sorted.
    pub fn resources(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .running_map()
            .iter()
            .filter(|(_, loops)| !loops.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Every running `(resource, campaign)` pair, sorted.
    pub fn running(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<_> = self
            .running_map()
            .iter()
            .flat_map(|(id, loops)| loops.iter().map(move |r| (id.clone(), r.campaign.clone())))
            .collect();
        pairs.sort();
        pairs
    }
}

async fn join_loops(loops: Vec<Running>) {
    for running in &loops {
        running.cancel.cancel();
    }
    for running in loops {
        if let Err(e) = running.handle.await {
            if e.is_panic() {
                tracing::error!(campaign = %running.campaign, "workstream panicked");
            }
        }
    }
}

async fn run_loop(
    deps: Arc<CampaignDeps>,
    campaign: Arc<dyn Campaign>,
    resource_id: String,
    cancel: CancellationToken,
) {
    let period = campaign.interval().max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if deps.health.state(&resource_id) == HealthState::Suspended {
            tracing::debug!(resource_id = %resource_id, campaign = campaign.name(), "resource suspended, skipping pass");
            continue;
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = run_pass(&deps, campaign.as_ref(), &resource_id) => result,
        };
        if let Err(e) = result {
            tracing::warn!(
                resource_id = %resource_id,
                campaign = campaign.name(),
                error = %e,
                "campaign pass failed"
            );
        }
    }
    tracing::debug!(resource_id = %resource_id, campaign = campaign.name(), "workstream exited");
}

async fn run_pass(
    deps: &CampaignDeps,
    campaign: &dyn Campaign,
    resource_id: &str,
) -> Result<(), anyhow::Error> {
    deps.coordinator
        .run_exclusive(resource_id, campaign.name(), campaign.priority(), move || async move {
            let session = deps.pool.obtain(resource_id).await?;
            let ctx = CampaignContext::new(resource_id, &session, deps);
            let result = campaign.run_once(&ctx).await;
            deps.pool.release(resource_id);
            result
        })
        .await?
}

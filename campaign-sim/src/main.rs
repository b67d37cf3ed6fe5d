// ABOUTME: Simulation driving the campaign core against a scripted backend.
// ABOUTME: Seeds tasks for a handful of resources, runs for a while, and prints a summary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use campaign_core::prelude::*;

#[derive(Parser)]
#[command(name = "campaign-sim", about = "Run the campaign core against a simulated backend")]
struct Cli {
    /// JSON configuration file; defaults apply when absent.
    #[arg(long, env = "CAMPAIGN_CONFIG")]
    config: Option<PathBuf>,

    /// Number of simulated resources.
    #[arg(long, default_value_t = 4)]
    resources: usize,

    /// Tasks seeded per resource.
    #[arg(long, default_value_t = 12)]
    tasks: usize,

    /// Seconds to run before shutting down.
    #[arg(long, default_value_t = 5)]
    seconds: u64,

    /// Fail every n-th action. Zero never fails.
    #[arg(long, default_value_t = 7)]
    fail_every: usize,
}

// ============================================================================
// Inbox Monitor Campaign
// ============================================================================

/// Checks each resource's inbox and queues a reply when something arrived.
struct InboxMonitor;

#[async_trait]
impl Campaign for InboxMonitor {
    fn name(&self) -> &str {
        "monitor"
    }

    fn priority(&self) -> u32 {
        1
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(750)
    }

    async fn run_once(&self, ctx: &CampaignContext<'_>) -> Result<(), anyhow::Error> {
        let check = ActionSpec::new("inbox_check", serde_json::json!({}));
        let outcome = ctx.perform(&check).await?;
        if outcome.success {
            let reply = Task::new(
                ctx.resource_id(),
                "reply",
                serde_json::json!({ "source": "inbox" }),
                ctx.now(),
            )
            .with_priority(2);
            ctx.schedule(reply).await?;
        }
        Ok(())
    }
}

fn load_config(cli: &Cli) -> Result<CoreConfig> {
    let config = match &cli.config {
        Some(path) => {
            info!(path = %path.display(), "loading configuration");
            CoreConfig::from_file(path)?
        }
        None => CoreConfig::builder()
            .daily_limit("follow", 10)
            .daily_limit("like", 25)
            .daily_limit("reply", 15)
            .dispatch_interval(Duration::from_millis(100))
            .health_check_interval(Duration::from_secs(1))
            .reconcile_interval(Duration::from_secs(2))
            .session_sweep_interval(Duration::from_secs(1))
            .session_idle_timeout(Duration::from_secs(3))
            .max_concurrent_sessions(3)
            .retry_backoff(Duration::from_millis(300))
            .lock_retry_delay(Duration::from_millis(200))
            .pacing(3.0, 120.0)
            .build()?,
    };
    Ok(config)
}

async fn seed(tasks: &MemoryTaskStore, resources: &[String], per_resource: usize) -> Result<()> {
    let kinds = ["follow", "like", "like", "follow", "comment"];
    let now = chrono::Utc::now();
    for resource_id in resources {
        for i in 0..per_resource {
            let kind = kinds[i % kinds.len()];
            let at = now + chrono::Duration::milliseconds((i as i64) * 150);
            let task = Task::new(resource_id.as_str(), kind, serde_json::json!({ "n": i }), at)
                .with_priority(5 + (i % 3) as u32);
            tasks.insert(task).await?;
        }
    }
    Ok(())
}

async fn print_summary(orchestrator: &Orchestrator, resources: &[String]) -> Result<()> {
    println!();
    println!(
        "{:<10} {:>9} {:>7} {:>7} {:>9} {:>8}  health",
        "resource", "completed", "failed", "pending", "follows", "likes"
    );
    for resource_id in resources {
        let tasks = orchestrator.tasks().list_for_resource(resource_id).await?;
        let count = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count();
        let ledger = orchestrator.ledger();
        println!(
            "{:<10} {:>9} {:>7} {:>7} {:>9} {:>8}  {}",
            resource_id,
            count(TaskStatus::Completed),
            count(TaskStatus::Failed),
            count(TaskStatus::Pending),
            ledger.used_today(resource_id, "follow").await?,
            ledger.used_today(resource_id, "like").await?,
            orchestrator.health().state(resource_id),
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let resources: Vec<String> = (1..=cli.resources).map(|i| format!("acct-{}", i)).collect();
    let backend = Arc::new(ScriptedBackend::new());
    backend.fail_every(cli.fail_every);
    backend.set_action_delay(Duration::from_millis(40));

    let tasks = MemoryTaskStore::shared();
    seed(&tasks, &resources, cli.tasks).await?;

    let orchestrator = Orchestrator::builder()
        .config(config)
        .backend(backend.clone())
        .task_store(tasks.clone())
        .registry(MemoryResourceRegistry::with_active(resources.iter().cloned()))
        .remediation(RemediationFn::new(|resource_id| {
            tracing::warn!(resource_id, "resource suspended, replacement required");
        }))
        .campaign(Arc::new(InboxMonitor))
        .build()?;

    orchestrator.start().await?;
    info!(resources = resources.len(), seconds = cli.seconds, "simulation running");

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(cli.seconds)) => {}
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    let report = orchestrator.shutdown().await;
    info!(
        aborted = report.aborted,
        sessions_closed = report.sessions.closed,
        max_live_sessions = backend.max_live(),
        "simulation finished"
    );

    print_summary(&orchestrator, &resources).await
}

//! Orchestrator CLI: scheduler, task downloader and submission driver.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use buttercup_common::NodeLocal;
use buttercup_orchestrator::background::BackgroundTaskManager;
use buttercup_orchestrator::competition_api::CompetitionApiClient;
use buttercup_orchestrator::corpus_merger::CorpusMergingTask;
use buttercup_orchestrator::downloader::Downloader;
use buttercup_orchestrator::pov_reproduction::POVReproductionTask;
use buttercup_orchestrator::scheduler::Scheduler;
use buttercup_orchestrator::scratch_cleanup::ScratchCleanupTask;
use buttercup_orchestrator::submitter::Submitter;

#[derive(Parser)]
#[command(name = "orchestrator")]
#[command(about = "Buttercup CRS orchestrator")]
#[command(version)]
struct Cli {
    /// Redis connection URL
    #[arg(long, env = "BUTTERCUP_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler loop and its background tasks
    Scheduler {
        /// Scratch root scanned by the cleanup task
        #[arg(long)]
        scratch_dir: PathBuf,

        /// Seconds past expiry before a task's scratch space is reclaimed
        #[arg(long, default_value_t = 1800)]
        delete_old_tasks_delta_seconds: i64,

        /// Per-task storage base under the node-local root
        #[arg(long, default_value = "tasks_storage")]
        tasks_storage_dir: String,

        /// Python interpreter used for OSS-Fuzz helper invocations
        #[arg(long, default_value = "python3")]
        python: String,

        /// Wall-clock cap for one fuzzer merge run, in seconds
        #[arg(long, default_value_t = 300)]
        merge_timeout_seconds: u64,
    },
    /// Ingest webhook-delivered tasks
    Downloader {
        /// Per-task storage base under the node-local root
        #[arg(long, default_value = "tasks_storage")]
        tasks_storage_dir: String,

        /// Sanitizers to build fuzzers for
        #[arg(long, default_values_t = vec!["address".to_string()])]
        sanitizers: Vec<String>,
    },
    /// Drain PoVs, patches and bundles to the competition API
    Submitter {
        /// Base URL of the competition API
        #[arg(long, env = "BUTTERCUP_COMPETITION_API_URL")]
        api_url: String,

        /// API key id for basic auth
        #[arg(long, env = "BUTTERCUP_COMPETITION_API_KEY_ID")]
        api_key_id: String,

        /// API token for basic auth
        #[arg(long, env = "BUTTERCUP_COMPETITION_API_TOKEN")]
        api_token: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    buttercup_common::telemetry::init("orchestrator")?;
    let cli = Cli::parse();

    let node_local = NodeLocal::from_env()?;
    let client = redis::Client::open(cli.redis_url.as_str()).context("opening redis client")?;
    let conn = client
        .get_connection_manager()
        .await
        .context("connecting to redis")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    match cli.command {
        Commands::Scheduler {
            scratch_dir,
            delete_old_tasks_delta_seconds,
            tasks_storage_dir,
            python,
            merge_timeout_seconds,
        } => {
            let registry = buttercup_common::TaskRegistry::new(conn.clone());

            let mut background = BackgroundTaskManager::new();
            background.start(Box::new(ScratchCleanupTask::new(
                registry,
                scratch_dir,
                delete_old_tasks_delta_seconds,
            )));
            background.start(Box::new(CorpusMergingTask::new(
                conn.clone(),
                node_local.clone(),
                tasks_storage_dir,
                python.clone(),
                Duration::from_secs(merge_timeout_seconds),
            )));
            background.start(Box::new(POVReproductionTask::new(
                conn.clone(),
                node_local.clone(),
                python,
            )));

            let scheduler = Scheduler::new(conn, node_local).await?;
            let result = scheduler.run(shutdown_rx).await;
            background.log_status().await;
            background.stop_all().await;
            result
        }
        Commands::Downloader {
            tasks_storage_dir,
            sanitizers,
        } => {
            let downloader =
                Downloader::new(conn, node_local, tasks_storage_dir, sanitizers).await?;
            downloader.run(shutdown_rx).await
        }
        Commands::Submitter {
            api_url,
            api_key_id,
            api_token,
        } => {
            let api = CompetitionApiClient::new(api_url, api_key_id, api_token);
            let submitter = Submitter::new(conn, node_local, api).await?;
            submitter.run(shutdown_rx).await
        }
    }
}

//! Fuzzing infrastructure workers CLI.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use buttercup_common::constants::queue_names;
use buttercup_common::queue::QueueFactory;
use buttercup_common::stacktrace::CrashSet;
use buttercup_common::NodeLocal;
use buttercup_fuzzing_infra::builder::BuilderBot;
use buttercup_fuzzing_infra::confirmer::Confirmer;
use buttercup_fuzzing_infra::crash_intake::CrashIntake;
use buttercup_fuzzing_infra::fuzzer::FuzzerBot;
use buttercup_fuzzing_infra::tracer::TracerBot;

#[derive(Parser)]
#[command(name = "fuzzing-infra")]
#[command(about = "Buttercup build dispatcher, fuzzer, crash tracer and vulnerability confirmer")]
#[command(version)]
struct Cli {
    /// Redis connection URL
    #[arg(long, env = "BUTTERCUP_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// Python interpreter used for OSS-Fuzz helper invocations
    #[arg(long, default_value = "python3", global = true)]
    python: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve build requests
    Builder {
        /// Disable reuse of prior builds with identical fingerprints
        #[arg(long)]
        no_caching: bool,

        /// Pull the latest base image before building
        #[arg(long)]
        allow_pull: bool,

        /// Working directory for read-write task copies
        #[arg(long)]
        wdir: PathBuf,
    },
    /// Run weighted fuzzing sessions
    Fuzzer {
        /// Per-task storage base under the node-local root
        #[arg(long, default_value = "tasks_storage")]
        tasks_storage: String,

        /// Length of one fuzzing session, in seconds
        #[arg(long, default_value_t = 300)]
        session_seconds: u64,
    },
    /// Re-run crashes under the tracer build
    Tracer,
    /// Deduplicate traced crashes into confirmed vulnerabilities
    Confirmer {
        /// Per-task storage base under the node-local root
        #[arg(long, default_value = "tasks_storage")]
        tasks_storage: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    buttercup_common::telemetry::init("fuzzing-infra")?;
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
        Commands::Builder {
            no_caching,
            allow_pull,
            wdir,
        } => {
            std::fs::create_dir_all(&wdir)?;
            let bot = BuilderBot::new(conn, node_local, wdir, cli.python, !no_caching, allow_pull)
                .await?;
            bot.run(shutdown_rx).await
        }
        Commands::Fuzzer {
            tasks_storage,
            session_seconds,
        } => {
            let factory = QueueFactory::new(conn.clone());
            let crashes = factory.producer(queue_names::CRASHES);
            let intake = CrashIntake::new(
                CrashSet::new(conn.clone()),
                crashes,
                node_local.clone(),
                tasks_storage.clone(),
            );
            let bot = FuzzerBot::new(
                conn,
                intake,
                node_local,
                tasks_storage,
                std::time::Duration::from_secs(session_seconds),
            );
            bot.run(shutdown_rx).await
        }
        Commands::Tracer => {
            let bot = TracerBot::new(conn, node_local, cli.python).await?;
            bot.run(shutdown_rx).await
        }
        Commands::Confirmer { tasks_storage } => {
            let confirmer = Confirmer::new(conn, node_local, tasks_storage).await?;
            confirmer.run(shutdown_rx).await
        }
    }
}

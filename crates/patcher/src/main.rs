//! Patcher service: one workflow per confirmed vulnerability.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use buttercup_common::constants::{group_names, queue_names, MAX_TRIES};
use buttercup_common::maps::BuildMap;
use buttercup_common::messages::{
    BuildRequest, BuildType, ConfirmedVulnerability, Patch, POVReproduceRequest,
};
use buttercup_common::pov_status::PoVReproduceStatus;
use buttercup_common::queue::{QueueFactory, RQItem, ReliableQueue};
use buttercup_common::{NodeLocal, TaskRegistry};

use buttercup_patcher::codequery::CodeQueryClient;
use buttercup_patcher::language::LanguageValidator;
use buttercup_patcher::llm::LiteLlmClient;
use buttercup_patcher::machine::Collaborators;
use buttercup_patcher::{PatcherConfig, PatcherWorkflow};

#[derive(Parser)]
#[command(name = "patcher")]
#[command(about = "Buttercup patch generation workflow")]
#[command(version)]
struct Cli {
    /// Redis connection URL
    #[arg(long, env = "BUTTERCUP_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// Total patch attempts before giving up on a vulnerability
    #[arg(long, default_value_t = 30)]
    max_patch_retries: usize,

    /// Parallelism for builds and PoV runs
    #[arg(long, default_value_t = 4)]
    max_concurrency: usize,

    /// Wall-clock cap for one PoV sweep, in minutes
    #[arg(long, default_value_t = 20)]
    max_minutes_run_povs: u64,

    /// Per-task storage base under the node-local root
    #[arg(long, default_value = "tasks_storage")]
    tasks_storage: String,

    /// Working directory for patched challenge copies
    #[arg(long)]
    work_dir: PathBuf,

    /// Sanitizers every patch must build and survive PoVs under
    #[arg(long, default_values_t = vec!["address".to_string()])]
    sanitizers: Vec<String>,

    /// Python interpreter for OSS-Fuzz helper invocations
    #[arg(long, default_value = "python3")]
    python: String,

    /// Base URL of the program-model code-query server
    #[arg(long, env = "BUTTERCUP_PROGRAM_MODEL_URL")]
    program_model_url: String,

    /// Path to the language-identifier binary
    #[arg(long, env = "BUTTERCUP_LANGUAGE_IDENTIFIER")]
    language_identifier: PathBuf,

    /// Model name requested from the LLM provider
    #[arg(long, default_value = "claude-sonnet")]
    model: String,
}

struct PatcherService {
    registry: TaskRegistry,
    vulnerabilities: ReliableQueue<ConfirmedVulnerability>,
    patches: ReliableQueue<Patch>,
    builds: ReliableQueue<BuildRequest>,
    pov_status: PoVReproduceStatus,
    config: PatcherConfig,
    program_model_url: String,
    llm: Arc<LiteLlmClient>,
    node_local: NodeLocal,
    conn: redis::aio::ConnectionManager,
    language_identifier: PathBuf,
}

impl PatcherService {
    async fn serve_item(&self) -> Result<bool> {
        let Some(item) = self.vulnerabilities.pop().await? else {
            return Ok(false);
        };
        if let Err(e) = self.patch_one(&item).await {
            error!("Patch workflow for item {} failed: {e:#}", item.item_id);
            if item.times_delivered > MAX_TRIES {
                warn!(
                    "Dropping vulnerability item {} after {} deliveries",
                    item.item_id, item.times_delivered
                );
                self.vulnerabilities.ack(&item.item_id).await?;
            }
        }
        Ok(true)
    }

    async fn patch_one(&self, item: &RQItem<ConfirmedVulnerability>) -> Result<()> {
        let vulnerability = item.deserialized.clone();
        let Some(task_id) = vulnerability.task_id().map(str::to_string) else {
            warn!("Confirmed vulnerability without crashes, dropping");
            self.vulnerabilities.ack(&item.item_id).await?;
            return Ok(());
        };

        if self
            .registry
            .should_stop_processing(task_id.as_str(), None)
            .await?
        {
            info!("Task {} is cancelled or expired, dropping vulnerability", task_id);
            self.vulnerabilities.ack(&item.item_id).await?;
            return Ok(());
        }

        info!(
            "Starting patch workflow for task {} patch line {}",
            task_id, vulnerability.internal_patch_id
        );

        // Collaborators are per-task: the code index is task-scoped.
        let workflow = PatcherWorkflow::new(
            self.config.clone(),
            Collaborators {
                registry: self.registry.clone(),
                builds: BuildMap::new(self.conn.clone()),
                node_local: self.node_local.clone(),
                llm: self.llm.clone(),
                codequery: Arc::new(CodeQueryClient::new(
                    self.program_model_url.clone(),
                    task_id.clone(),
                )),
                language_validator: LanguageValidator::new(self.language_identifier.clone())?,
            },
        );

        let state = workflow.run(task_id.clone(), vulnerability.clone()).await?;
        let Some(successful) = state.get_successful_patch() else {
            info!(
                "No successful patch for task {} patch line {} after {} attempts",
                task_id,
                vulnerability.internal_patch_id,
                state.patch_attempts.len()
            );
            self.vulnerabilities.ack(&item.item_id).await?;
            return Ok(());
        };

        self.publish_patch(&task_id, &vulnerability, &successful.patch_text)
            .await?;
        self.vulnerabilities.ack(&item.item_id).await?;
        Ok(())
    }

    /// Hand the verified patch downstream: to the submitter, and to the
    /// builder + PoV reproducer for independent mitigation checks.
    async fn publish_patch(
        &self,
        task_id: &str,
        vulnerability: &ConfirmedVulnerability,
        patch_text: &str,
    ) -> Result<()> {
        self.patches
            .push(&Patch {
                task_id: task_id.to_string(),
                internal_patch_id: vulnerability.internal_patch_id.clone(),
                patch: patch_text.to_string(),
            })
            .await?;

        let Some(first_crash) = vulnerability.crashes.first() else {
            return Ok(());
        };
        for sanitizer in &self.config.sanitizers {
            self.builds
                .push(&BuildRequest {
                    task_id: task_id.to_string(),
                    engine: first_crash.crash.target.engine.clone(),
                    sanitizer: sanitizer.clone(),
                    build_type: BuildType::Patch,
                    task_dir: first_crash.crash.target.task_dir.clone(),
                    apply_diff: false,
                    patch: patch_text.to_string(),
                    internal_patch_id: vulnerability.internal_patch_id.clone(),
                })
                .await?;
        }
        for traced in &vulnerability.crashes {
            self.pov_status
                .request(&POVReproduceRequest {
                    task_id: task_id.to_string(),
                    internal_patch_id: vulnerability.internal_patch_id.clone(),
                    pov_path: traced.crash.crash_input_path.clone(),
                    sanitizer: traced.crash.target.sanitizer.clone(),
                    harness_name: traced.crash.harness_name.clone(),
                })
                .await?;
        }
        info!(
            "Published patch for task {} patch line {}",
            task_id, vulnerability.internal_patch_id
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    buttercup_common::telemetry::init("patcher")?;
    let cli = Cli::parse();

    let node_local = NodeLocal::from_env()?;
    // A missing language-identifier is fatal at startup, not per patch.
    LanguageValidator::new(cli.language_identifier.clone())?;
    let llm = Arc::new(LiteLlmClient::from_env(cli.model.clone())?);

    let client = redis::Client::open(cli.redis_url.as_str()).context("opening redis client")?;
    let conn = client
        .get_connection_manager()
        .await
        .context("connecting to redis")?;

    let factory = QueueFactory::new(conn.clone());
    let service = PatcherService {
        registry: TaskRegistry::new(conn.clone()),
        vulnerabilities: factory
            .create(queue_names::CONFIRMED_VULNERABILITIES, group_names::PATCHER)
            .await?,
        patches: factory.producer(queue_names::PATCHES),
        builds: factory.producer(queue_names::BUILDS),
        pov_status: PoVReproduceStatus::new(conn.clone()),
        config: PatcherConfig {
            max_patch_retries: cli.max_patch_retries,
            max_concurrency: cli.max_concurrency,
            max_minutes_run_povs: cli.max_minutes_run_povs,
            sanitizers: cli.sanitizers.clone(),
            tasks_storage: cli.tasks_storage.clone(),
            work_dir: cli.work_dir.clone(),
            python_path: cli.python.clone(),
            ..PatcherConfig::default()
        },
        program_model_url: cli.program_model_url.clone(),
        llm,
        node_local,
        conn,
        language_identifier: cli.language_identifier.clone(),
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    info!("Patcher started");
    let mut shutdown = shutdown_rx;
    let mut backoff = buttercup_common::queue::Backoff::default();
    loop {
        if *shutdown.borrow() {
            info!("Patcher shutting down");
            return Ok(());
        }
        match service.serve_item().await {
            Ok(true) => backoff.reset(),
            Ok(false) => {
                tokio::select! {
                    () = tokio::time::sleep(std::time::Duration::from_millis(500)) => {}
                    _ = shutdown.changed() => {}
                }
            }
            Err(e) => {
                error!("Patcher iteration failed: {e:#}");
                backoff.wait().await;
            }
        }
    }
}

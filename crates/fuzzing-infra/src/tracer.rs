//! The tracer bot: crashes in, traced crashes out.
//!
//! A crash from a fuzzer worker carries whatever stack trace the fuzzing
//! engine printed. The tracer replays the input under the dedicated tracer
//! build to get a canonical trace the confirmer can fingerprint reliably.

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use buttercup_common::challenge_task::ChallengeTask;
use buttercup_common::constants::{group_names, queue_names, MAX_TRIES};
use buttercup_common::maps::BuildMap;
use buttercup_common::messages::{BuildType, Crash, TracedCrash};
use buttercup_common::queue::{QueueFactory, RQItem, ReliableQueue};
use buttercup_common::{NodeLocal, TaskRegistry};

pub struct TracerBot {
    registry: TaskRegistry,
    build_map: BuildMap,
    crashes: ReliableQueue<Crash>,
    traced: ReliableQueue<TracedCrash>,
    node_local: NodeLocal,
    python_path: String,
}

impl TracerBot {
    pub async fn new(
        conn: redis::aio::ConnectionManager,
        node_local: NodeLocal,
        python_path: String,
    ) -> Result<Self> {
        let factory = QueueFactory::new(conn.clone());
        let crashes = factory
            .create(queue_names::CRASHES, group_names::TRACER)
            .await?;
        let traced = factory.producer(queue_names::TRACED_VULNERABILITIES);
        Ok(Self {
            registry: TaskRegistry::new(conn.clone()),
            build_map: BuildMap::new(conn),
            crashes,
            traced,
            node_local,
            python_path,
        })
    }

    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<()> {
        info!("Tracer bot started");
        let mut backoff = buttercup_common::queue::Backoff::default();
        loop {
            if *shutdown.borrow() {
                info!("Tracer bot shutting down");
                return Ok(());
            }
            match self.serve_item().await {
                Ok(true) => backoff.reset(),
                Ok(false) => {
                    tokio::select! {
                        () = tokio::time::sleep(std::time::Duration::from_millis(500)) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    error!("Tracer iteration failed: {e:#}");
                    backoff.wait().await;
                }
            }
        }
    }

    /// Handle one crash. Returns false when the queue was empty.
    pub async fn serve_item(&self) -> Result<bool> {
        let Some(item) = self.crashes.pop().await? else {
            return Ok(false);
        };
        if let Err(e) = self.trace(&item).await {
            error!("Tracing item {} failed: {e:#}", item.item_id);
            if item.times_delivered > MAX_TRIES {
                warn!(
                    "Dropping crash item {} after {} deliveries",
                    item.item_id, item.times_delivered
                );
                self.crashes.ack(&item.item_id).await?;
            }
        }
        Ok(true)
    }

    async fn trace(&self, item: &RQItem<Crash>) -> Result<()> {
        let crash = &item.deserialized;
        let task_id = &crash.target.task_id;

        if self
            .registry
            .should_stop_processing(task_id.as_str(), None)
            .await?
        {
            info!("Task {} is cancelled or expired, dropping crash", task_id);
            self.crashes.ack(&item.item_id).await?;
            return Ok(());
        }

        // Data-not-ready: the tracer build may still be in flight.
        let Some(tracer_build) = self
            .build_map
            .get_build_from_san(task_id, BuildType::Tracer, &crash.target.sanitizer, "")
            .await?
        else {
            debug!("No tracer build for {} yet, will retry", task_id);
            return Ok(());
        };

        let local_build_dir = self.node_local.local_path(&tracer_build.task_dir);
        self.node_local
            .remote_archive_to_dir(&local_build_dir)
            .context("staging tracer build")?;
        let pov = self
            .node_local
            .make_locally_available(&crash.crash_input_path)
            .context("staging crash input")?;

        let task = ChallengeTask::new(local_build_dir).with_python_path(&self.python_path);
        let scratch = self.node_local.scratch_dir()?;
        let rw = task.rw_copy(scratch.path())?;
        let info = rw.task().reproduce_pov(&crash.harness_name, &pov).await?;

        if !info.did_run() {
            debug!(
                "Tracer reproduction did not run for {}, will retry: {}",
                task_id, info.command_result.error
            );
            return Ok(());
        }

        if info.did_crash() {
            let traced = TracedCrash {
                crash: crash.clone(),
                tracer_stacktrace: format!(
                    "{}\n{}",
                    info.command_result.output, info.command_result.error
                ),
            };
            self.traced.push(&traced).await?;
            info!(
                "Crash confirmed under tracer for {} | {}",
                task_id, crash.harness_name
            );
        } else {
            info!(
                "Crash did not reproduce under tracer for {} | {}, dropping",
                task_id, crash.harness_name
            );
        }
        self.crashes.ack(&item.item_id).await?;
        Ok(())
    }
}

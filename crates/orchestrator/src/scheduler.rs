//! The scheduler foreground loop.
//!
//! Drains fresh build outputs into harness weight entries (so fuzzer
//! workers start drawing work), resets weights to the initial prior when a
//! new fuzzer build lands, and zeroes the weights of cancelled or expired
//! tasks so every downstream consumer stops drawing them.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error, info};

use buttercup_common::challenge_task::ChallengeTask;
use buttercup_common::constants::{group_names, queue_names};
use buttercup_common::maps::HarnessWeights;
use buttercup_common::messages::{BuildOutput, BuildType, WeightedHarness};
use buttercup_common::queue::{QueueFactory, ReliableQueue};
use buttercup_common::{NodeLocal, TaskRegistry};

/// Weight given to a harness when its fuzzer build first lands. The
/// external weighting module refines it from coverage later; this core
/// only ever writes the prior and zero.
pub const INITIAL_HARNESS_WEIGHT: f64 = 1.0;

pub struct Scheduler {
    registry: TaskRegistry,
    harness_weights: HarnessWeights,
    build_outputs: ReliableQueue<BuildOutput>,
    node_local: NodeLocal,
    poll_interval: Duration,
}

impl Scheduler {
    pub async fn new(
        conn: redis::aio::ConnectionManager,
        node_local: NodeLocal,
    ) -> Result<Self> {
        let factory = QueueFactory::new(conn.clone());
        let build_outputs = factory
            .create(queue_names::BUILD_OUTPUTS, group_names::SCHEDULER)
            .await?;
        Ok(Self {
            registry: TaskRegistry::new(conn.clone()),
            harness_weights: HarnessWeights::new(conn),
            build_outputs,
            node_local,
            poll_interval: Duration::from_secs(1),
        })
    }

    /// Run until shutdown is signalled.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<()> {
        info!("Scheduler foreground loop started");
        loop {
            if *shutdown.borrow() {
                info!("Scheduler shutting down");
                return Ok(());
            }
            if let Err(e) = self.tick().await {
                error!("Scheduler iteration failed: {e:#}");
            }
            tokio::select! {
                () = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// One scheduling pass: drain build outputs, then suppress dead tasks.
    pub async fn tick(&self) -> Result<()> {
        let cancelled = self.registry.cancelled_ids().await?;
        while self.drain_one_build_output(&cancelled).await? {}
        self.suppress_dead_tasks(&cancelled).await?;
        Ok(())
    }

    async fn drain_one_build_output(&self, cancelled: &HashSet<String>) -> Result<bool> {
        let Some(item) = self.build_outputs.pop().await? else {
            return Ok(false);
        };
        let output = &item.deserialized;

        if self
            .registry
            .should_stop_processing(output.task_id.as_str(), Some(cancelled))
            .await?
        {
            debug!(
                "Dropping build output for dead task {}",
                output.task_id
            );
            self.build_outputs.ack(&item.item_id).await?;
            return Ok(true);
        }

        // Only fuzzer builds carry schedulable harnesses.
        if output.build_type == BuildType::Fuzzer {
            if let Err(e) = self.seed_harness_weights(output).await {
                error!(
                    "Failed to seed harness weights for {}: {e:#}",
                    output.task_id
                );
                // Leave unacked; redelivery retries once the build is
                // stageable.
                return Ok(true);
            }
        }
        self.build_outputs.ack(&item.item_id).await?;
        Ok(true)
    }

    /// Discover the harness binaries of a fresh fuzzer build and reset
    /// their weights to the initial prior.
    async fn seed_harness_weights(&self, output: &BuildOutput) -> Result<()> {
        let local_build = self.node_local.local_path(&output.task_dir);
        self.node_local
            .remote_archive_to_dir(&local_build)
            .context("staging fuzzer build")?;
        let task = ChallengeTask::new(local_build);
        let meta = task.task_meta()?;

        let harnesses = task.list_harnesses()?;
        info!(
            "Build output for {} carries {} harnesses",
            output.task_id,
            harnesses.len()
        );
        for harness_name in harnesses {
            self.harness_weights
                .push_harness(&WeightedHarness {
                    task_id: output.task_id.clone(),
                    package_name: meta.project_name.clone(),
                    harness_name,
                    weight: INITIAL_HARNESS_WEIGHT,
                })
                .await?;
        }
        Ok(())
    }

    /// Zero the weights of tasks that are cancelled or expired.
    async fn suppress_dead_tasks(&self, cancelled: &HashSet<String>) -> Result<()> {
        for task in self.registry.all_tasks().await? {
            let dead = cancelled.contains(&task.task_id.to_lowercase())
                || TaskRegistry::is_expired(&task, 0);
            if dead {
                let suppressed = self.harness_weights.suppress_task(&task.task_id).await?;
                if suppressed > 0 {
                    info!(
                        "Suppressed {} harnesses of dead task {}",
                        suppressed, task.task_id
                    );
                }
            }
        }
        Ok(())
    }
}

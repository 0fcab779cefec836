//! PoV-against-patch reproduction.
//!
//! Pops one pending reproduction request at a time, replays the PoV
//! against the patched build and records the outcome with a compare-and-
//! set, so concurrent reproducers resolve each request at most once.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use buttercup_common::challenge_task::ChallengeTask;
use buttercup_common::maps::BuildMap;
use buttercup_common::messages::BuildType;
use buttercup_common::pov_status::PoVReproduceStatus;
use buttercup_common::{NodeLocal, TaskRegistry};

use crate::background::BackgroundTask;

pub struct POVReproductionTask {
    pov_status: PoVReproduceStatus,
    registry: TaskRegistry,
    builds: BuildMap,
    node_local: NodeLocal,
    python_path: String,
    interval: Duration,
}

impl POVReproductionTask {
    pub fn new(
        conn: redis::aio::ConnectionManager,
        node_local: NodeLocal,
        python_path: String,
    ) -> Self {
        Self {
            pov_status: PoVReproduceStatus::new(conn.clone()),
            registry: TaskRegistry::new(conn.clone()),
            builds: BuildMap::new(conn),
            node_local,
            python_path,
            interval: Duration::from_millis(100),
        }
    }
}

#[async_trait]
impl BackgroundTask for POVReproductionTask {
    fn name(&self) -> &str {
        "pov-reproduction"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&mut self) -> Result<bool> {
        let Some(entry) = self.pov_status.get_one_pending().await? else {
            return Ok(false);
        };

        if self
            .registry
            .should_stop_processing(entry.task_id.as_str(), None)
            .await?
        {
            info!(
                "Task {} is cancelled or expired, will not reproduce PoV",
                entry.task_id
            );
            if !self.pov_status.mark_expired(&entry).await? {
                debug!(
                    "Failed to mark PoV as expired for task {} - \
                     item was not in pending state (another worker might have marked it)",
                    entry.task_id
                );
            }
            return Ok(false);
        }

        info!(
            "Reproducing PoV for {} | {} | {}",
            entry.task_id,
            entry.harness_name,
            entry.pov_path.display()
        );

        // Data-not-ready: the patched build may still be in flight.
        let Some(patched_build) = self
            .builds
            .get_build_from_san(
                &entry.task_id,
                BuildType::Patch,
                &entry.sanitizer,
                &entry.internal_patch_id,
            )
            .await?
        else {
            warn!(
                "No patched build output found for task {}. Will retry later.",
                entry.task_id
            );
            return Ok(false);
        };

        let local_pov = self
            .node_local
            .make_locally_available(&entry.pov_path)
            .context("staging PoV input")?;
        let local_build = self.node_local.local_path(&patched_build.task_dir);
        self.node_local
            .remote_archive_to_dir(&local_build)
            .context("staging patched build")?;

        let task = ChallengeTask::new(local_build).with_python_path(&self.python_path);
        let scratch = self.node_local.scratch_dir()?;
        let rw = task.rw_copy(scratch.path())?;
        let reproduction = rw
            .task()
            .reproduce_pov(&entry.harness_name, &local_pov)
            .await?;

        if !reproduction.did_run() {
            warn!(
                "Reproduce did not run for task {}. Will retry later. Output: {}",
                entry.task_id, reproduction.command_result.error
            );
            return Ok(false);
        }

        debug!(
            "stdout: {}, stderr: {} for task {}",
            reproduction.command_result.output,
            reproduction.command_result.error,
            entry.task_id
        );
        info!(
            "PoV {} for task {} crashed: {}",
            entry.pov_path.display(),
            entry.task_id,
            reproduction.did_crash()
        );

        let marked = if reproduction.did_crash() {
            self.pov_status.mark_non_mitigated(&entry).await?
        } else {
            self.pov_status.mark_mitigated(&entry).await?
        };
        if !marked {
            debug!(
                "Failed to record PoV outcome for task {} - \
                 item was not in pending state",
                entry.task_id
            );
        }
        Ok(true)
    }
}

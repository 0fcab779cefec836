//! Scratch cleanup: reclaim the scratch space of long-expired tasks.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use buttercup_common::TaskRegistry;

use crate::background::BackgroundTask;

pub struct ScratchCleanupTask {
    registry: TaskRegistry,
    scratch_dir: PathBuf,
    interval: Duration,
    delete_old_tasks_delta_seconds: i64,
}

impl ScratchCleanupTask {
    pub fn new(
        registry: TaskRegistry,
        scratch_dir: PathBuf,
        delete_old_tasks_delta_seconds: i64,
    ) -> Self {
        Self {
            registry,
            scratch_dir,
            interval: Duration::from_secs(60),
            delete_old_tasks_delta_seconds,
        }
    }
}

#[async_trait]
impl BackgroundTask for ScratchCleanupTask {
    fn name(&self) -> &str {
        "scratch-cleanup"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&mut self) -> Result<bool> {
        if !self.scratch_dir.exists() {
            warn!(
                "Scratch directory {} does not exist",
                self.scratch_dir.display()
            );
            return Ok(false);
        }

        debug!(
            "Checking for old tasks in scratch directory {}",
            self.scratch_dir.display()
        );
        let mut did_delete = false;
        for task in self.registry.all_tasks().await? {
            // Only reclaim once the task has been expired for the grace
            // period, not merely close to its deadline.
            if !TaskRegistry::is_expired(&task, -self.delete_old_tasks_delta_seconds) {
                continue;
            }
            let task_dir = self.scratch_dir.join(&task.task_id);
            if !task_dir.is_dir() {
                continue;
            }
            info!("Deleting scratch space for expired task {}", task.task_id);
            if let Err(e) = std::fs::remove_dir_all(&task_dir) {
                warn!(
                    "Failed to delete scratch space for task {}: {}",
                    task.task_id, e
                );
                continue;
            }
            did_delete = true;
        }
        Ok(did_delete)
    }
}

#[cfg(test)]
mod tests {
    use buttercup_common::messages::Task;
    use buttercup_common::TaskRegistry;
    use chrono::Utc;

    fn task_expired_for(seconds: i64) -> Task {
        Task {
            task_id: "t1".into(),
            deadline: Utc::now().timestamp_millis() - seconds * 1000,
            ..Task::default()
        }
    }

    #[test]
    fn grace_period_holds_back_fresh_expiries() {
        // Expired five minutes ago: not yet collectable with a 30 minute grace
        let fresh = task_expired_for(300);
        assert!(!TaskRegistry::is_expired(&fresh, -1800));

        // Expired an hour ago: collectable
        let old = task_expired_for(3600);
        assert!(TaskRegistry::is_expired(&old, -1800));
    }
}

//! Crash intake for fuzzer workers.
//!
//! A worker that sees a crashing input calls `submit_crash`. The input is
//! fingerprinted, dropped if the token is already known or the input is
//! oversized, and otherwise filed in the crash directory and pushed onto
//! the crashes queue for the tracer.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info};

use buttercup_common::constants::MAX_POV_SIZE;
use buttercup_common::corpus::CrashDir;
use buttercup_common::messages::{BuildOutput, Crash};
use buttercup_common::queue::ReliableQueue;
use buttercup_common::stacktrace::{crash_token, CrashSet};
use buttercup_common::NodeLocal;

/// Outcome of a crash submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeOutcome {
    /// New crash, queued for tracing.
    Accepted,
    /// The token was already known.
    Duplicate,
    /// The input exceeds the PoV size cap.
    Oversized,
}

pub struct CrashIntake {
    crash_set: CrashSet,
    queue: ReliableQueue<Crash>,
    node_local: NodeLocal,
    tasks_storage: String,
    max_pov_size: u64,
}

impl CrashIntake {
    pub fn new(
        crash_set: CrashSet,
        queue: ReliableQueue<Crash>,
        node_local: NodeLocal,
        tasks_storage: String,
    ) -> Self {
        Self {
            crash_set,
            queue,
            node_local,
            tasks_storage,
            max_pov_size: MAX_POV_SIZE,
        }
    }

    pub fn with_max_pov_size(mut self, max_pov_size: u64) -> Self {
        self.max_pov_size = max_pov_size;
        self
    }

    /// Submit one crashing input found against `target`.
    pub async fn submit_crash(
        &self,
        target: &BuildOutput,
        harness_name: &str,
        input_path: &Path,
        stacktrace: &str,
    ) -> Result<IntakeOutcome> {
        let size = std::fs::metadata(input_path)
            .with_context(|| format!("stat {}", input_path.display()))?
            .len();
        if size > self.max_pov_size {
            debug!(
                "Crash input {} is {} bytes, over the {} byte cap",
                input_path.display(),
                size,
                self.max_pov_size
            );
            return Ok(IntakeOutcome::Oversized);
        }

        let token = crash_token(stacktrace);
        if self.crash_set.add(&target.task_id, &token).await? {
            debug!(
                "Crash token {} already known for task {}",
                &token[..12],
                target.task_id
            );
            return Ok(IntakeOutcome::Duplicate);
        }

        let crash_dir = CrashDir::new(
            self.node_local.clone(),
            &self.tasks_storage,
            &target.task_id,
            harness_name,
        )?;
        let stored = crash_dir.store(&token, &target.sanitizer, input_path)?;

        let crash = Crash {
            target: target.clone(),
            harness_name: harness_name.to_string(),
            crash_input_path: stored,
            stacktrace: stacktrace.to_string(),
        };
        self.queue.push(&crash).await?;
        info!(
            "Accepted new crash for {} | {} (token {})",
            target.task_id,
            harness_name,
            &token[..12]
        );
        Ok(IntakeOutcome::Accepted)
    }
}

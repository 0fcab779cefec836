//! Tests node: run the task's functionality tests against the patched
//! challenge. A task without a tests script passes by definition.

use anyhow::{Context, Result};
use tracing::{info, warn};

use buttercup_common::challenge_task::ChallengeTask;
use buttercup_common::constants::ADDRESS_SANITIZER;

use crate::machine::{AttemptUpdate, NodeDecision, NodeId, PatcherWorkflow, StateDelta};
use crate::state::{PatchStatus, PatcherState};

pub async fn run(workflow: &PatcherWorkflow, state: &PatcherState) -> Result<NodeDecision> {
    let attempt = state
        .latest_attempt()
        .context("tests node entered without a patch attempt")?;

    // Any sanitizer's build carries the same patched sources; prefer the
    // address build.
    let built_dir = attempt
        .built_challenges
        .get(ADDRESS_SANITIZER)
        .or_else(|| attempt.built_challenges.values().next())
        .context("tests node entered without built challenges")?
        .clone();

    let task = ChallengeTask::new(built_dir).with_python_path(&workflow.config.python_path);
    match task.run_tests().await? {
        None => {
            info!(
                "Task {} ships no tests script, accepting attempt {}",
                state.task_id, attempt.id
            );
            Ok(NodeDecision::with_updates(
                NodeId::PatchValidation,
                StateDelta {
                    update_latest: Some(AttemptUpdate {
                        tests_passed: Some(true),
                        ..AttemptUpdate::default()
                    }),
                    ..StateDelta::default()
                },
            ))
        }
        Some(result) if result.success => {
            info!(
                "Tests passed for task {} attempt {}",
                state.task_id, attempt.id
            );
            Ok(NodeDecision::with_updates(
                NodeId::PatchValidation,
                StateDelta {
                    update_latest: Some(AttemptUpdate {
                        tests_passed: Some(true),
                        tests_output: Some((result.output, result.error)),
                        ..AttemptUpdate::default()
                    }),
                    ..StateDelta::default()
                },
            ))
        }
        Some(result) => {
            warn!(
                "Tests failed for task {} attempt {}",
                state.task_id, attempt.id
            );
            Ok(NodeDecision::with_updates(
                NodeId::Reflection,
                StateDelta {
                    update_latest: Some(AttemptUpdate {
                        status: Some(PatchStatus::TestsFailed),
                        tests_passed: Some(false),
                        tests_output: Some((result.output, result.error)),
                        ..AttemptUpdate::default()
                    }),
                    ..StateDelta::default()
                },
            ))
        }
    }
}

//! Reflection node: decide what to do after a failed attempt.
//!
//! Terminal conditions first (success, retry budget spent), then
//! escalation on repeated same-status failures, then a best-effort model
//! analysis that becomes guidance for the next attempt. Routing itself is
//! deterministic by failure status.

use std::fmt::Write as _;

use anyhow::Result;
use tracing::{info, warn};

use crate::machine::{AttemptUpdate, NodeDecision, NodeId, PatcherWorkflow, StateDelta};
use crate::state::{PatchStatus, PatcherState};

const SYSTEM_MSG: &str =
    "You are the reflection engine of an autonomous vulnerability patching system. \
     Analyze why the latest patch attempt failed and give concrete guidance.";

pub async fn run(workflow: &PatcherWorkflow, state: &PatcherState) -> Result<NodeDecision> {
    let config = &workflow.config;
    let Some(latest) = state.latest_attempt() else {
        return Ok(NodeDecision::goto(NodeId::End));
    };

    if latest.status == PatchStatus::Success {
        return Ok(NodeDecision::goto(NodeId::End));
    }
    if state.patch_attempts.len() >= config.max_patch_retries {
        info!(
            "Giving up on task {} after {} patch attempts",
            state.task_id,
            state.patch_attempts.len()
        );
        return Ok(NodeDecision::goto(NodeId::End));
    }

    // The same failure over and over means the approach is wrong, not the
    // patch text.
    if state.consecutive_failures_of_latest_status() > config.max_last_failure_retries {
        info!(
            "Task {} hit {:?} repeatedly, escalating to root cause analysis",
            state.task_id, latest.status
        );
        return Ok(NodeDecision::with_updates(
            NodeId::RootCauseAnalysis,
            StateDelta {
                guidance: Some(Some(format!(
                    "The last {} attempts all failed with {:?}. \
                     Reconsider the root cause before patching again.",
                    state.consecutive_failures_of_latest_status(),
                    latest.status
                ))),
                ..StateDelta::default()
            },
        ));
    }

    let mut prompt = String::new();
    writeln!(prompt, "The latest patch attempt failed with {:?}.", latest.status)?;
    writeln!(prompt, "\n<patch>\n{}\n</patch>", latest.patch_text)?;
    writeln!(prompt, "\n<failure_data>\n{}\n</failure_data>", failure_data(latest.status, state))?;
    writeln!(prompt, "\nExplain the failure and how the next attempt should differ.")?;

    let analysis = match workflow.collaborators.llm.complete(SYSTEM_MSG, &prompt).await {
        Ok(analysis) => analysis,
        Err(e) => {
            warn!("Reflection analysis failed, routing without guidance: {}", e);
            default_guidance(latest.status)
        }
    };

    let goto = route_for(latest.status);
    Ok(NodeDecision::with_updates(
        goto,
        StateDelta {
            guidance: Some(Some(analysis.clone())),
            update_latest: Some(AttemptUpdate {
                analysis: Some(analysis),
                ..AttemptUpdate::default()
            }),
            ..StateDelta::default()
        },
    ))
}

/// Deterministic routing by failure kind: a PoV that still fires means
/// the diagnosis was wrong; everything else means the patch was wrong.
pub(crate) fn route_for(status: PatchStatus) -> NodeId {
    match status {
        PatchStatus::PovFailed => NodeId::RootCauseAnalysis,
        _ => NodeId::CreatePatch,
    }
}

fn failure_data(status: PatchStatus, state: &PatcherState) -> String {
    let Some(latest) = state.latest_attempt() else {
        return String::new();
    };
    match status {
        PatchStatus::CreationFailed => {
            "The model output did not contain a parseable unified diff.".to_string()
        }
        PatchStatus::Duplicated => {
            "The patch duplicates an earlier failed attempt.".to_string()
        }
        PatchStatus::ApplyFailed | PatchStatus::BuildFailed => {
            format!("{}\n{}", latest.build_stdout, latest.build_stderr)
        }
        PatchStatus::PovFailed => {
            format!("{}\n{}", latest.pov_stdout, latest.pov_stderr)
        }
        PatchStatus::TestsFailed => {
            format!("{}\n{}", latest.tests_stdout, latest.tests_stderr)
        }
        PatchStatus::ValidationFailed => latest
            .analysis
            .clone()
            .unwrap_or_else(|| "The patch failed validation.".to_string()),
        PatchStatus::Pending | PatchStatus::Success => String::new(),
    }
}

fn default_guidance(status: PatchStatus) -> String {
    match status {
        PatchStatus::CreationFailed => {
            "Answer with a single unified diff and nothing else.".to_string()
        }
        PatchStatus::Duplicated => "Take a different approach than the previous patch.".to_string(),
        PatchStatus::ApplyFailed => {
            "The diff did not apply; regenerate it against the unmodified sources.".to_string()
        }
        PatchStatus::BuildFailed => "Fix the compilation errors in the patch.".to_string(),
        PatchStatus::PovFailed => {
            "The vulnerability still reproduces; the fix missed the defect.".to_string()
        }
        PatchStatus::TestsFailed => {
            "The patch broke functionality; preserve existing behavior.".to_string()
        }
        PatchStatus::ValidationFailed => {
            "Patch only project source files, never fuzzer or harness code.".to_string()
        }
        PatchStatus::Pending | PatchStatus::Success => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pov_failures_escalate_to_root_cause() {
        assert_eq!(route_for(PatchStatus::PovFailed), NodeId::RootCauseAnalysis);
    }

    #[test]
    fn other_failures_retry_patch_creation() {
        for status in [
            PatchStatus::CreationFailed,
            PatchStatus::Duplicated,
            PatchStatus::ApplyFailed,
            PatchStatus::BuildFailed,
            PatchStatus::TestsFailed,
            PatchStatus::ValidationFailed,
        ] {
            assert_eq!(route_for(status), NodeId::CreatePatch);
        }
    }
}

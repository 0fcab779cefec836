//! Patch validation node: hygiene checks on an otherwise verified patch.
//!
//! (a) Patched-code validity: a patch that touches fuzzer or harness code
//! "fixes" the detector, not the project. (b) Language validity: every
//! modified file must still be written in the project's declared
//! language. Both failures route to reflection; neither invalidates the
//! attempt's build/PoV/tests verdicts.

use anyhow::{Context, Result};
use tracing::{info, warn};

use buttercup_common::constants::ADDRESS_SANITIZER;

use crate::machine::{AttemptUpdate, NodeDecision, NodeId, PatcherWorkflow, StateDelta};
use crate::state::{PatchStatus, PatcherState};
use crate::upatch;

pub async fn run(workflow: &PatcherWorkflow, state: &PatcherState) -> Result<NodeDecision> {
    let attempt = state
        .latest_attempt()
        .context("validation node entered without a patch attempt")?;
    let modified = upatch::modified_files(&attempt.patch_text);

    for path in &modified {
        match workflow.collaborators.codequery.is_harness_path(path).await {
            Ok(true) => {
                warn!(
                    "Patch attempt {} modifies harness code {}, rejecting",
                    attempt.id, path
                );
                return Ok(validation_failed(format!(
                    "patch modifies fuzzer/harness code: {path}"
                )));
            }
            Ok(false) => {}
            Err(e) => {
                // An unreachable code index must not pass a bad patch.
                warn!("Harness-path check failed for {}: {}", path, e);
                return Ok(validation_failed(format!(
                    "could not verify patched path {path}: {e}"
                )));
            }
        }
    }

    let language = workflow
        .collaborators
        .codequery
        .project_language()
        .await
        .context("querying project language")?;
    let source_root = attempt
        .built_challenges
        .get(ADDRESS_SANITIZER)
        .or_else(|| attempt.built_challenges.values().next())
        .map(|dir| dir.join("src"));
    if let Some(source_root) = source_root {
        for path in &modified {
            let on_disk = source_root.join(path);
            if !on_disk.exists() {
                continue;
            }
            let matches = workflow
                .collaborators
                .language_validator
                .matches_language(&language, &on_disk)
                .await?;
            if !matches {
                warn!(
                    "Patched file {} is not valid {} anymore, rejecting",
                    path, language
                );
                return Ok(validation_failed(format!(
                    "patched file {path} does not match project language {language}"
                )));
            }
        }
    }

    info!(
        "Patch attempt {} validated for task {}",
        attempt.id, state.task_id
    );
    Ok(NodeDecision::with_updates(
        NodeId::End,
        StateDelta {
            update_latest: Some(AttemptUpdate {
                status: Some(PatchStatus::Success),
                ..AttemptUpdate::default()
            }),
            ..StateDelta::default()
        },
    ))
}

fn validation_failed(reason: String) -> NodeDecision {
    NodeDecision::with_updates(
        NodeId::Reflection,
        StateDelta {
            update_latest: Some(AttemptUpdate {
                status: Some(PatchStatus::ValidationFailed),
                analysis: Some(reason),
                ..AttemptUpdate::default()
            }),
            ..StateDelta::default()
        },
    )
}

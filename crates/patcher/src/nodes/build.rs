//! Build node: apply the latest patch and rebuild the fuzzers for every
//! configured sanitizer, in parallel.
//!
//! The first failing sanitizer cancels its siblings, releases the
//! directories already built, and routes to reflection with APPLY_FAILED
//! or BUILD_FAILED. Full success records one built challenge directory
//! per sanitizer on the attempt.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tracing::{info, warn};

use buttercup_common::challenge_task::ChallengeTask;
use buttercup_common::messages::BuildType;

use crate::machine::{AttemptUpdate, NodeDecision, NodeId, PatcherWorkflow, StateDelta};
use crate::state::{PatchStatus, PatcherState};

enum BuildFailure {
    Apply { stderr: String },
    Build { stdout: String, stderr: String },
}

pub async fn run(workflow: &PatcherWorkflow, state: &PatcherState) -> Result<NodeDecision> {
    let attempt = state
        .latest_attempt()
        .context("build node entered without a patch attempt")?;
    let attempt_dir = workflow
        .config
        .work_dir
        .join(format!("{}-{}", state.task_id, state.internal_patch_id))
        .join(format!("attempt-{}", attempt.id));

    let mut builds = futures::stream::iter(workflow.config.sanitizers.iter().map(|sanitizer| {
        build_one(
            workflow,
            state,
            &attempt.patch_text,
            sanitizer.clone(),
            attempt_dir.join(sanitizer),
        )
    }))
    .buffer_unordered(workflow.config.max_concurrency);

    let mut built: BTreeMap<String, PathBuf> = BTreeMap::new();
    let mut combined_stdout = String::new();
    while let Some(result) = builds.next().await {
        match result? {
            Ok((sanitizer, dir, stdout)) => {
                combined_stdout.push_str(&stdout);
                built.insert(sanitizer, dir);
            }
            Err(failure) => {
                // Dropping the stream cancels the sibling builds.
                drop(builds);
                for dir in built.values() {
                    let _ = std::fs::remove_dir_all(dir);
                }
                let (status, stdout, stderr) = match failure {
                    BuildFailure::Apply { stderr } => {
                        (PatchStatus::ApplyFailed, String::new(), stderr)
                    }
                    BuildFailure::Build { stdout, stderr } => {
                        (PatchStatus::BuildFailed, stdout, stderr)
                    }
                };
                warn!(
                    "Patch attempt {} failed with {:?} for task {}",
                    attempt.id, status, state.task_id
                );
                return Ok(NodeDecision::with_updates(
                    NodeId::Reflection,
                    StateDelta {
                        update_latest: Some(AttemptUpdate {
                            status: Some(status),
                            build_output: Some((stdout, stderr)),
                            build_succeeded: Some(false),
                            ..AttemptUpdate::default()
                        }),
                        ..StateDelta::default()
                    },
                ));
            }
        }
    }

    info!(
        "Patch attempt {} built for {} sanitizers",
        attempt.id,
        built.len()
    );
    Ok(NodeDecision::with_updates(
        NodeId::RunPov,
        StateDelta {
            update_latest: Some(AttemptUpdate {
                built_challenges: Some(built),
                build_output: Some((combined_stdout, String::new())),
                build_succeeded: Some(true),
                ..AttemptUpdate::default()
            }),
            ..StateDelta::default()
        },
    ))
}

/// Build one sanitizer variant of the patched challenge. Returns the
/// committed directory on success.
async fn build_one(
    workflow: &PatcherWorkflow,
    state: &PatcherState,
    patch_text: &str,
    sanitizer: String,
    sanitizer_work_dir: PathBuf,
) -> Result<std::result::Result<(String, PathBuf, String), BuildFailure>> {
    let collaborators = &workflow.collaborators;
    let fuzzer_build = collaborators
        .builds
        .get_build_from_san(&state.task_id, BuildType::Fuzzer, &sanitizer, "")
        .await?
        .with_context(|| format!("no fuzzer build for sanitizer {sanitizer}"))?;

    let local_build = collaborators.node_local.local_path(&fuzzer_build.task_dir);
    collaborators
        .node_local
        .remote_archive_to_dir(&local_build)
        .context("staging fuzzer build")?;
    std::fs::create_dir_all(&sanitizer_work_dir)?;

    let task = ChallengeTask::new(local_build)
        .with_python_path(&workflow.config.python_path);
    let rw = task.rw_copy(&sanitizer_work_dir)?;

    let mut patch_file = tempfile::NamedTempFile::new_in(&sanitizer_work_dir)?;
    patch_file.write_all(patch_text.as_bytes())?;
    patch_file.flush()?;
    if !rw.task().apply_patch_file(patch_file.path()).await? {
        return Ok(Err(BuildFailure::Apply {
            stderr: format!("patch did not apply for sanitizer {sanitizer}"),
        }));
    }

    let result = rw
        .task()
        .build_fuzzers(&fuzzer_build.engine, &sanitizer, false)
        .await?;
    if !result.success {
        return Ok(Err(BuildFailure::Build {
            stdout: result.output,
            stderr: result.error,
        }));
    }

    let committed = rw.commit()?;
    Ok(Ok((sanitizer, committed, result.output)))
}

//! PoV replay node.
//!
//! Replays every PoV variant against the freshly patched builds: the
//! original crashes plus related crash-directory inputs sharing a
//! (pov token, sanitizer) pair, capped per pair. The sweep runs in
//! parallel under a global wall-clock cap.

use std::path::PathBuf;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tracing::{debug, info, warn};

use buttercup_common::challenge_task::ChallengeTask;
use buttercup_common::constants::MAX_POV_VARIANTS_PER_TOKEN_SANITIZER;
use buttercup_common::corpus::CrashDir;
use buttercup_common::stacktrace::crash_token;

use crate::machine::{AttemptUpdate, NodeDecision, NodeId, PatcherWorkflow, StateDelta};
use crate::state::{PatchStatus, PatcherState};

#[derive(Debug, Clone)]
struct PovVariant {
    harness_name: String,
    sanitizer: String,
    pov_path: PathBuf,
}

#[derive(Debug)]
struct PovRunResult {
    variant: PovVariant,
    ran: bool,
    crashed: bool,
    stdout: String,
    stderr: String,
}

pub async fn run(workflow: &PatcherWorkflow, state: &PatcherState) -> Result<NodeDecision> {
    let attempt = state
        .latest_attempt()
        .context("PoV node entered without a patch attempt")?;
    let variants = collect_variants(workflow, state)?;
    if variants.is_empty() {
        warn!(
            "No PoV variants available for task {}, revisiting root cause",
            state.task_id
        );
        return Ok(NodeDecision::goto(NodeId::RootCauseAnalysis));
    }

    let built_challenges = attempt.built_challenges.clone();
    let runs = futures::stream::iter(variants.into_iter().map(|variant| {
        let built = built_challenges.get(&variant.sanitizer).cloned();
        run_variant(workflow, variant, built)
    }))
    .buffer_unordered(workflow.config.max_concurrency);

    // Global wall-clock cap over the whole sweep. Results gathered before
    // the deadline still count.
    let deadline = tokio::time::Instant::now() + workflow.config.pov_sweep_timeout();
    let mut completed: Vec<PovRunResult> = Vec::new();
    let mut timed_out = false;
    let mut runs = std::pin::pin!(runs);
    loop {
        match tokio::time::timeout_at(deadline, runs.next()).await {
            Ok(Some(result)) => completed.push(result?),
            Ok(None) => break,
            Err(_) => {
                warn!(
                    "PoV sweep exceeded {} minutes for task {}",
                    workflow.config.max_minutes_run_povs, state.task_id
                );
                timed_out = true;
                break;
            }
        }
    }

    let executed: Vec<&PovRunResult> = completed.iter().filter(|r| r.ran).collect();
    if timed_out && executed.is_empty() {
        return Ok(fail_attempt(
            String::new(),
            format!(
                "PoV sweep timed out after {} minutes with no completed run",
                workflow.config.max_minutes_run_povs
            ),
        ));
    }
    if executed.is_empty() {
        // Nothing actually executed; the patch is unjudgeable. Start over.
        warn!(
            "No PoV executed for task {} attempt {}, revisiting root cause",
            state.task_id, attempt.id
        );
        return Ok(NodeDecision::goto(NodeId::RootCauseAnalysis));
    }

    if let Some(crashing) = executed.iter().find(|r| r.crashed) {
        info!(
            "PoV {} still crashes patched task {}",
            crashing.variant.pov_path.display(),
            state.task_id
        );
        return Ok(fail_attempt(
            crashing.stdout.clone(),
            crashing.stderr.clone(),
        ));
    }

    info!(
        "All {} executed PoVs no longer crash task {} (attempt {})",
        executed.len(),
        state.task_id,
        attempt.id
    );
    Ok(NodeDecision::with_updates(
        NodeId::RunTests,
        StateDelta {
            update_latest: Some(AttemptUpdate {
                pov_fixed: Some(true),
                pov_output: Some((String::new(), String::new())),
                ..AttemptUpdate::default()
            }),
            ..StateDelta::default()
        },
    ))
}

fn fail_attempt(stdout: String, stderr: String) -> NodeDecision {
    NodeDecision::with_updates(
        NodeId::Reflection,
        StateDelta {
            update_latest: Some(AttemptUpdate {
                status: Some(PatchStatus::PovFailed),
                pov_fixed: Some(false),
                pov_output: Some((stdout, stderr)),
                ..AttemptUpdate::default()
            }),
            ..StateDelta::default()
        },
    )
}

/// The original PoVs plus related crash-dir variants per (token,
/// sanitizer), capped.
fn collect_variants(workflow: &PatcherWorkflow, state: &PatcherState) -> Result<Vec<PovVariant>> {
    let mut variants = Vec::new();
    for traced in &state.vulnerability.crashes {
        let sanitizer = traced.crash.target.sanitizer.clone();
        let harness_name = traced.crash.harness_name.clone();
        variants.push(PovVariant {
            harness_name: harness_name.clone(),
            sanitizer: sanitizer.clone(),
            pov_path: traced.crash.crash_input_path.clone(),
        });

        let token = crash_token(&traced.tracer_stacktrace);
        let crash_dir = CrashDir::new(
            workflow.collaborators.node_local.clone(),
            &workflow.config.tasks_storage,
            &state.task_id,
            &harness_name,
        )?;
        match crash_dir.list_crashes_for_token(&token, &sanitizer, true) {
            Ok(related) => {
                for path in related
                    .into_iter()
                    .take(MAX_POV_VARIANTS_PER_TOKEN_SANITIZER)
                {
                    if path != traced.crash.crash_input_path {
                        variants.push(PovVariant {
                            harness_name: harness_name.clone(),
                            sanitizer: sanitizer.clone(),
                            pov_path: path,
                        });
                    }
                }
            }
            Err(e) => {
                debug!("Failed to list PoV variants for token {}: {}", token, e);
            }
        }
    }
    Ok(variants)
}

async fn run_variant(
    workflow: &PatcherWorkflow,
    variant: PovVariant,
    built_challenge: Option<PathBuf>,
) -> Result<PovRunResult> {
    let Some(built_dir) = built_challenge else {
        // No build for this sanitizer; the variant cannot execute.
        return Ok(PovRunResult {
            variant,
            ran: false,
            crashed: false,
            stdout: String::new(),
            stderr: "no built challenge for sanitizer".to_string(),
        });
    };

    let pov = workflow
        .collaborators
        .node_local
        .make_locally_available(&variant.pov_path)
        .context("staging PoV input")?;
    let task =
        ChallengeTask::new(built_dir).with_python_path(&workflow.config.python_path);
    let reproduction = task.reproduce_pov(&variant.harness_name, &pov).await?;
    Ok(PovRunResult {
        variant,
        ran: reproduction.did_run(),
        crashed: reproduction.did_crash(),
        stdout: reproduction.command_result.output,
        stderr: reproduction.command_result.error,
    })
}

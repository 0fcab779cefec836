//! Patch creation node.
//!
//! Asks the model for a unified diff. Unparseable answers and duplicates
//! of earlier attempts become failed attempts routed through reflection;
//! a fresh parseable diff becomes a pending attempt headed for the build.

use std::fmt::Write as _;

use anyhow::Result;
use tracing::{info, warn};

use crate::machine::{NodeDecision, NodeId, PatcherWorkflow, StateDelta};
use crate::state::{PatchAttempt, PatchStatus, PatcherState};
use crate::upatch;

const SYSTEM_MSG: &str =
    "You are the patch engineer of an autonomous vulnerability patching system. \
     Answer with a unified diff against the project sources.";

pub async fn run(workflow: &PatcherWorkflow, state: &PatcherState) -> Result<NodeDecision> {
    let mut prompt = String::new();
    writeln!(
        prompt,
        "Write a minimal source patch fixing the vulnerability. \
         Do not modify fuzzer or harness code."
    )?;
    if let Some(root_cause) = &state.root_cause {
        writeln!(prompt, "\n<root_cause>\n{root_cause}\n</root_cause>")?;
    }
    for snippet in &state.relevant_code_snippets {
        writeln!(
            prompt,
            "\n<code_snippet path=\"{}\" lines=\"{}-{}\">\n{}\n</code_snippet>",
            snippet.file_path, snippet.start_line, snippet.end_line, snippet.content
        )?;
    }
    if let Some(latest) = state.latest_attempt() {
        if let Some(analysis) = &latest.analysis {
            writeln!(
                prompt,
                "\n<previous_attempt_analysis>\n{analysis}\n</previous_attempt_analysis>"
            )?;
        }
    }
    if let Some(guidance) = &state.guidance {
        writeln!(prompt, "\n<guidance>\n{guidance}\n</guidance>")?;
    }

    let next_id = state.patch_attempts.len();
    let answer = match workflow.collaborators.llm.complete(SYSTEM_MSG, &prompt).await {
        Ok(answer) => answer,
        Err(e) => {
            warn!("Patch creation failed: {}", e);
            return Ok(failed_attempt(next_id, String::new()));
        }
    };

    let patch = match upatch::extract_patch(&answer) {
        Ok(patch) => patch,
        Err(e) => {
            warn!("Patch output was not a usable diff: {}", e);
            return Ok(failed_attempt(next_id, answer));
        }
    };

    if state.is_duplicate_patch(&upatch::normalize_patch(&patch)) {
        info!("Generated patch duplicates a prior attempt");
        return Ok(NodeDecision::with_updates(
            NodeId::Reflection,
            StateDelta {
                new_attempt: Some(PatchAttempt::new(next_id, patch, PatchStatus::Duplicated)),
                guidance: Some(None),
                ..StateDelta::default()
            },
        ));
    }

    info!(
        "Created patch attempt {} touching {:?}",
        next_id,
        upatch::modified_files(&patch)
    );
    Ok(NodeDecision::with_updates(
        NodeId::BuildPatch,
        StateDelta {
            new_attempt: Some(PatchAttempt::new(next_id, patch, PatchStatus::Pending)),
            guidance: Some(None),
            ..StateDelta::default()
        },
    ))
}

fn failed_attempt(id: usize, raw_answer: String) -> NodeDecision {
    NodeDecision::with_updates(
        NodeId::Reflection,
        StateDelta {
            new_attempt: Some(PatchAttempt::new(
                id,
                raw_answer,
                PatchStatus::CreationFailed,
            )),
            guidance: Some(None),
            ..StateDelta::default()
        },
    )
}

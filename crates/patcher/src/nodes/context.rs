//! Context retriever node: fulfill outstanding code-snippet requests via
//! the code-query collaborator, then return to whichever node asked.

use anyhow::Result;
use tracing::{debug, warn};

use crate::machine::{NodeDecision, NodeId, PatcherWorkflow, StateDelta};
use crate::state::PatcherState;

/// Definitions fetched per request; more rarely helps the model.
const MAX_DEFINITIONS_PER_REQUEST: usize = 3;

pub async fn run(workflow: &PatcherWorkflow, state: &PatcherState) -> Result<NodeDecision> {
    let mut snippets = Vec::new();
    for request in &state.snippet_requests {
        match workflow
            .collaborators
            .codequery
            .find_definitions(&request.identifier, request.path_hint.as_deref())
            .await
        {
            Ok(found) => {
                debug!(
                    "Code query for '{}' returned {} definitions",
                    request.identifier,
                    found.len()
                );
                snippets.extend(found.into_iter().take(MAX_DEFINITIONS_PER_REQUEST));
            }
            Err(e) => {
                // A missing snippet degrades the prompt, nothing more.
                warn!("Code query for '{}' failed: {}", request.identifier, e);
            }
        }
    }

    // Drop snippets already in context so repeated requests don't bloat
    // the prompt.
    let fresh: Vec<_> = snippets
        .into_iter()
        .filter(|s| !state.relevant_code_snippets.contains(s))
        .collect();

    let goto = state
        .execution_info
        .prev_node
        .unwrap_or(NodeId::CreatePatch);
    Ok(NodeDecision::with_updates(
        goto,
        StateDelta {
            add_snippets: fresh,
            snippet_requests: Some(Vec::new()),
            ..StateDelta::default()
        },
    ))
}

//! Root-cause analysis node.
//!
//! Asks the model to explain the crash from the tracer stack trace and the
//! snippets gathered so far. The answer may embed `<code_request>` tags
//! naming definitions the model wants to read; those route the workflow
//! through the context retriever before patch creation.

use std::fmt::Write as _;
use std::sync::OnceLock;

use anyhow::Result;
use regex::Regex;
use tracing::{debug, warn};

use crate::machine::{NodeDecision, NodeId, PatcherWorkflow, StateDelta};
use crate::state::{CodeSnippetRequest, PatcherState};

const SYSTEM_MSG: &str =
    "You are the root-cause analysis engine of an autonomous vulnerability patching system.";

fn code_request_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"<code_request>\s*([^|<]+?)\s*(?:\|\s*([^<]+?)\s*)?</code_request>").unwrap()
    })
}

/// Pull `<code_request>identifier|path</code_request>` tags out of the
/// analysis.
pub(crate) fn parse_code_requests(analysis: &str) -> Vec<CodeSnippetRequest> {
    code_request_re()
        .captures_iter(analysis)
        .map(|caps| CodeSnippetRequest {
            identifier: caps[1].to_string(),
            path_hint: caps.get(2).map(|m| m.as_str().to_string()),
        })
        .collect()
}

pub async fn run(workflow: &PatcherWorkflow, state: &PatcherState) -> Result<NodeDecision> {
    let config = &workflow.config;
    let tries = state.execution_info.root_cause_analysis_tries;

    let mut prompt = String::new();
    writeln!(
        prompt,
        "Analyze the root cause of this crash and name the defect precisely."
    )?;
    for traced in &state.vulnerability.crashes {
        writeln!(prompt, "\n<stacktrace>\n{}\n</stacktrace>", traced.tracer_stacktrace)?;
    }
    for snippet in &state.relevant_code_snippets {
        writeln!(
            prompt,
            "\n<code_snippet path=\"{}\" lines=\"{}-{}\">\n{}\n</code_snippet>",
            snippet.file_path, snippet.start_line, snippet.end_line, snippet.content
        )?;
    }
    if let Some(guidance) = &state.guidance {
        writeln!(prompt, "\n<guidance>\n{guidance}\n</guidance>")?;
    }
    writeln!(
        prompt,
        "\nIf you need to read a definition, emit \
         <code_request>identifier|path_hint</code_request> tags."
    )?;

    let analysis = match workflow.collaborators.llm.complete(SYSTEM_MSG, &prompt).await {
        Ok(analysis) => analysis,
        Err(e) => {
            warn!("Root cause analysis failed: {}", e);
            // Degrade to patch creation once the retry budget is spent.
            let goto = if tries + 1 >= config.max_root_cause_analysis_retries {
                NodeId::CreatePatch
            } else {
                NodeId::RootCauseAnalysis
            };
            return Ok(NodeDecision::with_updates(
                goto,
                StateDelta {
                    inc_root_cause_tries: true,
                    ..StateDelta::default()
                },
            ));
        }
    };

    let requests = parse_code_requests(&analysis);
    debug!(
        "Root cause analysis produced {} code requests",
        requests.len()
    );
    let goto = if requests.is_empty() {
        NodeId::CreatePatch
    } else {
        NodeId::ContextRetriever
    };
    Ok(NodeDecision::with_updates(
        goto,
        StateDelta {
            root_cause: Some(analysis),
            snippet_requests: Some(requests),
            prev_node: Some(NodeId::RootCauseAnalysis),
            inc_root_cause_tries: true,
            ..StateDelta::default()
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_code_requests_with_and_without_hints() {
        let analysis = "The overflow is in <code_request>png_read_row</code_request> \
                        and maybe <code_request>read_chunk | src/pngrutil.c</code_request>.";
        let requests = parse_code_requests(analysis);
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].identifier, "png_read_row");
        assert_eq!(requests[0].path_hint, None);
        assert_eq!(requests[1].identifier, "read_chunk");
        assert_eq!(requests[1].path_hint.as_deref(), Some("src/pngrutil.c"));
    }

    #[test]
    fn no_tags_means_no_requests() {
        assert!(parse_code_requests("plain analysis text").is_empty());
    }
}

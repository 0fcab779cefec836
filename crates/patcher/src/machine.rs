//! The workflow driver.
//!
//! Nodes never mutate the state directly: each returns a `NodeDecision`
//! carrying the next node and a `StateDelta`, and the driver folds the
//! delta in. Cancellation is checked at every node entry; a cancelled
//! workflow releases its built challenge directories and stops.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use buttercup_common::maps::BuildMap;
use buttercup_common::messages::ConfirmedVulnerability;
use buttercup_common::{NodeLocal, TaskRegistry};

use crate::codequery::CodeQuery;
use crate::config::PatcherConfig;
use crate::language::LanguageValidator;
use crate::llm::ChatModel;
use crate::nodes;
use crate::state::{CodeSnippet, CodeSnippetRequest, PatchAttempt, PatchStatus, PatcherState};

/// The workflow's nodes. `End` is the terminal sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeId {
    RootCauseAnalysis,
    ContextRetriever,
    CreatePatch,
    BuildPatch,
    RunPov,
    RunTests,
    PatchValidation,
    Reflection,
    End,
}

/// Targeted update to the latest patch attempt.
#[derive(Debug, Default)]
pub struct AttemptUpdate {
    pub status: Option<PatchStatus>,
    pub built_challenges: Option<BTreeMap<String, PathBuf>>,
    pub build_output: Option<(String, String)>,
    pub pov_output: Option<(String, String)>,
    pub tests_output: Option<(String, String)>,
    pub build_succeeded: Option<bool>,
    pub pov_fixed: Option<bool>,
    pub tests_passed: Option<bool>,
    pub analysis: Option<String>,
    /// Delete the attempt's built challenge directories.
    pub release_built: bool,
}

/// Everything a node may change about the state.
#[derive(Debug, Default)]
pub struct StateDelta {
    pub root_cause: Option<String>,
    /// `Some(None)` clears previously issued guidance.
    pub guidance: Option<Option<String>>,
    pub add_snippets: Vec<CodeSnippet>,
    /// Replaces the outstanding snippet requests.
    pub snippet_requests: Option<Vec<CodeSnippetRequest>>,
    pub new_attempt: Option<PatchAttempt>,
    pub update_latest: Option<AttemptUpdate>,
    pub prev_node: Option<NodeId>,
    pub inc_root_cause_tries: bool,
}

/// A node's verdict: where to go next and what changed.
#[derive(Debug)]
pub struct NodeDecision {
    pub goto: NodeId,
    pub updates: StateDelta,
}

impl NodeDecision {
    pub fn goto(goto: NodeId) -> Self {
        Self {
            goto,
            updates: StateDelta::default(),
        }
    }

    pub fn with_updates(goto: NodeId, updates: StateDelta) -> Self {
        Self { goto, updates }
    }
}

impl PatcherState {
    /// Fold a node's delta into the state.
    pub fn apply(&mut self, delta: StateDelta) {
        if let Some(root_cause) = delta.root_cause {
            self.root_cause = Some(root_cause);
        }
        if let Some(guidance) = delta.guidance {
            self.guidance = guidance;
        }
        self.relevant_code_snippets.extend(delta.add_snippets);
        if let Some(requests) = delta.snippet_requests {
            self.snippet_requests = requests;
        }
        if let Some(attempt) = delta.new_attempt {
            self.push_attempt(attempt);
        }
        if let Some(update) = delta.update_latest {
            if let Some(latest) = self.latest_attempt_mut() {
                if let Some(status) = update.status {
                    latest.status = status;
                }
                if let Some(built) = update.built_challenges {
                    latest.built_challenges = built;
                }
                if let Some((stdout, stderr)) = update.build_output {
                    latest.build_stdout = stdout;
                    latest.build_stderr = stderr;
                }
                if let Some((stdout, stderr)) = update.pov_output {
                    latest.pov_stdout = stdout;
                    latest.pov_stderr = stderr;
                }
                if let Some((stdout, stderr)) = update.tests_output {
                    latest.tests_stdout = stdout;
                    latest.tests_stderr = stderr;
                }
                if let Some(v) = update.build_succeeded {
                    latest.build_succeeded = v;
                }
                if let Some(v) = update.pov_fixed {
                    latest.pov_fixed = v;
                }
                if let Some(v) = update.tests_passed {
                    latest.tests_passed = v;
                }
                if let Some(analysis) = update.analysis {
                    latest.analysis = Some(analysis);
                }
                if update.release_built {
                    latest.release_built_challenges();
                }
            }
        }
        if let Some(prev_node) = delta.prev_node {
            self.execution_info.prev_node = Some(prev_node);
        }
        if delta.inc_root_cause_tries {
            self.execution_info.root_cause_analysis_tries += 1;
        }
    }
}

/// Injected collaborators the nodes act through.
pub struct Collaborators {
    pub registry: TaskRegistry,
    pub builds: BuildMap,
    pub node_local: NodeLocal,
    pub llm: Arc<dyn ChatModel>,
    pub codequery: Arc<dyn CodeQuery>,
    pub language_validator: LanguageValidator,
}

/// One workflow instance per (task, internal patch id).
pub struct PatcherWorkflow {
    pub(crate) config: PatcherConfig,
    pub(crate) collaborators: Collaborators,
}

impl PatcherWorkflow {
    pub fn new(config: PatcherConfig, collaborators: Collaborators) -> Self {
        Self {
            config,
            collaborators,
        }
    }

    /// Drive the workflow to END (or cancellation) and return the final
    /// state. The caller extracts the successful patch, if any.
    pub async fn run(
        &self,
        task_id: String,
        vulnerability: ConfirmedVulnerability,
    ) -> Result<PatcherState> {
        let mut state = PatcherState::new(task_id, vulnerability);
        let mut node = NodeId::RootCauseAnalysis;

        loop {
            if self
                .collaborators
                .registry
                .should_stop_processing(state.task_id.as_str(), None)
                .await?
            {
                info!(
                    "Task {} is cancelled or expired, stopping patch workflow",
                    state.task_id
                );
                break;
            }

            debug!(
                "Patcher {}:{} entering node {:?}",
                state.task_id, state.internal_patch_id, node
            );
            let decision = self.run_node(node, &state).await?;
            let next = decision.goto;
            state.apply(decision.updates);
            if next == NodeId::End {
                break;
            }
            node = next;
        }

        // Built challenge directories are workflow-scoped scratch; the
        // patched builds used downstream are produced by the builder.
        for attempt in &mut state.patch_attempts {
            attempt.release_built_challenges();
        }
        Ok(state)
    }

    async fn run_node(&self, node: NodeId, state: &PatcherState) -> Result<NodeDecision> {
        match node {
            NodeId::RootCauseAnalysis => nodes::root_cause::run(self, state).await,
            NodeId::ContextRetriever => nodes::context::run(self, state).await,
            NodeId::CreatePatch => nodes::create_patch::run(self, state).await,
            NodeId::BuildPatch => nodes::build::run(self, state).await,
            NodeId::RunPov => nodes::run_pov::run(self, state).await,
            NodeId::RunTests => nodes::run_tests::run(self, state).await,
            NodeId::PatchValidation => nodes::validate::run(self, state).await,
            NodeId::Reflection => nodes::reflection::run(self, state).await,
            NodeId::End => Ok(NodeDecision::goto(NodeId::End)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PatcherState;
    use buttercup_common::messages::ConfirmedVulnerability;

    fn state() -> PatcherState {
        PatcherState::new(
            "t1".into(),
            ConfirmedVulnerability {
                internal_patch_id: "p1".into(),
                crashes: vec![],
            },
        )
    }

    #[test]
    fn delta_application_is_targeted() {
        let mut st = state();
        st.apply(StateDelta {
            root_cause: Some("overflow in parser".into()),
            inc_root_cause_tries: true,
            ..StateDelta::default()
        });
        assert_eq!(st.root_cause.as_deref(), Some("overflow in parser"));
        assert_eq!(st.execution_info.root_cause_analysis_tries, 1);

        // An empty delta changes nothing
        st.apply(StateDelta::default());
        assert_eq!(st.root_cause.as_deref(), Some("overflow in parser"));
    }

    #[test]
    fn update_latest_touches_only_the_latest_attempt() {
        let mut st = state();
        st.push_attempt(PatchAttempt::new(0, "a".into(), PatchStatus::Pending));
        st.push_attempt(PatchAttempt::new(1, "b".into(), PatchStatus::Pending));

        st.apply(StateDelta {
            update_latest: Some(AttemptUpdate {
                status: Some(PatchStatus::BuildFailed),
                build_succeeded: Some(false),
                ..AttemptUpdate::default()
            }),
            ..StateDelta::default()
        });
        assert_eq!(st.patch_attempts[0].status, PatchStatus::Pending);
        assert_eq!(st.patch_attempts[1].status, PatchStatus::BuildFailed);
    }

    #[test]
    fn guidance_can_be_set_and_cleared() {
        let mut st = state();
        st.apply(StateDelta {
            guidance: Some(Some("focus on bounds checks".into())),
            ..StateDelta::default()
        });
        assert!(st.guidance.is_some());
        st.apply(StateDelta {
            guidance: Some(None),
            ..StateDelta::default()
        });
        assert!(st.guidance.is_none());
    }
}

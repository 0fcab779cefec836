//! Patcher workflow state.
//!
//! `PatcherState` is the single mutable record the driver threads through
//! the nodes. Patch attempts are append-with-modify-latest: a node may
//! update the latest attempt, and appending a new attempt releases the
//! built challenge directories of every prior attempt.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use buttercup_common::messages::ConfirmedVulnerability;

/// Where one patch attempt ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchStatus {
    Pending,
    CreationFailed,
    Duplicated,
    ApplyFailed,
    BuildFailed,
    PovFailed,
    TestsFailed,
    ValidationFailed,
    Success,
}

/// One candidate patch and everything observed while verifying it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchAttempt {
    pub id: usize,
    pub patch_text: String,
    /// Built challenge directory per sanitizer. Paths, not handles;
    /// released explicitly on supersession.
    #[serde(default)]
    pub built_challenges: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub build_stdout: String,
    #[serde(default)]
    pub build_stderr: String,
    #[serde(default)]
    pub pov_stdout: String,
    #[serde(default)]
    pub pov_stderr: String,
    #[serde(default)]
    pub tests_stdout: String,
    #[serde(default)]
    pub tests_stderr: String,
    pub status: PatchStatus,
    /// Reflection's analysis of why this attempt failed, if any.
    #[serde(default)]
    pub analysis: Option<String>,
    #[serde(default)]
    pub build_succeeded: bool,
    #[serde(default)]
    pub pov_fixed: bool,
    #[serde(default)]
    pub tests_passed: bool,
}

impl PatchAttempt {
    pub fn new(id: usize, patch_text: String, status: PatchStatus) -> Self {
        Self {
            id,
            patch_text,
            built_challenges: BTreeMap::new(),
            build_stdout: String::new(),
            build_stderr: String::new(),
            pov_stdout: String::new(),
            pov_stderr: String::new(),
            tests_stdout: String::new(),
            tests_stderr: String::new(),
            status,
            analysis: None,
            build_succeeded: false,
            pov_fixed: false,
            tests_passed: false,
        }
    }

    /// Delete this attempt's built challenge directories.
    pub fn release_built_challenges(&mut self) {
        for (sanitizer, dir) in std::mem::take(&mut self.built_challenges) {
            debug!(
                "Releasing built challenge for sanitizer {}: {}",
                sanitizer,
                dir.display()
            );
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove built challenge {}: {}", dir.display(), e);
                }
            }
        }
    }
}

/// A code location the root-cause analysis wants to see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeSnippetRequest {
    pub identifier: String,
    /// Optional path hint narrowing the lookup.
    #[serde(default)]
    pub path_hint: Option<String>,
}

/// A retrieved code snippet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeSnippet {
    pub identifier: String,
    pub file_path: String,
    pub start_line: u64,
    pub end_line: u64,
    pub content: String,
}

/// Bookkeeping the reflection node uses to pick the next step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionInfo {
    /// Node the context retriever returns to.
    pub prev_node: Option<crate::machine::NodeId>,
    pub root_cause_analysis_tries: usize,
}

/// Full state of one patching workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatcherState {
    pub task_id: String,
    pub internal_patch_id: String,
    pub vulnerability: ConfirmedVulnerability,
    #[serde(default)]
    pub relevant_code_snippets: Vec<CodeSnippet>,
    #[serde(default)]
    pub snippet_requests: Vec<CodeSnippetRequest>,
    #[serde(default)]
    pub root_cause: Option<String>,
    /// Guidance from the reflection node for the next attempt.
    #[serde(default)]
    pub guidance: Option<String>,
    #[serde(default)]
    pub patch_attempts: Vec<PatchAttempt>,
    #[serde(default)]
    pub execution_info: ExecutionInfo,
}

impl PatcherState {
    pub fn new(task_id: String, vulnerability: ConfirmedVulnerability) -> Self {
        Self {
            task_id,
            internal_patch_id: vulnerability.internal_patch_id.clone(),
            vulnerability,
            relevant_code_snippets: Vec::new(),
            snippet_requests: Vec::new(),
            root_cause: None,
            guidance: None,
            patch_attempts: Vec::new(),
            execution_info: ExecutionInfo::default(),
        }
    }

    pub fn latest_attempt(&self) -> Option<&PatchAttempt> {
        self.patch_attempts.last()
    }

    pub fn latest_attempt_mut(&mut self) -> Option<&mut PatchAttempt> {
        self.patch_attempts.last_mut()
    }

    /// Append a new attempt, releasing every prior attempt's built
    /// challenge directories.
    pub fn push_attempt(&mut self, attempt: PatchAttempt) {
        for prior in &mut self.patch_attempts {
            prior.release_built_challenges();
        }
        self.patch_attempts.push(attempt);
    }

    /// Length of the trailing run of attempts sharing the latest status.
    pub fn consecutive_failures_of_latest_status(&self) -> usize {
        let Some(latest) = self.latest_attempt() else {
            return 0;
        };
        self.patch_attempts
            .iter()
            .rev()
            .take_while(|a| a.status == latest.status)
            .count()
    }

    /// The latest attempt that built, fixed the PoVs and passed tests.
    /// A later `ValidationFailed` does not disqualify it: validation is
    /// patch hygiene, not correctness.
    pub fn get_successful_patch(&self) -> Option<&PatchAttempt> {
        self.patch_attempts
            .iter()
            .rev()
            .find(|a| a.build_succeeded && a.pov_fixed && a.tests_passed)
    }

    /// Whether a candidate patch matches any prior attempt.
    pub fn is_duplicate_patch(&self, normalized_patch: &str) -> bool {
        self.patch_attempts
            .iter()
            .any(|a| crate::upatch::normalize_patch(&a.patch_text) == normalized_patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buttercup_common::messages::ConfirmedVulnerability;
    use tempfile::TempDir;

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
    fn push_attempt_releases_prior_built_challenges() {
        let work = TempDir::new().unwrap();
        let built = work.path().join("attempt-0/address");
        std::fs::create_dir_all(&built).unwrap();

        let mut st = state();
        let mut first = PatchAttempt::new(0, "--- a\n+++ b\n".into(), PatchStatus::Pending);
        first
            .built_challenges
            .insert("address".into(), built.clone());
        st.push_attempt(first);
        assert!(built.exists());

        st.push_attempt(PatchAttempt::new(1, "other".into(), PatchStatus::Pending));
        assert!(!built.exists());
        assert!(st.patch_attempts[0].built_challenges.is_empty());
    }

    #[test]
    fn successful_patch_survives_validation_failure() {
        let mut st = state();
        let mut attempt = PatchAttempt::new(0, "patch".into(), PatchStatus::ValidationFailed);
        attempt.build_succeeded = true;
        attempt.pov_fixed = true;
        attempt.tests_passed = true;
        st.push_attempt(attempt);

        let successful = st.get_successful_patch().unwrap();
        assert_eq!(successful.id, 0);
        assert_eq!(successful.status, PatchStatus::ValidationFailed);
    }

    #[test]
    fn no_successful_patch_when_pov_not_fixed() {
        let mut st = state();
        let mut attempt = PatchAttempt::new(0, "patch".into(), PatchStatus::PovFailed);
        attempt.build_succeeded = true;
        st.push_attempt(attempt);
        assert!(st.get_successful_patch().is_none());
    }

    #[test]
    fn counts_consecutive_same_status_failures() {
        let mut st = state();
        st.push_attempt(PatchAttempt::new(0, "a".into(), PatchStatus::BuildFailed));
        st.push_attempt(PatchAttempt::new(1, "b".into(), PatchStatus::CreationFailed));
        st.push_attempt(PatchAttempt::new(2, "c".into(), PatchStatus::CreationFailed));
        assert_eq!(st.consecutive_failures_of_latest_status(), 2);
    }

    #[test]
    fn detects_duplicate_patches_modulo_whitespace() {
        let mut st = state();
        st.push_attempt(PatchAttempt::new(
            0,
            "--- a/f.c\n+++ b/f.c\n@@ -1 +1 @@\n-x\n+y \n".into(),
            PatchStatus::Pending,
        ));
        let normalized =
            crate::upatch::normalize_patch("--- a/f.c\n+++ b/f.c\n@@ -1 +1 @@\n-x\n+y\n");
        assert!(st.is_duplicate_patch(&normalized));
        assert!(!st.is_duplicate_patch(&crate::upatch::normalize_patch("entirely different")));
    }
}

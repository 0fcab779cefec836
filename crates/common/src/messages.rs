//! Message and record types shared across services.
//!
//! Every queue payload and every record persisted in the key/value store is
//! one of these types. Each reliable queue carries exactly one variant; the
//! codec is plain serde JSON.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Scope of a challenge task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Analyze the whole repository.
    #[default]
    Full,
    /// Analyze the delta introduced by the task's diff.
    Delta,
}

/// Kind of an individual source archive attached to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceType {
    Repo,
    FuzzTooling,
    Diff,
}

/// One downloadable source archive belonging to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDetail {
    pub sha256: String,
    pub source_type: SourceType,
    pub url: String,
}

/// A challenge task as delivered by the inbound webhook.
///
/// The `cancelled` flag is informational only: the cancelled-tasks set in the
/// key/value store is authoritative and overrides this field on every read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Task {
    pub task_id: String,
    pub message_id: String,
    /// Webhook delivery time, epoch milliseconds.
    pub message_time: i64,
    pub task_type: TaskType,
    /// Deadline, epoch milliseconds.
    pub deadline: i64,
    pub project_name: String,
    /// Subdirectory of `src/` the analysis focuses on.
    pub focus: String,
    pub sources: Vec<SourceDetail>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub cancelled: bool,
}

impl Task {
    /// Deadline in whole seconds since the epoch.
    pub fn deadline_secs(&self) -> i64 {
        self.deadline / 1000
    }
}

/// A fuzz entry point with its scheduling weight. Weight 0 means
/// "do not schedule".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedHarness {
    pub task_id: String,
    pub package_name: String,
    pub harness_name: String,
    pub weight: f64,
}

/// Build variants the dispatcher produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildType {
    Fuzzer,
    Coverage,
    Tracer,
    Patch,
}

impl BuildType {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildType::Fuzzer => "fuzzer",
            BuildType::Coverage => "coverage",
            BuildType::Tracer => "tracer",
            BuildType::Patch => "patch",
        }
    }
}

/// Request for one (engine, sanitizer, build type) build of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub task_id: String,
    pub engine: String,
    pub sanitizer: String,
    pub build_type: BuildType,
    /// Shared-filesystem directory holding the challenge task.
    pub task_dir: PathBuf,
    /// Apply the task's own diff before building (delta tasks).
    #[serde(default)]
    pub apply_diff: bool,
    /// Candidate patch text to apply on top, empty for plain builds.
    #[serde(default)]
    pub patch: String,
    /// Identifier of the patch-line under analysis; empty for FUZZER builds.
    #[serde(default)]
    pub internal_patch_id: String,
}

/// A finished build, addressed by (task, build type, sanitizer, patch id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOutput {
    pub task_id: String,
    pub engine: String,
    pub sanitizer: String,
    pub build_type: BuildType,
    #[serde(default)]
    pub internal_patch_id: String,
    /// Shared-filesystem directory of the built challenge.
    pub task_dir: PathBuf,
}

/// A crashing input straight out of a fuzzer worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Crash {
    pub target: BuildOutput,
    pub harness_name: String,
    /// Shared-filesystem path of the crashing input.
    pub crash_input_path: PathBuf,
    pub stacktrace: String,
}

/// A crash re-run under the tracer build, with its canonical stack trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracedCrash {
    pub crash: Crash,
    pub tracer_stacktrace: String,
}

/// A deduplicated vulnerability handed to the patcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmedVulnerability {
    pub internal_patch_id: String,
    pub crashes: Vec<TracedCrash>,
}

impl ConfirmedVulnerability {
    pub fn task_id(&self) -> Option<&str> {
        self.crashes.first().map(|c| c.crash.target.task_id.as_str())
    }
}

/// A successful patch on its way to the submission driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub task_id: String,
    pub internal_patch_id: String,
    pub patch: String,
}

/// Request to reproduce a PoV against a patched build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct POVReproduceRequest {
    pub task_id: String,
    pub internal_patch_id: String,
    pub pov_path: PathBuf,
    pub sanitizer: String,
    pub harness_name: String,
}

/// Coverage of a single function, as reported by the coverage pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCoverage {
    pub function_name: String,
    pub function_paths: Vec<String>,
    pub total_lines: u64,
    pub covered_lines: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> Task {
        Task {
            task_id: "test123".to_string(),
            message_id: "msg_123".to_string(),
            message_time: 1_234_567_890,
            task_type: TaskType::Full,
            deadline: 1_234_567_899_000,
            project_name: "libpng".to_string(),
            focus: "libpng".to_string(),
            sources: vec![SourceDetail {
                sha256: "abc123".to_string(),
                source_type: SourceType::Repo,
                url: "https://example.com/repo.tgz".to_string(),
            }],
            metadata: HashMap::from([("round".to_string(), "final".to_string())]),
            cancelled: false,
        }
    }

    #[test]
    fn task_round_trips_through_json() {
        let task = sample_task();
        let bytes = serde_json::to_vec(&task).unwrap();
        let back: Task = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(task, back);
    }

    #[test]
    fn source_type_uses_wire_names() {
        let json = serde_json::to_string(&SourceType::FuzzTooling).unwrap();
        assert_eq!(json, "\"fuzz-tooling\"");
        let back: SourceType = serde_json::from_str("\"repo\"").unwrap();
        assert_eq!(back, SourceType::Repo);
    }

    #[test]
    fn build_output_round_trips() {
        let out = BuildOutput {
            task_id: "t1".to_string(),
            engine: "libfuzzer".to_string(),
            sanitizer: "address".to_string(),
            build_type: BuildType::Patch,
            internal_patch_id: "p1".to_string(),
            task_dir: PathBuf::from("/tasks/t1"),
        };
        let bytes = serde_json::to_vec(&out).unwrap();
        assert_eq!(out, serde_json::from_slice::<BuildOutput>(&bytes).unwrap());
    }

    #[test]
    fn missing_optional_fields_default() {
        let json = r#"{
            "task_id": "t1",
            "engine": "libfuzzer",
            "sanitizer": "address",
            "build_type": "fuzzer",
            "task_dir": "/tasks/t1"
        }"#;
        let req: BuildRequest = serde_json::from_str(json).unwrap();
        assert!(!req.apply_diff);
        assert!(req.patch.is_empty());
        assert!(req.internal_patch_id.is_empty());
    }

    #[test]
    fn deadline_secs_truncates_milliseconds() {
        let task = sample_task();
        assert_eq!(task.deadline_secs(), 1_234_567_899);
    }
}

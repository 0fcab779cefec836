//! Patcher configuration, resolved once at startup.

use std::path::PathBuf;
use std::time::Duration;

/// Tuning knobs for one patcher process.
#[derive(Debug, Clone)]
pub struct PatcherConfig {
    /// Total patch attempts before the workflow gives up.
    pub max_patch_retries: usize,
    /// Root-cause analysis retries before degrading to patch creation.
    pub max_root_cause_analysis_retries: usize,
    /// Consecutive same-status failures before escalating to root cause.
    pub max_last_failure_retries: usize,
    /// Parallelism for builds and PoV runs.
    pub max_concurrency: usize,
    /// Wall-clock cap for one PoV sweep.
    pub max_minutes_run_povs: u64,
    /// Sanitizers every patch must build and survive PoVs under.
    pub sanitizers: Vec<String>,
    /// Per-task storage base under the node-local root.
    pub tasks_storage: String,
    /// Working directory for patched challenge copies.
    pub work_dir: PathBuf,
    /// Python interpreter for OSS-Fuzz helper invocations.
    pub python_path: String,
}

impl Default for PatcherConfig {
    fn default() -> Self {
        Self {
            max_patch_retries: 30,
            max_root_cause_analysis_retries: 3,
            max_last_failure_retries: 3,
            max_concurrency: 4,
            max_minutes_run_povs: 20,
            sanitizers: vec!["address".to_string()],
            tasks_storage: "tasks_storage".to_string(),
            work_dir: PathBuf::from("/tmp/patcher"),
            python_path: "python3".to_string(),
        }
    }
}

impl PatcherConfig {
    pub fn pov_sweep_timeout(&self) -> Duration {
        Duration::from_secs(self.max_minutes_run_povs * 60)
    }
}

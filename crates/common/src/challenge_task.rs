//! Challenge task directories and the operations run against them.
//!
//! A challenge task directory holds `fuzz-tooling/` (the OSS-Fuzz checkout
//! with `infra/helper.py`), `src/` (the project sources), `diff/` (the
//! task's own diff, delta tasks only) and a `metadata.json` record. Workers
//! open the shared copy read-only and take a scoped read-write copy before
//! mutating anything; the copy is published with an atomic rename.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CommonError, Result};
use crate::messages::{BuildType, TaskType};

/// File name of the task metadata record inside a task directory.
pub const TASK_META_FILE: &str = "metadata.json";

/// Output of a cached build that did not need to run.
pub const CACHED_BUILD_OUTPUT: &str = "Check build passed";

/// Markers that identify a sanitizer or fuzzer crash in run output.
const CRASH_MARKERS: &[&str] = &[
    "ERROR: AddressSanitizer",
    "ERROR: MemorySanitizer",
    "ERROR: UndefinedBehaviorSanitizer",
    "ERROR: LeakSanitizer",
    "ERROR: libFuzzer: deadly signal",
    "ERROR: libFuzzer: timeout",
    "SEGV on unknown address",
    "== Java Exception:",
];

/// Metadata record stored alongside the task sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMeta {
    pub task_id: String,
    pub project_name: String,
    pub focus: String,
    pub task_type: TaskType,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Captured result of one external command.
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    pub success: bool,
    pub returncode: Option<i32>,
    pub output: String,
    pub error: String,
}

/// Result of replaying a PoV against a built challenge.
#[derive(Debug, Clone)]
pub struct ReproduceResult {
    pub command_result: CommandResult,
    ran: bool,
    crashed: bool,
}

impl ReproduceResult {
    /// Whether the reproduction actually executed. False means an infra
    /// failure the caller should retry.
    pub fn did_run(&self) -> bool {
        self.ran
    }

    /// Whether the target crashed on the input.
    pub fn did_crash(&self) -> bool {
        self.crashed
    }
}

/// Key under which a build is cached. Identical keys short-circuit to the
/// prior build artifacts.
#[derive(Debug, Clone)]
pub struct BuildCacheKey {
    pub task_id: String,
    pub project_name: String,
    pub engine: String,
    pub sanitizer: String,
    pub build_type: BuildType,
    /// Hash of the candidate patch text, empty when none was applied.
    pub patch_hash: String,
    /// Hash of the task diff, empty when the diff was not applied.
    pub applied_diff_hash: String,
}

impl BuildCacheKey {
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.task_id.as_str(),
            self.project_name.as_str(),
            self.engine.as_str(),
            self.sanitizer.as_str(),
            self.build_type.as_str(),
            self.patch_hash.as_str(),
            self.applied_diff_hash.as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update(b"\x1f");
        }
        hex::encode(hasher.finalize())
    }
}

/// Handle to a challenge task directory.
#[derive(Debug, Clone)]
pub struct ChallengeTask {
    task_dir: PathBuf,
    python_path: String,
    read_only: bool,
    cache_dir: Option<PathBuf>,
    command_timeout: Option<Duration>,
}

impl ChallengeTask {
    /// Open an existing task directory read-only.
    pub fn new(task_dir: PathBuf) -> Self {
        Self {
            task_dir,
            python_path: "python3".to_string(),
            read_only: true,
            cache_dir: None,
            command_timeout: None,
        }
    }

    pub fn with_python_path(mut self, python_path: &str) -> Self {
        self.python_path = python_path.to_string();
        self
    }

    /// Enable the build cache rooted at `cache_dir`.
    pub fn with_cache_dir(mut self, cache_dir: PathBuf) -> Self {
        self.cache_dir = Some(cache_dir);
        self
    }

    /// Cap every external command at `timeout`.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    pub fn task_dir(&self) -> &Path {
        &self.task_dir
    }

    pub fn task_meta(&self) -> Result<TaskMeta> {
        let bytes = fs::read(self.task_dir.join(TASK_META_FILE))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn oss_fuzz_path(&self) -> PathBuf {
        self.task_dir.join("fuzz-tooling")
    }

    pub fn source_path(&self) -> PathBuf {
        self.task_dir.join("src")
    }

    pub fn diff_path(&self) -> PathBuf {
        self.task_dir.join("diff")
    }

    /// OSS-Fuzz build output directory for this task's project.
    pub fn build_dir(&self) -> Result<PathBuf> {
        let meta = self.task_meta()?;
        Ok(self
            .oss_fuzz_path()
            .join("build/out")
            .join(meta.project_name))
    }

    /// Fuzz harness binaries present in the build directory.
    pub fn list_harnesses(&self) -> Result<Vec<String>> {
        use std::os::unix::fs::PermissionsExt;

        let build_dir = self.build_dir()?;
        if !build_dir.exists() {
            return Ok(Vec::new());
        }
        let skip_exts = ["o", "a", "so", "txt", "json", "dict", "options", "zip", "jar"];
        let mut harnesses = Vec::new();
        for entry in fs::read_dir(&build_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || name == "llvm-symbolizer" {
                continue;
            }
            if let Some(ext) = entry.path().extension() {
                if skip_exts.contains(&ext.to_string_lossy().as_ref()) {
                    continue;
                }
            }
            let mode = entry.metadata()?.permissions().mode();
            if mode & 0o111 != 0 {
                harnesses.push(name);
            }
        }
        harnesses.sort();
        Ok(harnesses)
    }

    /// Take a scoped read-write copy of this task under `work_dir`. The
    /// copy lives in a hidden staging directory until committed.
    pub fn rw_copy(&self, work_dir: &Path) -> Result<RwChallengeTask> {
        let staging = work_dir.join(format!(".rw-{}", Uuid::new_v4()));
        copy_dir_recursive(&self.task_dir, &staging)?;
        let final_dir = work_dir.join(
            self.task_dir
                .file_name()
                .ok_or_else(|| CommonError::Configuration("task dir has no name".into()))?,
        );
        let mut task = self.clone();
        task.task_dir = staging;
        task.read_only = false;
        Ok(RwChallengeTask {
            task,
            final_dir,
            committed: false,
        })
    }

    /// Apply the task's own diff (delta tasks). Returns false when any
    /// hunk fails to apply.
    pub async fn apply_patch_diff(&self) -> Result<bool> {
        assert!(!self.read_only, "cannot patch a read-only task copy");
        let diff_dir = self.diff_path();
        if !diff_dir.exists() {
            debug!("No diff directory in {}, nothing to apply", self.task_dir.display());
            return Ok(true);
        }
        let mut diffs: Vec<PathBuf> = fs::read_dir(&diff_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .is_some_and(|ext| ext == "diff" || ext == "patch")
            })
            .collect();
        diffs.sort();
        for diff in diffs {
            if !self.apply_patch_file(&diff).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Apply one patch file to the task sources.
    pub async fn apply_patch_file(&self, patch: &Path) -> Result<bool> {
        assert!(!self.read_only, "cannot patch a read-only task copy");
        let result = self
            .run_command(
                "patch",
                &[
                    "-p1",
                    "-N",
                    "-d",
                    &self.source_path().to_string_lossy(),
                    "-i",
                    &patch.to_string_lossy(),
                ],
            )
            .await?;
        if !result.success {
            info!(
                "Patch {} failed to apply: {}",
                patch.display(),
                result.error
            );
        }
        Ok(result.success)
    }

    /// Run the OSS-Fuzz fuzzer build for one (engine, sanitizer) pair.
    pub async fn build_fuzzers(
        &self,
        engine: &str,
        sanitizer: &str,
        pull_latest_base_image: bool,
    ) -> Result<CommandResult> {
        let meta = self.task_meta()?;
        let helper = self.oss_fuzz_path().join("infra/helper.py");
        let mut args: Vec<String> = vec![
            helper.to_string_lossy().into_owned(),
            "build_fuzzers".to_string(),
            "--engine".to_string(),
            engine.to_string(),
            "--sanitizer".to_string(),
            sanitizer.to_string(),
        ];
        if !pull_latest_base_image {
            args.push("--no-pull".to_string());
        }
        args.push(meta.project_name.clone());
        args.push(self.source_path().to_string_lossy().into_owned());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_command(&self.python_path, &arg_refs).await
    }

    /// Build with the cache. A hit on the fingerprint short-circuits to a
    /// successful result without running anything; a miss builds and then
    /// records the fingerprint.
    pub async fn build_fuzzers_with_cache(
        &self,
        key: &BuildCacheKey,
        pull_latest_base_image: bool,
    ) -> Result<CommandResult> {
        let Some(cache_dir) = self.cache_dir.clone() else {
            return self
                .build_fuzzers(&key.engine, &key.sanitizer, pull_latest_base_image)
                .await;
        };

        let marker = cache_dir.join(key.fingerprint());
        if marker.exists() && self.build_dir().map(|d| d.exists()).unwrap_or(false) {
            debug!("Build cache hit for {}", key.fingerprint());
            return Ok(CommandResult {
                success: true,
                returncode: Some(0),
                output: CACHED_BUILD_OUTPUT.to_string(),
                error: String::new(),
            });
        }

        let result = self
            .build_fuzzers(&key.engine, &key.sanitizer, pull_latest_base_image)
            .await?;
        if result.success {
            fs::create_dir_all(&cache_dir)?;
            fs::write(&marker, key.fingerprint())?;
        }
        Ok(result)
    }

    /// Replay a PoV input against a built harness.
    pub async fn reproduce_pov(&self, harness_name: &str, pov: &Path) -> Result<ReproduceResult> {
        let meta = self.task_meta()?;
        let helper = self.oss_fuzz_path().join("infra/helper.py");
        let args = [
            helper.to_string_lossy().into_owned(),
            "reproduce".to_string(),
            meta.project_name,
            harness_name.to_string(),
            pov.to_string_lossy().into_owned(),
        ];
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let result = self.run_command(&self.python_path, &arg_refs).await?;
        Ok(classify_reproduction(result))
    }

    /// Run the task's functionality tests, if it ships any. `None` means
    /// the task has no tests script.
    pub async fn run_tests(&self) -> Result<Option<CommandResult>> {
        let script = self.task_dir.join("test.sh");
        if !script.exists() {
            return Ok(None);
        }
        let result = self
            .run_command("bash", &[&script.to_string_lossy()])
            .await?;
        Ok(Some(result))
    }

    async fn run_command(&self, program: &str, args: &[&str]) -> Result<CommandResult> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.task_dir)
            .kill_on_drop(true);
        debug!("Running {} {:?} in {}", program, args, self.task_dir.display());

        let output = match self.command_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, cmd.output()).await {
                Ok(output) => output,
                Err(_) => {
                    warn!("Command {} timed out after {:?}", program, timeout);
                    return Ok(CommandResult {
                        success: false,
                        returncode: None,
                        output: String::new(),
                        error: format!("timed out after {}s", timeout.as_secs()),
                    });
                }
            },
            None => cmd.output().await,
        };

        match output {
            Ok(output) => Ok(CommandResult {
                success: output.status.success(),
                returncode: output.status.code(),
                output: String::from_utf8_lossy(&output.stdout).into_owned(),
                error: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            Err(e) => Err(CommonError::Command(format!(
                "failed to spawn {program}: {e}"
            ))),
        }
    }
}

/// A scoped read-write copy of a challenge task. The staging directory is
/// removed on drop unless the copy was committed.
pub struct RwChallengeTask {
    task: ChallengeTask,
    final_dir: PathBuf,
    committed: bool,
}

impl RwChallengeTask {
    pub fn task(&self) -> &ChallengeTask {
        &self.task
    }

    /// Publish the copy at its final path with an atomic rename. Losing
    /// the rename race to another worker still counts as published.
    pub fn commit(mut self) -> Result<PathBuf> {
        if let Some(parent) = self.final_dir.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::rename(&self.task.task_dir, &self.final_dir) {
            Ok(()) => {}
            Err(e)
                if e.kind() == std::io::ErrorKind::AlreadyExists
                    || e.raw_os_error() == Some(39) =>
            {
                debug!("Lost commit race for {}", self.final_dir.display());
                let _ = fs::remove_dir_all(&self.task.task_dir);
            }
            Err(e) => return Err(e.into()),
        }
        self.committed = true;
        Ok(self.final_dir.clone())
    }
}

impl Drop for RwChallengeTask {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_dir_all(&self.task.task_dir);
        }
    }
}

fn classify_reproduction(result: CommandResult) -> ReproduceResult {
    let crashed = CRASH_MARKERS
        .iter()
        .any(|m| result.output.contains(m) || result.error.contains(m));
    // A clean exit or a detected crash means the reproduction executed;
    // a failing exit with no crash marker is an infra failure.
    let ran = result.success || crashed;
    ReproduceResult {
        command_result: result,
        ran,
        crashed,
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_meta(dir: &Path) {
        let meta = TaskMeta {
            task_id: "t1".into(),
            project_name: "libpng".into(),
            focus: "libpng".into(),
            task_type: TaskType::Full,
            metadata: HashMap::new(),
        };
        fs::write(
            dir.join(TASK_META_FILE),
            serde_json::to_vec(&meta).unwrap(),
        )
        .unwrap();
    }

    fn sample_task(root: &Path) -> ChallengeTask {
        let task_dir = root.join("t1");
        fs::create_dir_all(task_dir.join("src")).unwrap();
        fs::create_dir_all(task_dir.join("fuzz-tooling/infra")).unwrap();
        fs::write(task_dir.join("src/main.c"), b"int main(){}").unwrap();
        write_meta(&task_dir);
        ChallengeTask::new(task_dir)
    }

    #[test]
    fn reads_task_meta() {
        let root = TempDir::new().unwrap();
        let task = sample_task(root.path());
        let meta = task.task_meta().unwrap();
        assert_eq!(meta.project_name, "libpng");
        assert_eq!(meta.task_type, TaskType::Full);
    }

    #[test]
    fn rw_copy_is_isolated_and_cleaned_up() {
        let root = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let task = sample_task(root.path());

        let staging_path = {
            let copy = task.rw_copy(work.path()).unwrap();
            let staging = copy.task().task_dir().to_path_buf();
            assert!(staging.exists());
            // Mutating the copy leaves the original untouched
            fs::write(staging.join("src/main.c"), b"changed").unwrap();
            assert_eq!(
                fs::read(task.task_dir().join("src/main.c")).unwrap(),
                b"int main(){}"
            );
            staging
        };
        assert!(!staging_path.exists());
    }

    #[test]
    fn commit_publishes_at_final_path() {
        let root = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let task = sample_task(root.path());

        let copy = task.rw_copy(work.path()).unwrap();
        let published = copy.commit().unwrap();
        assert_eq!(published, work.path().join("t1"));
        assert!(published.join("src/main.c").exists());
    }

    #[test]
    fn commit_tolerates_losing_the_race() {
        let root = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let task = sample_task(root.path());

        // Another worker already published the task
        let winner = task.rw_copy(work.path()).unwrap();
        winner.commit().unwrap();

        let loser = task.rw_copy(work.path()).unwrap();
        let published = loser.commit().unwrap();
        assert_eq!(published, work.path().join("t1"));
        assert!(published.exists());
    }

    #[test]
    fn cache_fingerprint_covers_patch_and_diff() {
        let base = BuildCacheKey {
            task_id: "t1".into(),
            project_name: "libpng".into(),
            engine: "libfuzzer".into(),
            sanitizer: "address".into(),
            build_type: BuildType::Fuzzer,
            patch_hash: String::new(),
            applied_diff_hash: String::new(),
        };
        let with_patch = BuildCacheKey {
            patch_hash: "abc".into(),
            build_type: BuildType::Patch,
            ..base.clone()
        };
        assert_ne!(base.fingerprint(), with_patch.fingerprint());
        assert_eq!(base.fingerprint(), base.clone().fingerprint());
    }

    #[test]
    fn crash_markers_classify_reproductions() {
        let crash = classify_reproduction(CommandResult {
            success: false,
            returncode: Some(1),
            output: "==1==ERROR: AddressSanitizer: heap-use-after-free".into(),
            error: String::new(),
        });
        assert!(crash.did_run());
        assert!(crash.did_crash());

        let clean = classify_reproduction(CommandResult {
            success: true,
            returncode: Some(0),
            output: "Execution successful".into(),
            error: String::new(),
        });
        assert!(clean.did_run());
        assert!(!clean.did_crash());

        let infra = classify_reproduction(CommandResult {
            success: false,
            returncode: Some(125),
            output: String::new(),
            error: "docker: Cannot connect to the Docker daemon".into(),
        });
        assert!(!infra.did_run());
        assert!(!infra.did_crash());
    }
}

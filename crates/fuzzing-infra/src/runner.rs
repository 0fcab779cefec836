//! The fuzzer merge-runner contract.
//!
//! Corpus merging hands the runner two directories: a candidate directory
//! of local-only files and a destination directory holding the current
//! remote set. The runner invokes the engine's merge mode, which copies
//! into the destination exactly those candidates that add coverage.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, info};

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct Conf {
    pub timeout: Duration,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
        }
    }
}

/// One merge invocation's inputs.
#[derive(Debug, Clone)]
pub struct FuzzConfiguration {
    /// Directory of candidate corpus files.
    pub corpus_dir: PathBuf,
    /// The built harness binary.
    pub target_path: PathBuf,
    pub engine: String,
    pub sanitizer: String,
}

/// Outcome of one bounded fuzzing session.
#[derive(Debug)]
pub struct FuzzResult {
    /// Crash artifact written by the engine, if any.
    pub crash_input: Option<PathBuf>,
    /// Engine output, which carries the sanitizer report on a crash.
    pub stderr: String,
}

pub struct Runner {
    conf: Conf,
}

impl Runner {
    pub fn new(conf: Conf) -> Self {
        Self { conf }
    }

    /// Merge `conf.corpus_dir` into `dest_dir`, keeping only
    /// coverage-adding inputs. Exceeding the wall-clock cap is a failure;
    /// the destination may then hold a partial (but valid) subset.
    pub async fn merge_corpus(&self, conf: &FuzzConfiguration, dest_dir: &Path) -> Result<()> {
        if conf.engine != "libfuzzer" {
            bail!("merge is only supported for libfuzzer targets, got {}", conf.engine);
        }
        info!(
            "Merging corpus for {} ({} | {})",
            conf.target_path.display(),
            conf.engine,
            conf.sanitizer
        );

        let mut cmd = Command::new(&conf.target_path);
        cmd.arg("-merge=1")
            .arg(dest_dir)
            .arg(&conf.corpus_dir)
            .kill_on_drop(true);
        debug!("Merge command: {:?}", cmd);

        let output = tokio::time::timeout(self.conf.timeout, cmd.output())
            .await
            .with_context(|| {
                format!(
                    "corpus merge timed out after {}s",
                    self.conf.timeout.as_secs()
                )
            })?
            .context("failed to spawn merge runner")?;

        if !output.status.success() {
            bail!(
                "merge runner exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }

    /// Run one bounded fuzzing session over the corpus directory. New
    /// inputs land in the corpus; a crash leaves an artifact under
    /// `artifact_dir` and its report on stderr.
    pub async fn run_fuzzer(
        &self,
        conf: &FuzzConfiguration,
        artifact_dir: &Path,
        max_total_time: Duration,
    ) -> Result<FuzzResult> {
        if conf.engine != "libfuzzer" {
            bail!("fuzzing is only supported for libfuzzer targets, got {}", conf.engine);
        }
        std::fs::create_dir_all(artifact_dir)?;

        let mut cmd = Command::new(&conf.target_path);
        cmd.arg(&conf.corpus_dir)
            .arg(format!("-max_total_time={}", max_total_time.as_secs()))
            .arg(format!("-artifact_prefix={}/", artifact_dir.display()))
            .kill_on_drop(true);
        debug!("Fuzz command: {:?}", cmd);

        // The engine bounds itself; the outer timeout only catches hangs.
        let output = tokio::time::timeout(max_total_time + self.conf.timeout, cmd.output())
            .await
            .context("fuzzing session hung past its time budget")?
            .context("failed to spawn fuzzer")?;

        let crash_input = std::fs::read_dir(artifact_dir)?
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .find(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy().starts_with("crash-"))
                    .unwrap_or(false)
            });
        Ok(FuzzResult {
            crash_input,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

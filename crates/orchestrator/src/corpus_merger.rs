//! Corpus merging: promote coverage-adding local corpus files to remote.
//!
//! For every harness still worth scheduling, the task partitions the corpus
//! into local-only and remote files, runs the fuzzer's merge mode over the
//! partition, and publishes exactly the local-only files the merge kept.
//! A distributed lock serializes merges per (task, harness); content-
//! addressed uploads make a crashed merge harmless to repeat.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use buttercup_common::challenge_task::ChallengeTask;
use buttercup_common::constants::{
    ADDRESS_SANITIZER, MAX_LOCAL_FILES, MERGING_LOCK_TIMEOUT_SECONDS,
};
use buttercup_common::corpus::{hash_corpus_dir, Corpus};
use buttercup_common::error::CommonError;
use buttercup_common::locks::{LockAcquisition, MergedCorpusSetLock};
use buttercup_common::maps::{BuildMap, HarnessWeights};
use buttercup_common::messages::{BuildOutput, BuildType, WeightedHarness};
use buttercup_common::NodeLocal;
use buttercup_fuzzing_infra::runner::{Conf, FuzzConfiguration, Runner};

use crate::background::BackgroundTask;

pub struct CorpusMergingTask {
    conn: redis::aio::ConnectionManager,
    harness_weights: HarnessWeights,
    builds: BuildMap,
    node_local: NodeLocal,
    tasks_storage: String,
    python_path: String,
    runner: Runner,
    interval: Duration,
    max_local_files: usize,
}

impl CorpusMergingTask {
    pub fn new(
        conn: redis::aio::ConnectionManager,
        node_local: NodeLocal,
        tasks_storage: String,
        python_path: String,
        merge_timeout: Duration,
    ) -> Self {
        Self {
            harness_weights: HarnessWeights::new(conn.clone()),
            builds: BuildMap::new(conn.clone()),
            conn,
            node_local,
            tasks_storage,
            python_path,
            runner: Runner::new(Conf {
                timeout: merge_timeout,
            }),
            interval: Duration::from_secs(10),
            max_local_files: MAX_LOCAL_FILES,
        }
    }

    /// Merge one harness's corpus. Returns true when a merge ran.
    async fn merge_corpus_for_harness(
        &self,
        harness: &WeightedHarness,
        builds: &[BuildOutput],
    ) -> Result<bool> {
        debug!(
            "Running merge pass for {} | {} | {}",
            harness.harness_name, harness.package_name, harness.task_id
        );

        // Prefer the address-sanitizer build; any other will do.
        let build = builds
            .iter()
            .find(|b| b.sanitizer == ADDRESS_SANITIZER)
            .or_else(|| builds.first())
            .context("no fuzzer build available")?;

        let corpus = Corpus::new(
            self.node_local.clone(),
            &self.tasks_storage,
            &harness.task_id,
            &harness.harness_name,
        )?;
        corpus.hash_new_corpus()?;

        let lock = match MergedCorpusSetLock::acquire(
            self.conn.clone(),
            &harness.task_id,
            &harness.harness_name,
            MERGING_LOCK_TIMEOUT_SECONDS,
        )
        .await?
        {
            LockAcquisition::Acquired(lock) => lock,
            LockAcquisition::Busy => {
                debug!(
                    "Skipping merge for {} - another worker is already merging",
                    harness.harness_name
                );
                return Ok(false);
            }
        };

        let outcome = self.locked_merge(harness, build, &corpus).await;
        if !lock.release().await? {
            warn!(
                "Merge lock for {} | {} expired mid-merge",
                harness.task_id, harness.harness_name
            );
        }
        outcome
    }

    /// Steps 2-8 of the merge protocol, run under the lock.
    async fn locked_merge(
        &self,
        harness: &WeightedHarness,
        build: &BuildOutput,
        corpus: &Corpus,
    ) -> Result<bool> {
        corpus.sync_from_remote()?;

        let local_files = corpus.local_hashed_names()?;
        let remote_files = corpus.remote_hashed_names()?;
        let local_only: Vec<String> = local_files.difference(&remote_files).cloned().collect();
        if local_only.is_empty() {
            debug!(
                "Skipping merge for {} - local corpus is up to date",
                harness.harness_name
            );
            return Ok(false);
        }
        info!(
            "Found {} files only in local corpus for {}. Will run merge operation.",
            local_only.len(),
            harness.harness_name
        );

        let local_dir = self.node_local.scratch_dir()?;
        let remote_dir = self.node_local.scratch_dir()?;

        // Sample the candidates; stage the full remote set.
        let mut candidates = local_only;
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(self.max_local_files);
        let mut staged_local_only: HashSet<String> = HashSet::new();
        for name in &candidates {
            match corpus.stage_into(name, local_dir.path()) {
                Ok(()) => {
                    staged_local_only.insert(name.clone());
                }
                Err(e) => warn!("Error staging corpus file {}: {}", name, e),
            }
        }
        for name in &remote_files {
            if let Err(e) = corpus.stage_into(name, remote_dir.path()) {
                warn!("Error staging remote corpus file {}: {}", name, e);
            }
        }

        self.run_merge_operation(harness, build, local_dir.path(), remote_dir.path())
            .await?;

        // The merge runner may write arbitrary names; rehash before diffing.
        hash_corpus_dir(remote_dir.path())?;
        let merged: HashSet<String> = std::fs::read_dir(remote_dir.path())?
            .filter_map(std::result::Result::ok)
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();

        let (push, delete) = merge_outcome(&remote_files, &staged_local_only, &merged)?;
        if !push.is_empty() {
            let pushed =
                corpus.sync_specific_files_to_remote(push.iter().map(String::as_str))?;
            info!(
                "Synced {} files that add coverage to remote corpus",
                pushed
            );
        }

        let mut deleted = 0usize;
        for name in &delete {
            match corpus.remove_local_file(name) {
                Ok(()) => deleted += 1,
                Err(e) => warn!("Error removing file {} from local corpus: {}", name, e),
            }
        }
        if deleted > 0 {
            info!(
                "Removed {} files from local corpus that don't add coverage",
                deleted
            );
        }
        Ok(true)
    }

    /// Stage the fuzzer build and invoke the engine's merge mode.
    async fn run_merge_operation(
        &self,
        harness: &WeightedHarness,
        build: &BuildOutput,
        local_dir: &Path,
        remote_dir: &Path,
    ) -> Result<()> {
        let local_build = self.node_local.local_path(&build.task_dir);
        self.node_local
            .remote_archive_to_dir(&local_build)
            .context("staging fuzzer build")?;
        let task = ChallengeTask::new(local_build).with_python_path(&self.python_path);

        let scratch = self.node_local.scratch_dir()?;
        let rw = task.rw_copy(scratch.path())?;
        let target = rw.task().build_dir()?.join(&harness.harness_name);

        info!(
            "Starting fuzzer merge for {} | {} | {}",
            build.engine, build.sanitizer, harness.harness_name
        );
        let conf = FuzzConfiguration {
            corpus_dir: local_dir.to_path_buf(),
            target_path: target,
            engine: build.engine.clone(),
            sanitizer: build.sanitizer.clone(),
        };
        self.runner.merge_corpus(&conf, remote_dir).await
    }
}

/// What to do with the staged local-only files after a merge run: files
/// the runner kept are pushed to remote, the rest are deleted locally.
/// Validates that the runner neither lost remote files nor invented new
/// ones.
fn merge_outcome(
    remote: &HashSet<String>,
    staged_local_only: &HashSet<String>,
    merged: &HashSet<String>,
) -> Result<(Vec<String>, Vec<String>)> {
    if !remote.is_subset(merged) {
        return Err(CommonError::MergeInvariant(
            "some remote files were lost during merge".into(),
        )
        .into());
    }
    let allowed: HashSet<String> = remote.union(staged_local_only).cloned().collect();
    if !merged.is_subset(&allowed) {
        return Err(CommonError::MergeInvariant(
            "unexpected files appeared in merge output".into(),
        )
        .into());
    }

    let mut push: Vec<String> = staged_local_only.intersection(merged).cloned().collect();
    let mut delete: Vec<String> = staged_local_only.difference(merged).cloned().collect();
    push.sort();
    delete.sort();
    Ok((push, delete))
}

#[async_trait]
impl BackgroundTask for CorpusMergingTask {
    fn name(&self) -> &str {
        "corpus-merging"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&mut self) -> Result<bool> {
        let mut weighted: Vec<WeightedHarness> = self
            .harness_weights
            .list_harnesses()
            .await?
            .into_iter()
            .filter(|wh| wh.weight > 0.0)
            .collect();
        if weighted.is_empty() {
            return Ok(false);
        }
        weighted.shuffle(&mut rand::thread_rng());

        let mut did_work = false;
        let mut failures = 0u32;
        for harness in weighted {
            let builds = self
                .builds
                .get_builds(&harness.task_id, BuildType::Fuzzer)
                .await?;
            if builds.is_empty() {
                continue;
            }
            match self.merge_corpus_for_harness(&harness, &builds).await {
                Ok(merged) => did_work |= merged,
                Err(e) => {
                    failures += 1;
                    warn!("Error running merge task: {e:#}");
                    // One transient failure per sweep is tolerated; a
                    // second aborts the sweep.
                    if failures > 1 {
                        bail!("multiple merge failures in one sweep: {e:#}");
                    }
                }
            }
        }
        Ok(did_work)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn coverage_adding_file_is_pushed_and_kept() {
        // Local has {aa, bb, cc}, remote has {aa, bb}; the runner kept cc.
        let remote = set(&["aa", "bb"]);
        let local_only = set(&["cc"]);
        let merged = set(&["aa", "bb", "cc"]);

        let (push, delete) = merge_outcome(&remote, &local_only, &merged).unwrap();
        assert_eq!(push, vec!["cc".to_string()]);
        assert!(delete.is_empty());
    }

    #[test]
    fn redundant_file_is_deleted_locally() {
        // The runner decided cc adds no coverage.
        let remote = set(&["aa", "bb"]);
        let local_only = set(&["cc"]);
        let merged = set(&["aa", "bb"]);

        let (push, delete) = merge_outcome(&remote, &local_only, &merged).unwrap();
        assert!(push.is_empty());
        assert_eq!(delete, vec!["cc".to_string()]);
    }

    #[test]
    fn losing_remote_files_violates_conservation() {
        let remote = set(&["aa", "bb"]);
        let local_only = set(&["cc"]);
        let merged = set(&["aa", "cc"]);
        assert!(merge_outcome(&remote, &local_only, &merged).is_err());
    }

    #[test]
    fn inventing_files_violates_conservation() {
        let remote = set(&["aa"]);
        let local_only = set(&["bb"]);
        let merged = set(&["aa", "bb", "zz"]);
        assert!(merge_outcome(&remote, &local_only, &merged).is_err());
    }
}

//! The fuzzer bot: draws a harness proportional to its weight, runs one
//! bounded fuzzing session over its corpus, and feeds new inputs and
//! crashes back into the pipeline.
//!
//! Weight zero suppresses a harness entirely. New corpus files are
//! content-hashed in place after each session; the merge driver decides
//! later which of them reach the remote corpus.

use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tracing::{debug, error, info};

use buttercup_common::challenge_task::ChallengeTask;
use buttercup_common::constants::ADDRESS_SANITIZER;
use buttercup_common::corpus::Corpus;
use buttercup_common::maps::{BuildMap, HarnessWeights};
use buttercup_common::messages::{BuildType, WeightedHarness};
use buttercup_common::{NodeLocal, TaskRegistry};

use crate::crash_intake::CrashIntake;
use crate::runner::{Conf, FuzzConfiguration, Runner};

pub struct FuzzerBot {
    registry: TaskRegistry,
    harness_weights: HarnessWeights,
    builds: BuildMap,
    crash_intake: CrashIntake,
    node_local: NodeLocal,
    tasks_storage: String,
    runner: Runner,
    session_time: Duration,
}

impl FuzzerBot {
    pub fn new(
        conn: redis::aio::ConnectionManager,
        crash_intake: CrashIntake,
        node_local: NodeLocal,
        tasks_storage: String,
        session_time: Duration,
    ) -> Self {
        Self {
            registry: TaskRegistry::new(conn.clone()),
            harness_weights: HarnessWeights::new(conn.clone()),
            builds: BuildMap::new(conn),
            crash_intake,
            node_local,
            tasks_storage,
            runner: Runner::new(Conf::default()),
            session_time,
        }
    }

    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<()> {
        info!("Fuzzer bot started");
        loop {
            if *shutdown.borrow() {
                info!("Fuzzer bot shutting down");
                return Ok(());
            }
            match self.fuzz_once().await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        () = tokio::time::sleep(Duration::from_secs(2)) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    error!("Fuzzing iteration failed: {e:#}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }

    /// One fuzzing session against one weighted harness. Returns false
    /// when there is nothing schedulable.
    pub async fn fuzz_once(&self) -> Result<bool> {
        let harnesses: Vec<WeightedHarness> = self
            .harness_weights
            .list_harnesses()
            .await?
            .into_iter()
            .filter(|wh| wh.weight > 0.0)
            .collect();
        let Some(harness) = pick_weighted(&harnesses, rand::thread_rng().gen::<f64>()) else {
            return Ok(false);
        };

        if self
            .registry
            .should_stop_processing(harness.task_id.as_str(), None)
            .await?
        {
            return Ok(false);
        }

        let builds = self
            .builds
            .get_builds(&harness.task_id, BuildType::Fuzzer)
            .await?;
        let Some(build) = builds
            .iter()
            .find(|b| b.sanitizer == ADDRESS_SANITIZER)
            .or_else(|| builds.first())
        else {
            debug!("No fuzzer build yet for task {}", harness.task_id);
            return Ok(false);
        };

        let local_build = self.node_local.local_path(&build.task_dir);
        self.node_local
            .remote_archive_to_dir(&local_build)
            .context("staging fuzzer build")?;
        let task = ChallengeTask::new(local_build);

        let scratch = self.node_local.scratch_dir()?;
        let rw = task.rw_copy(scratch.path())?;
        let target = rw.task().build_dir()?.join(&harness.harness_name);

        let corpus = Corpus::new(
            self.node_local.clone(),
            &self.tasks_storage,
            &harness.task_id,
            &harness.harness_name,
        )?;
        corpus.sync_from_remote()?;

        info!(
            "Fuzzing {} | {} for {}s",
            harness.task_id,
            harness.harness_name,
            self.session_time.as_secs()
        );
        let conf = FuzzConfiguration {
            corpus_dir: corpus.path().to_path_buf(),
            target_path: target,
            engine: build.engine.clone(),
            sanitizer: build.sanitizer.clone(),
        };
        let artifact_dir = self.node_local.scratch_dir()?;
        let result = self
            .runner
            .run_fuzzer(&conf, artifact_dir.path(), self.session_time)
            .await?;

        corpus.hash_new_corpus()?;

        if let Some(crash_input) = result.crash_input {
            let outcome = self
                .crash_intake
                .submit_crash(build, &harness.harness_name, &crash_input, &result.stderr)
                .await?;
            debug!(
                "Crash intake for {} | {}: {:?}",
                harness.task_id, harness.harness_name, outcome
            );
        }
        Ok(true)
    }
}

/// Pick a harness with probability proportional to its weight. `roll` is
/// a uniform sample in [0, 1).
fn pick_weighted(harnesses: &[WeightedHarness], roll: f64) -> Option<&WeightedHarness> {
    let total: f64 = harnesses.iter().map(|h| h.weight).sum();
    if total <= 0.0 {
        return None;
    }
    let mut remaining = roll * total;
    for harness in harnesses {
        remaining -= harness.weight;
        if remaining < 0.0 {
            return Some(harness);
        }
    }
    harnesses.last()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn harness(name: &str, weight: f64) -> WeightedHarness {
        WeightedHarness {
            task_id: "t1".into(),
            package_name: "libpng".into(),
            harness_name: name.into(),
            weight,
        }
    }

    #[test]
    fn selection_is_proportional_to_weight() {
        let harnesses = vec![harness("a", 1.0), harness("b", 3.0)];
        // total = 4: rolls below 0.25 land on a, the rest on b
        assert_eq!(
            pick_weighted(&harnesses, 0.1).unwrap().harness_name,
            "a"
        );
        assert_eq!(
            pick_weighted(&harnesses, 0.3).unwrap().harness_name,
            "b"
        );
        assert_eq!(
            pick_weighted(&harnesses, 0.99).unwrap().harness_name,
            "b"
        );
    }

    #[test]
    fn zero_total_weight_selects_nothing() {
        assert!(pick_weighted(&[], 0.5).is_none());
        assert!(pick_weighted(&[harness("a", 0.0)], 0.5).is_none());
    }

    #[test]
    fn zero_weight_harness_is_never_picked() {
        let harnesses = vec![harness("a", 0.0), harness("b", 1.0)];
        for roll in [0.0, 0.25, 0.5, 0.99] {
            assert_eq!(
                pick_weighted(&harnesses, roll).unwrap().harness_name,
                "b"
            );
        }
    }
}

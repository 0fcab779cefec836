//! The builder bot: build requests in, built challenges out.
//!
//! Each request names a (task, engine, sanitizer, build type) combination,
//! optionally with the task diff and a candidate patch to apply first. The
//! built challenge is committed locally with an atomic rename and published
//! to the shared filesystem as a `.tgz` archive so other nodes can stage it.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use buttercup_common::challenge_task::{BuildCacheKey, ChallengeTask};
use buttercup_common::constants::{group_names, queue_names, MAX_TRIES};
use buttercup_common::maps::BuildMap;
use buttercup_common::messages::{BuildOutput, BuildRequest};
use buttercup_common::queue::{QueueFactory, RQItem, ReliableQueue};
use buttercup_common::{NodeLocal, TaskRegistry};

/// What the builder decided to do with one queue item.
#[derive(Debug, PartialEq, Eq)]
enum ItemOutcome {
    /// Work finished (or is unsalvageable); the item was acked.
    Acked,
    /// Transient or data-not-ready failure; redelivery will retry.
    Retry,
}

pub struct BuilderBot {
    registry: TaskRegistry,
    build_map: BuildMap,
    requests: ReliableQueue<BuildRequest>,
    outputs: ReliableQueue<BuildOutput>,
    node_local: NodeLocal,
    work_dir: PathBuf,
    python_path: String,
    allow_caching: bool,
    allow_pull: bool,
}

impl BuilderBot {
    pub async fn new(
        conn: redis::aio::ConnectionManager,
        node_local: NodeLocal,
        work_dir: PathBuf,
        python_path: String,
        allow_caching: bool,
        allow_pull: bool,
    ) -> Result<Self> {
        let factory = QueueFactory::new(conn.clone());
        let requests = factory
            .create(queue_names::BUILDS, group_names::BUILDER)
            .await?;
        let outputs = factory.producer(queue_names::BUILD_OUTPUTS);
        Ok(Self {
            registry: TaskRegistry::new(conn.clone()),
            build_map: BuildMap::new(conn),
            requests,
            outputs,
            node_local,
            work_dir,
            python_path,
            allow_caching,
            allow_pull,
        })
    }

    /// Consume build requests until shutdown is signalled.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<()> {
        info!("Builder bot started, work dir {}", self.work_dir.display());
        let mut backoff = buttercup_common::queue::Backoff::default();
        loop {
            if *shutdown.borrow() {
                info!("Builder bot shutting down");
                return Ok(());
            }
            match self.serve_item().await {
                Ok(true) => backoff.reset(),
                Ok(false) => {
                    tokio::select! {
                        () = tokio::time::sleep(std::time::Duration::from_millis(500)) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    error!("Builder iteration failed: {e:#}");
                    backoff.wait().await;
                }
            }
        }
    }

    /// Handle one queue item. Returns false when the queue was empty.
    pub async fn serve_item(&self) -> Result<bool> {
        let Some(item) = self.requests.pop().await? else {
            return Ok(false);
        };
        let outcome = self.process(&item).await;
        match outcome {
            Ok(ItemOutcome::Acked) => {}
            Ok(ItemOutcome::Retry) => {
                debug!(
                    "Leaving build item {} for redelivery (delivered {} times)",
                    item.item_id, item.times_delivered
                );
            }
            Err(e) => {
                error!("Build of item {} failed: {e:#}", item.item_id);
                if item.times_delivered > MAX_TRIES {
                    warn!(
                        "Dropping build item {} after {} deliveries",
                        item.item_id, item.times_delivered
                    );
                    self.requests.ack(&item.item_id).await?;
                }
            }
        }
        Ok(true)
    }

    async fn process(&self, item: &RQItem<BuildRequest>) -> Result<ItemOutcome> {
        let request = &item.deserialized;

        if self
            .registry
            .should_stop_processing(request.task_id.as_str(), None)
            .await?
        {
            info!(
                "Task {} is cancelled or expired, dropping build request",
                request.task_id
            );
            self.requests.ack(&item.item_id).await?;
            return Ok(ItemOutcome::Acked);
        }

        // Stage the shared task directory onto this node.
        let local_task_dir = self.node_local.local_path(&request.task_dir);
        self.node_local
            .remote_archive_to_dir(&local_task_dir)
            .context("staging task directory")?;

        let mut task = ChallengeTask::new(local_task_dir).with_python_path(&self.python_path);
        if self.allow_caching {
            task = task.with_cache_dir(self.work_dir.join("build-cache"));
        }
        let meta = task.task_meta()?;

        let rw = task.rw_copy(&self.work_dir)?;

        // Patch application failures are deterministic; retry only covers
        // races on freshly staged inputs.
        let applied_diff_hash = if request.apply_diff {
            if !rw.task().apply_patch_diff().await? {
                warn!("Task diff failed to apply for {}", request.task_id);
                return self.give_up_or_retry(item).await;
            }
            self.diff_fingerprint(rw.task())?
        } else {
            String::new()
        };

        let patch_hash = if request.patch.is_empty() {
            String::new()
        } else {
            let mut patch_file = tempfile::NamedTempFile::new_in(&self.work_dir)?;
            patch_file.write_all(request.patch.as_bytes())?;
            patch_file.flush()?;
            if !rw.task().apply_patch_file(patch_file.path()).await? {
                warn!(
                    "Candidate patch failed to apply for {} (patch id {})",
                    request.task_id, request.internal_patch_id
                );
                return self.give_up_or_retry(item).await;
            }
            hex::encode(Sha256::digest(request.patch.as_bytes()))
        };

        let key = BuildCacheKey {
            task_id: request.task_id.clone(),
            project_name: meta.project_name,
            engine: request.engine.clone(),
            sanitizer: request.sanitizer.clone(),
            build_type: request.build_type,
            patch_hash,
            applied_diff_hash,
        };

        let result = rw
            .task()
            .build_fuzzers_with_cache(&key, self.allow_pull)
            .await?;
        if !result.success {
            error!(
                "Build failed for {} ({} | {}): {}",
                request.task_id, request.engine, request.sanitizer, result.error
            );
            return self.give_up_or_retry(item).await;
        }

        let final_dir = rw.commit()?;
        self.node_local
            .dir_to_remote_archive(&final_dir)
            .context("publishing built challenge")?;

        let output = BuildOutput {
            task_id: request.task_id.clone(),
            engine: request.engine.clone(),
            sanitizer: request.sanitizer.clone(),
            build_type: request.build_type,
            internal_patch_id: request.internal_patch_id.clone(),
            task_dir: self.node_local.remote_path(&final_dir)?,
        };
        self.build_map.add_build(&output).await?;
        self.outputs.push(&output).await?;
        self.requests.ack(&item.item_id).await?;
        info!(
            "Built {} | {} | {} ({})",
            request.task_id,
            request.engine,
            request.sanitizer,
            request.build_type.as_str()
        );
        Ok(ItemOutcome::Acked)
    }

    /// Deterministic failure: leave the item for redelivery while the
    /// retry budget lasts, then drop it.
    async fn give_up_or_retry(&self, item: &RQItem<BuildRequest>) -> Result<ItemOutcome> {
        if item.times_delivered > MAX_TRIES {
            warn!(
                "Giving up on build item {} after {} deliveries",
                item.item_id, item.times_delivered
            );
            self.requests.ack(&item.item_id).await?;
            return Ok(ItemOutcome::Acked);
        }
        Ok(ItemOutcome::Retry)
    }

    /// Stable hash of the task's diff files, part of the build cache key.
    fn diff_fingerprint(&self, task: &ChallengeTask) -> Result<String> {
        let diff_dir = task.diff_path();
        let mut hasher = Sha256::new();
        if diff_dir.exists() {
            let mut entries: Vec<_> = std::fs::read_dir(&diff_dir)?
                .filter_map(std::result::Result::ok)
                .map(|e| e.path())
                .collect();
            entries.sort();
            for path in entries {
                if path.is_file() {
                    hasher.update(std::fs::read(&path)?);
                }
            }
        }
        Ok(hex::encode(hasher.finalize()))
    }
}

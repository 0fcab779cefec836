//! Task ingestion: download, verify and stage challenge task sources.
//!
//! Tasks arrive on the tasks queue from the inbound webhook. The
//! downloader fetches each source archive, checks its digest, unpacks it
//! into the per-task directory on shared storage, publishes the directory
//! as an archive, and fans out the initial build requests.

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use buttercup_common::challenge_task::{TaskMeta, TASK_META_FILE};
use buttercup_common::constants::{
    group_names, queue_names, ADDRESS_SANITIZER, LIBFUZZER_ENGINE, MAX_TRIES,
};
use buttercup_common::messages::{BuildRequest, BuildType, SourceType, Task};
use buttercup_common::queue::{QueueFactory, RQItem, ReliableQueue};
use buttercup_common::{NodeLocal, TaskRegistry};

pub struct Downloader {
    registry: TaskRegistry,
    tasks: ReliableQueue<Task>,
    builds: ReliableQueue<BuildRequest>,
    node_local: NodeLocal,
    tasks_storage: String,
    http: reqwest::Client,
    sanitizers: Vec<String>,
}

impl Downloader {
    pub async fn new(
        conn: redis::aio::ConnectionManager,
        node_local: NodeLocal,
        tasks_storage: String,
        sanitizers: Vec<String>,
    ) -> Result<Self> {
        let factory = QueueFactory::new(conn.clone());
        let tasks = factory
            .create(queue_names::TASKS, group_names::DOWNLOADER)
            .await?;
        let builds = factory.producer(queue_names::BUILDS);
        Ok(Self {
            registry: TaskRegistry::new(conn),
            tasks,
            builds,
            node_local,
            tasks_storage,
            http: reqwest::Client::new(),
            sanitizers,
        })
    }

    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<()> {
        info!("Task downloader started");
        let mut backoff = buttercup_common::queue::Backoff::default();
        loop {
            if *shutdown.borrow() {
                info!("Task downloader shutting down");
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
                    error!("Downloader iteration failed: {e:#}");
                    backoff.wait().await;
                }
            }
        }
    }

    pub async fn serve_item(&self) -> Result<bool> {
        let Some(item) = self.tasks.pop().await? else {
            return Ok(false);
        };
        if let Err(e) = self.ingest(&item).await {
            error!(
                "Ingesting task {} failed: {e:#}",
                item.deserialized.task_id
            );
            if item.times_delivered > MAX_TRIES {
                warn!(
                    "Dropping task item {} after {} deliveries",
                    item.item_id, item.times_delivered
                );
                self.tasks.ack(&item.item_id).await?;
                self.registry.mark_errored(&item.deserialized).await?;
            }
        }
        Ok(true)
    }

    async fn ingest(&self, item: &RQItem<Task>) -> Result<()> {
        let task = &item.deserialized;

        // The record may not exist yet, so check cancellation and expiry
        // directly rather than via should_stop_processing.
        if self.registry.is_cancelled(task).await? || TaskRegistry::is_expired(task, 0) {
            info!("Task {} is cancelled or expired, skipping ingest", task.task_id);
            self.tasks.ack(&item.item_id).await?;
            return Ok(());
        }

        self.registry.set(task).await?;

        let task_dir = self
            .node_local
            .root()
            .join(&self.tasks_storage)
            .join(&task.task_id);
        fs::create_dir_all(&task_dir)?;

        for source in &task.sources {
            let dest = task_dir.join(source_subdir(source.source_type));
            if dest.exists() {
                // Already staged by a prior delivery
                continue;
            }
            self.fetch_source(&source.url, &source.sha256, &dest)
                .await
                .with_context(|| format!("fetching {}", source.url))?;
        }

        let meta = TaskMeta {
            task_id: task.task_id.clone(),
            project_name: task.project_name.clone(),
            focus: task.focus.clone(),
            task_type: task.task_type,
            metadata: task.metadata.clone(),
        };
        fs::write(task_dir.join(TASK_META_FILE), serde_json::to_vec(&meta)?)?;

        self.node_local
            .dir_to_remote_archive(&task_dir)
            .context("publishing task directory")?;

        // Mid-download cancellations still drop the task before any build
        // work is queued.
        if self
            .registry
            .should_stop_processing(task.task_id.as_str(), None)
            .await?
        {
            info!("Task {} cancelled during ingest, not dispatching builds", task.task_id);
            self.tasks.ack(&item.item_id).await?;
            return Ok(());
        }

        let remote_task_dir = self.node_local.remote_path(&task_dir)?;
        self.dispatch_builds(task, &remote_task_dir).await?;
        self.tasks.ack(&item.item_id).await?;
        info!("Task {} ingested and ready", task.task_id);
        Ok(())
    }

    /// Download a source archive, verify its digest and unpack it.
    async fn fetch_source(&self, url: &str, expected_sha256: &str, dest: &Path) -> Result<()> {
        let response = self.http.get(url).send().await?.error_for_status()?;
        let bytes = response.bytes().await?;

        let digest = hex::encode(Sha256::digest(&bytes));
        if !digest.eq_ignore_ascii_case(expected_sha256) {
            bail!(
                "digest mismatch for {}: expected {}, got {}",
                url,
                expected_sha256,
                digest
            );
        }

        let mut archive_file = tempfile::NamedTempFile::new()?;
        archive_file.write_all(&bytes)?;
        archive_file.flush()?;

        // Unpack on the destination filesystem so the final rename stays
        // atomic.
        let unpack_tmp = self.node_local.scratch_dir()?;
        let file = fs::File::open(archive_file.path())?;
        let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(file));
        tar.unpack(unpack_tmp.path())?;

        fs::create_dir_all(dest.parent().context("source dest has no parent")?)?;
        fs::rename(unpack_tmp.commit(), dest)?;
        Ok(())
    }

    /// Fan out the initial builds: one fuzzer build per sanitizer plus the
    /// tracer and coverage builds.
    async fn dispatch_builds(&self, task: &Task, remote_task_dir: &Path) -> Result<()> {
        let apply_diff = task
            .sources
            .iter()
            .any(|s| s.source_type == SourceType::Diff);

        for sanitizer in &self.sanitizers {
            self.builds
                .push(&BuildRequest {
                    task_id: task.task_id.clone(),
                    engine: LIBFUZZER_ENGINE.to_string(),
                    sanitizer: sanitizer.clone(),
                    build_type: BuildType::Fuzzer,
                    task_dir: remote_task_dir.to_path_buf(),
                    apply_diff,
                    patch: String::new(),
                    internal_patch_id: String::new(),
                })
                .await?;
        }
        for build_type in [BuildType::Tracer, BuildType::Coverage] {
            self.builds
                .push(&BuildRequest {
                    task_id: task.task_id.clone(),
                    engine: LIBFUZZER_ENGINE.to_string(),
                    sanitizer: ADDRESS_SANITIZER.to_string(),
                    build_type,
                    task_dir: remote_task_dir.to_path_buf(),
                    apply_diff,
                    patch: String::new(),
                    internal_patch_id: String::new(),
                })
                .await?;
        }
        Ok(())
    }
}

fn source_subdir(source_type: SourceType) -> &'static str {
    match source_type {
        SourceType::Repo => "src",
        SourceType::FuzzTooling => "fuzz-tooling",
        SourceType::Diff => "diff",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_types_map_to_task_layout() {
        assert_eq!(source_subdir(SourceType::Repo), "src");
        assert_eq!(source_subdir(SourceType::FuzzTooling), "fuzz-tooling");
        assert_eq!(source_subdir(SourceType::Diff), "diff");
    }
}

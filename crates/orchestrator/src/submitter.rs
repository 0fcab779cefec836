//! The submission driver.
//!
//! Drains confirmed vulnerabilities and successful patches into the
//! competition API: PoV first, then the patch once its PoV is on file,
//! then the bundle tying them together. Transient API failures retry with
//! backoff until the task's adjusted deadline.

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use anyhow::{Context, Result};

use buttercup_common::constants::{group_names, queue_names, MAX_TRIES};
use buttercup_common::messages::{ConfirmedVulnerability, Patch, Task};
use buttercup_common::queue::{QueueFactory, ReliableQueue};
use buttercup_common::{NodeLocal, TaskRegistry};

use crate::competition_api::{
    ApiError, BundleSubmission, CompetitionApiClient, PatchSubmission, PovSubmission,
    SubmissionStatus,
};

/// Per-vulnerability submission progress, persisted so restarts resume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SubmissionEntry {
    pov_id: Option<String>,
    pov_status: Option<SubmissionStatus>,
    patch_id: Option<String>,
    bundle_id: Option<String>,
}

fn submissions_key(task_id: &str) -> String {
    format!("submissions:{}", task_id.to_lowercase())
}

pub struct Submitter {
    conn: ConnectionManager,
    registry: TaskRegistry,
    vulnerabilities: ReliableQueue<ConfirmedVulnerability>,
    patches: ReliableQueue<Patch>,
    api: CompetitionApiClient,
    node_local: NodeLocal,
}

impl Submitter {
    pub async fn new(
        conn: ConnectionManager,
        node_local: NodeLocal,
        api: CompetitionApiClient,
    ) -> Result<Self> {
        let factory = QueueFactory::new(conn.clone());
        let vulnerabilities = factory
            .create(
                queue_names::CONFIRMED_VULNERABILITIES,
                group_names::SUBMITTER,
            )
            .await?;
        let patches = factory
            .create(queue_names::PATCHES, group_names::SUBMITTER)
            .await?;
        Ok(Self {
            registry: TaskRegistry::new(conn.clone()),
            conn,
            vulnerabilities,
            patches,
            api,
            node_local,
        })
    }

    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<()> {
        info!("Submission driver started");
        let mut backoff = buttercup_common::queue::Backoff::default();
        loop {
            if *shutdown.borrow() {
                info!("Submission driver shutting down");
                return Ok(());
            }
            let mut did_work = false;
            match self.serve_vulnerability().await {
                Ok(worked) => did_work |= worked,
                Err(e) => error!("PoV submission pass failed: {e:#}"),
            }
            match self.serve_patch().await {
                Ok(worked) => did_work |= worked,
                Err(e) => error!("Patch submission pass failed: {e:#}"),
            }
            if let Err(e) = self.poll_pov_statuses().await {
                error!("PoV status poll failed: {e:#}");
            }
            if did_work {
                backoff.reset();
            } else {
                tokio::select! {
                    () = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }

    /// Submit one confirmed vulnerability's PoV.
    pub async fn serve_vulnerability(&self) -> Result<bool> {
        let Some(item) = self.vulnerabilities.pop().await? else {
            return Ok(false);
        };
        let vulnerability = &item.deserialized;
        let Some(task_id) = vulnerability.task_id().map(str::to_string) else {
            warn!("Confirmed vulnerability without crashes, dropping");
            self.vulnerabilities.ack(&item.item_id).await?;
            return Ok(true);
        };

        if self
            .registry
            .should_stop_processing(task_id.as_str(), None)
            .await?
        {
            info!("Task {} is done, dropping PoV submission", task_id);
            self.vulnerabilities.ack(&item.item_id).await?;
            return Ok(true);
        }

        let mut entry = self
            .load_entry(&task_id, &vulnerability.internal_patch_id)
            .await?;
        if entry.pov_id.is_some() {
            // Already submitted by a prior delivery
            self.vulnerabilities.ack(&item.item_id).await?;
            return Ok(true);
        }

        let traced = &vulnerability.crashes[0];
        let pov_local = self
            .node_local
            .make_locally_available(&traced.crash.crash_input_path)
            .context("staging PoV for submission")?;
        let testcase = std::fs::read(&pov_local)?;

        let submission = PovSubmission {
            architecture: "x86_64".to_string(),
            engine: traced.crash.target.engine.clone(),
            fuzzer_name: traced.crash.harness_name.clone(),
            sanitizer: traced.crash.target.sanitizer.clone(),
            testcase: CompetitionApiClient::encode_payload(&testcase),
        };

        match self.api.submit_pov(&task_id, &submission).await {
            Ok(response) => {
                info!(
                    "Submitted PoV for task {} patch line {}: {} ({:?})",
                    task_id, vulnerability.internal_patch_id, response.pov_id, response.status
                );
                entry.pov_id = Some(response.pov_id);
                entry.pov_status = Some(response.status);
                self.store_entry(&task_id, &vulnerability.internal_patch_id, &entry)
                    .await?;
                self.vulnerabilities.ack(&item.item_id).await?;
            }
            Err(e) => {
                self.handle_api_failure(&task_id, &e, &item.item_id, item.times_delivered, || {
                    self.vulnerabilities.ack(&item.item_id)
                })
                .await?;
            }
        }
        Ok(true)
    }

    /// Submit one successful patch and bundle it with its PoV.
    pub async fn serve_patch(&self) -> Result<bool> {
        let Some(item) = self.patches.pop().await? else {
            return Ok(false);
        };
        let patch = &item.deserialized;

        if self
            .registry
            .should_stop_processing(patch.task_id.as_str(), None)
            .await?
        {
            info!("Task {} is done, dropping patch submission", patch.task_id);
            self.patches.ack(&item.item_id).await?;
            return Ok(true);
        }

        let mut entry = self
            .load_entry(&patch.task_id, &patch.internal_patch_id)
            .await?;
        let Some(pov_id) = entry.pov_id.clone() else {
            // Data-not-ready: the PoV has not been submitted yet.
            debug!(
                "No PoV on file yet for task {} patch line {}, retrying later",
                patch.task_id, patch.internal_patch_id
            );
            return Ok(false);
        };

        if entry.patch_id.is_none() {
            let submission = PatchSubmission {
                patch: CompetitionApiClient::encode_payload(patch.patch.as_bytes()),
            };
            match self.api.submit_patch(&patch.task_id, &submission).await {
                Ok(response) => {
                    info!(
                        "Submitted patch for task {} patch line {}: {} ({:?})",
                        patch.task_id, patch.internal_patch_id, response.patch_id, response.status
                    );
                    entry.patch_id = Some(response.patch_id);
                    self.store_entry(&patch.task_id, &patch.internal_patch_id, &entry)
                        .await?;
                }
                Err(e) => {
                    self.handle_api_failure(
                        &patch.task_id,
                        &e,
                        &item.item_id,
                        item.times_delivered,
                        || self.patches.ack(&item.item_id),
                    )
                    .await?;
                    return Ok(true);
                }
            }
        }

        if entry.bundle_id.is_none() {
            let bundle = BundleSubmission {
                pov_id: Some(pov_id),
                patch_id: entry.patch_id.clone(),
                ..BundleSubmission::default()
            };
            match self.api.submit_bundle(&patch.task_id, &bundle).await {
                Ok(response) => {
                    info!(
                        "Submitted bundle for task {}: {}",
                        patch.task_id, response.bundle_id
                    );
                    entry.bundle_id = Some(response.bundle_id);
                    self.store_entry(&patch.task_id, &patch.internal_patch_id, &entry)
                        .await?;
                    self.registry.mark_successful(patch.task_id.as_str()).await?;
                }
                Err(e) => {
                    self.handle_api_failure(
                        &patch.task_id,
                        &e,
                        &item.item_id,
                        item.times_delivered,
                        || self.patches.ack(&item.item_id),
                    )
                    .await?;
                    return Ok(true);
                }
            }
        }

        self.patches.ack(&item.item_id).await?;
        Ok(true)
    }

    /// Refresh the status of accepted PoVs.
    async fn poll_pov_statuses(&self) -> Result<()> {
        for task in self.registry.live_tasks().await? {
            let key = submissions_key(&task.task_id);
            let mut conn = self.conn.clone();
            let entries: Vec<(String, Vec<u8>)> = conn.hgetall(&key).await?;
            for (patch_line, bytes) in entries {
                let Ok(mut entry) = serde_json::from_slice::<SubmissionEntry>(&bytes) else {
                    continue;
                };
                let Some(pov_id) = entry.pov_id.clone() else {
                    continue;
                };
                if entry.pov_status.is_some_and(SubmissionStatus::is_terminal) {
                    continue;
                }
                match self.api.pov_status(&task.task_id, &pov_id).await {
                    Ok(response) => {
                        if entry.pov_status != Some(response.status) {
                            info!(
                                "PoV {} for task {} moved to {:?}",
                                pov_id, task.task_id, response.status
                            );
                            entry.pov_status = Some(response.status);
                            self.store_entry(&task.task_id, &patch_line, &entry).await?;
                        }
                    }
                    Err(e) => debug!("PoV status check failed for {}: {}", pov_id, e),
                }
            }
        }
        Ok(())
    }

    /// Whether the submission window is still open: original deadline
    /// duration measured from the webhook delivery, re-anchored at now.
    fn within_submission_window(task: &Task) -> bool {
        let budget_ms = task.deadline - task.message_time;
        let now = Utc::now().timestamp_millis();
        now < task.message_time + budget_ms.max(0) && now < task.deadline
    }

    /// Decide between retrying (leave unacked) and dropping the item.
    async fn handle_api_failure<F, Fut>(
        &self,
        task_id: &str,
        error: &ApiError,
        item_id: &str,
        times_delivered: u64,
        ack: F,
    ) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = buttercup_common::Result<()>>,
    {
        warn!("Competition API call failed for task {}: {}", task_id, error);
        let window_open = match self.registry.get(task_id).await? {
            Some(task) => Self::within_submission_window(&task),
            None => false,
        };
        if !window_open || times_delivered > MAX_TRIES * 10 {
            warn!(
                "Dropping submission item {} for task {} (window open: {})",
                item_id, task_id, window_open
            );
            ack().await?;
            self.registry.mark_errored(task_id).await?;
        }
        Ok(())
    }

    async fn load_entry(&self, task_id: &str, patch_line: &str) -> Result<SubmissionEntry> {
        let mut conn = self.conn.clone();
        let bytes: Option<Vec<u8>> = conn.hget(submissions_key(task_id), patch_line).await?;
        Ok(bytes
            .and_then(|b| serde_json::from_slice(&b).ok())
            .unwrap_or_default())
    }

    async fn store_entry(
        &self,
        task_id: &str,
        patch_line: &str,
        entry: &SubmissionEntry,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let bytes = serde_json::to_vec(entry)?;
        let _: () = conn.hset(submissions_key(task_id), patch_line, bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submission_window_respects_deadline() {
        let now = Utc::now().timestamp_millis();
        let open = Task {
            task_id: "t1".into(),
            message_time: now - 60_000,
            deadline: now + 3_600_000,
            ..Task::default()
        };
        assert!(Submitter::within_submission_window(&open));

        let closed = Task {
            task_id: "t2".into(),
            message_time: now - 7_200_000,
            deadline: now - 60_000,
            ..Task::default()
        };
        assert!(!Submitter::within_submission_window(&closed));
    }

    #[test]
    fn entry_round_trips() {
        let entry = SubmissionEntry {
            pov_id: Some("pov1".into()),
            pov_status: Some(SubmissionStatus::Accepted),
            patch_id: None,
            bundle_id: None,
        };
        let bytes = serde_json::to_vec(&entry).unwrap();
        let back: SubmissionEntry = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.pov_id.as_deref(), Some("pov1"));
        assert_eq!(back.pov_status, Some(SubmissionStatus::Accepted));
    }
}

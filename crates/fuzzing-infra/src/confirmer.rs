//! The confirmer: traced crashes in, confirmed vulnerabilities out.
//!
//! Traced crashes are fingerprinted on their tracer stack trace. The first
//! crash with a new token becomes a `ConfirmedVulnerability` with a fresh
//! internal patch id; later crashes with the same token are duplicates and
//! are dropped after being filed in the crash directory for PoV variants.

use anyhow::{Context, Result};
use redis::AsyncCommands;
use tracing::{error, info, warn};

use buttercup_common::constants::{group_names, queue_names, MAX_TRIES};
use buttercup_common::corpus::CrashDir;
use buttercup_common::messages::{ConfirmedVulnerability, TracedCrash};
use buttercup_common::queue::{QueueFactory, RQItem, ReliableQueue};
use buttercup_common::stacktrace::{crash_token, CrashSet};
use buttercup_common::{NodeLocal, TaskRegistry};

/// Counter key for assigning internal patch ids per task.
fn patch_id_counter_key(task_id: &str) -> String {
    format!("internal_patch_id:{}", task_id.to_lowercase())
}

pub struct Confirmer {
    conn: redis::aio::ConnectionManager,
    registry: TaskRegistry,
    confirmed_tokens: CrashSet,
    traced: ReliableQueue<TracedCrash>,
    confirmed: ReliableQueue<ConfirmedVulnerability>,
    node_local: NodeLocal,
    tasks_storage: String,
}

impl Confirmer {
    pub async fn new(
        conn: redis::aio::ConnectionManager,
        node_local: NodeLocal,
        tasks_storage: String,
    ) -> Result<Self> {
        let factory = QueueFactory::new(conn.clone());
        let traced = factory
            .create(queue_names::TRACED_VULNERABILITIES, group_names::CONFIRMER)
            .await?;
        let confirmed = factory.producer(queue_names::CONFIRMED_VULNERABILITIES);
        Ok(Self {
            registry: TaskRegistry::new(conn.clone()),
            confirmed_tokens: CrashSet::with_prefix(conn.clone(), "confirmed_tokens"),
            conn,
            traced,
            confirmed,
            node_local,
            tasks_storage,
        })
    }

    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<()> {
        info!("Confirmer started");
        let mut backoff = buttercup_common::queue::Backoff::default();
        loop {
            if *shutdown.borrow() {
                info!("Confirmer shutting down");
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
                    error!("Confirmer iteration failed: {e:#}");
                    backoff.wait().await;
                }
            }
        }
    }

    pub async fn serve_item(&self) -> Result<bool> {
        let Some(item) = self.traced.pop().await? else {
            return Ok(false);
        };
        if let Err(e) = self.confirm(&item).await {
            error!("Confirming item {} failed: {e:#}", item.item_id);
            if item.times_delivered > MAX_TRIES {
                warn!(
                    "Dropping traced crash {} after {} deliveries",
                    item.item_id, item.times_delivered
                );
                self.traced.ack(&item.item_id).await?;
            }
        }
        Ok(true)
    }

    async fn confirm(&self, item: &RQItem<TracedCrash>) -> Result<()> {
        let traced = &item.deserialized;
        let task_id = traced.crash.target.task_id.clone();

        if self
            .registry
            .should_stop_processing(task_id.as_str(), None)
            .await?
        {
            info!("Task {} is cancelled or expired, dropping traced crash", task_id);
            self.traced.ack(&item.item_id).await?;
            return Ok(());
        }

        let token = crash_token(&traced.tracer_stacktrace);

        // File the input so the patcher can replay related variants.
        let pov = self
            .node_local
            .make_locally_available(&traced.crash.crash_input_path)
            .context("staging crash input")?;
        let crash_dir = CrashDir::new(
            self.node_local.clone(),
            &self.tasks_storage,
            &task_id,
            &traced.crash.harness_name,
        )?;
        crash_dir.store(&token, &traced.crash.target.sanitizer, &pov)?;

        let already_known = self.confirmed_tokens.add(&task_id, &token).await?;
        if already_known {
            info!(
                "Duplicate vulnerability (token {}) for task {}, dropping",
                &token[..12],
                task_id
            );
            self.traced.ack(&item.item_id).await?;
            return Ok(());
        }

        let mut conn = self.conn.clone();
        let patch_seq: i64 = conn.incr(patch_id_counter_key(&task_id), 1).await?;
        let vulnerability = ConfirmedVulnerability {
            internal_patch_id: patch_seq.to_string(),
            crashes: vec![traced.clone()],
        };
        self.confirmed.push(&vulnerability).await?;
        self.traced.ack(&item.item_id).await?;
        info!(
            "Confirmed vulnerability {} for task {} (token {})",
            patch_seq,
            task_id,
            &token[..12]
        );
        Ok(())
    }
}

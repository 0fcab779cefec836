//! Supervised background tasks for the scheduler.
//!
//! Each task runs on its own tokio task with its own shutdown signal and
//! an interval pacing. A failing execution is logged and counted but never
//! takes down the task loop or its peers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A periodically executed maintenance task.
#[async_trait]
pub trait BackgroundTask: Send + 'static {
    fn name(&self) -> &str;
    fn interval(&self) -> Duration;

    /// One execution. Returns true when work was done.
    async fn execute(&mut self) -> Result<bool>;
}

/// Point-in-time status of one background task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub name: String,
    pub interval_seconds: f64,
    pub running: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
}

struct TaskHandle {
    name: String,
    status: Arc<Mutex<TaskStatus>>,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

/// Owns and supervises the registered background tasks.
#[derive(Default)]
pub struct BackgroundTaskManager {
    handles: Vec<TaskHandle>,
}

impl BackgroundTaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register and start a background task.
    pub fn start(&mut self, mut task: Box<dyn BackgroundTask>) {
        let name = task.name().to_string();
        let interval = task.interval();
        let status = Arc::new(Mutex::new(TaskStatus {
            name: name.clone(),
            interval_seconds: interval.as_secs_f64(),
            running: true,
            last_run: None,
            run_count: 0,
            error_count: 0,
            last_error: None,
        }));
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let loop_status = Arc::clone(&status);
        let loop_name = name.clone();
        let join = tokio::spawn(async move {
            info!("Starting background task: {}", loop_name);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("Stopping background task: {}", loop_name);
                            loop_status.lock().await.running = false;
                            return;
                        }
                    }
                }
                let started = std::time::Instant::now();
                match task.execute().await {
                    Ok(did_work) => {
                        let mut s = loop_status.lock().await;
                        s.last_run = Some(Utc::now());
                        s.run_count += 1;
                        drop(s);
                        debug!(
                            "Background task '{}' completed in {:.2}s ({})",
                            loop_name,
                            started.elapsed().as_secs_f64(),
                            if did_work { "did work" } else { "no work" }
                        );
                    }
                    Err(e) => {
                        let mut s = loop_status.lock().await;
                        s.error_count += 1;
                        s.last_error = Some(format!("{e:#}"));
                        drop(s);
                        error!("Error in background task '{}': {e:#}", loop_name);
                    }
                }
            }
        });

        self.handles.push(TaskHandle {
            name,
            status,
            shutdown: shutdown_tx,
            join,
        });
    }

    /// Signal every task to stop and wait for the loops to exit.
    pub async fn stop_all(self) {
        info!("Stopping {} background tasks", self.handles.len());
        for handle in &self.handles {
            let _ = handle.shutdown.send(true);
        }
        for handle in self.handles {
            if tokio::time::timeout(Duration::from_secs(5), handle.join)
                .await
                .is_err()
            {
                warn!("Background task '{}' did not stop cleanly", handle.name);
            }
        }
    }

    /// Status snapshot of every registered task.
    pub async fn status(&self) -> Vec<TaskStatus> {
        let mut out = Vec::with_capacity(self.handles.len());
        for handle in &self.handles {
            out.push(handle.status.lock().await.clone());
        }
        out
    }

    /// Log one line per task, warning for loops that stopped.
    pub async fn log_status(&self) {
        for status in self.status().await {
            if status.running {
                info!(
                    "Background task '{}': runs={}, errors={}, last_run={:?}",
                    status.name, status.run_count, status.error_count, status.last_run
                );
            } else {
                warn!("Background task '{}' is not running", status.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingTask {
        runs: Arc<AtomicU64>,
        fail: bool,
    }

    #[async_trait]
    impl BackgroundTask for CountingTask {
        fn name(&self) -> &str {
            "counting"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(5)
        }

        async fn execute(&mut self) -> Result<bool> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("boom");
            }
            Ok(true)
        }
    }

    #[tokio::test]
    async fn task_runs_on_interval_and_stops() {
        let runs = Arc::new(AtomicU64::new(0));
        let mut manager = BackgroundTaskManager::new();
        manager.start(Box::new(CountingTask {
            runs: Arc::clone(&runs),
            fail: false,
        }));

        tokio::time::sleep(Duration::from_millis(40)).await;
        let status = manager.status().await;
        assert_eq!(status.len(), 1);
        assert!(status[0].run_count >= 2);
        assert_eq!(status[0].error_count, 0);

        manager.stop_all().await;
        let after = runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after);
    }

    #[tokio::test]
    async fn failures_are_counted_not_fatal() {
        let runs = Arc::new(AtomicU64::new(0));
        let mut manager = BackgroundTaskManager::new();
        manager.start(Box::new(CountingTask {
            runs: Arc::clone(&runs),
            fail: true,
        }));

        tokio::time::sleep(Duration::from_millis(40)).await;
        let status = manager.status().await;
        assert!(status[0].error_count >= 2);
        assert!(status[0].running);
        assert_eq!(status[0].last_error.as_deref(), Some("boom"));
        manager.stop_all().await;
    }
}

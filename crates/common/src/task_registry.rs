//! Task records and lifecycle sets on the shared key/value store.
//!
//! Task records live in a hash keyed by lowercase task id. The cancelled /
//! succeeded / errored states live in separate sets; the cancelled set is
//! authoritative and overrides the informational flag on the stored record
//! on every read.

use std::collections::HashSet;

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

use crate::constants::{
    CANCELLED_TASKS_SET, ERRORED_TASKS_SET, SUCCEEDED_TASKS_SET, TASKS_HASH,
};
use crate::error::Result;
use crate::messages::Task;

/// Anything that names a task: the record itself or a bare id.
pub trait TaskId {
    fn id(&self) -> &str;
}

impl TaskId for Task {
    fn id(&self) -> &str {
        &self.task_id
    }
}

impl TaskId for str {
    fn id(&self) -> &str {
        self
    }
}

impl TaskId for String {
    fn id(&self) -> &str {
        self
    }
}

#[derive(Clone)]
pub struct TaskRegistry {
    conn: ConnectionManager,
    hash_name: String,
}

impl TaskRegistry {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            hash_name: TASKS_HASH.to_string(),
        }
    }

    /// Use a non-default hash, e.g. to isolate tests.
    pub fn with_hash_name(conn: ConnectionManager, hash_name: &str) -> Self {
        Self {
            conn,
            hash_name: hash_name.to_string(),
        }
    }

    /// Store or replace a task record. Keys compare case-insensitively.
    pub async fn set(&self, task: &Task) -> Result<()> {
        let bytes = serde_json::to_vec(task)?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(&self.hash_name, task.task_id.to_lowercase(), bytes)
            .await?;
        Ok(())
    }

    /// Fetch a task, overlaying the authoritative cancelled state from the
    /// cancelled set.
    pub async fn get(&self, task_id: &str) -> Result<Option<Task>> {
        let mut conn = self.conn.clone();
        let bytes: Option<Vec<u8>> = conn.hget(&self.hash_name, task_id.to_lowercase()).await?;
        let Some(bytes) = bytes else {
            return Ok(None);
        };
        let mut task: Task = serde_json::from_slice(&bytes)?;
        task.cancelled = self.is_cancelled(task_id).await?;
        Ok(Some(task))
    }

    /// Remove the record and its membership in every status set, atomically.
    pub async fn delete(&self, task_id: &str) -> Result<()> {
        let id = task_id.to_lowercase();
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .hdel(&self.hash_name, &id)
            .srem(CANCELLED_TASKS_SET, &id)
            .srem(SUCCEEDED_TASKS_SET, &id)
            .srem(ERRORED_TASKS_SET, &id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn mark_cancelled(&self, task: &(impl TaskId + ?Sized)) -> Result<()> {
        self.add_to_set(CANCELLED_TASKS_SET, task.id()).await
    }

    pub async fn mark_successful(&self, task: &(impl TaskId + ?Sized)) -> Result<()> {
        self.add_to_set(SUCCEEDED_TASKS_SET, task.id()).await
    }

    pub async fn mark_errored(&self, task: &(impl TaskId + ?Sized)) -> Result<()> {
        self.add_to_set(ERRORED_TASKS_SET, task.id()).await
    }

    pub async fn is_cancelled(&self, task: &(impl TaskId + ?Sized)) -> Result<bool> {
        self.in_set(CANCELLED_TASKS_SET, task.id()).await
    }

    pub async fn is_successful(&self, task: &(impl TaskId + ?Sized)) -> Result<bool> {
        self.in_set(SUCCEEDED_TASKS_SET, task.id()).await
    }

    pub async fn is_errored(&self, task: &(impl TaskId + ?Sized)) -> Result<bool> {
        self.in_set(ERRORED_TASKS_SET, task.id()).await
    }

    /// All cancelled task ids, for callers that poll in a tight loop and
    /// want one round-trip per sweep.
    pub async fn cancelled_ids(&self) -> Result<HashSet<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(CANCELLED_TASKS_SET).await?;
        Ok(members.into_iter().collect())
    }

    /// Whether `now + delta_seconds` is past the deadline. A positive
    /// delta asks "will this task still be usable in delta seconds"
    /// (a runway check); a negative delta asks whether the task expired
    /// at least that long ago.
    pub fn is_expired(task: &Task, delta_seconds: i64) -> bool {
        let now = Utc::now().timestamp_millis();
        now + delta_seconds * 1000 >= task.deadline
    }

    /// Whether a worker should drop this task: cancelled (directly or via a
    /// caller-supplied cached set) or expired. A missing record also stops
    /// processing.
    pub async fn should_stop_processing(
        &self,
        task: &(impl TaskId + ?Sized),
        cancelled_ids: Option<&HashSet<String>>,
    ) -> Result<bool> {
        let id = task.id().to_lowercase();
        let cancelled = match cancelled_ids {
            Some(cached) => cached.contains(&id),
            None => self.is_cancelled(id.as_str()).await?,
        };
        if cancelled {
            return Ok(true);
        }
        match self.get(&id).await? {
            Some(record) => Ok(Self::is_expired(&record, 0)),
            None => {
                debug!("Task {} has no record, stopping processing", id);
                Ok(true)
            }
        }
    }

    /// Every stored task, regardless of state.
    pub async fn all_tasks(&self) -> Result<Vec<Task>> {
        let mut conn = self.conn.clone();
        let entries: Vec<(String, Vec<u8>)> = conn.hgetall(&self.hash_name).await?;
        let mut tasks = Vec::with_capacity(entries.len());
        for (_, bytes) in entries {
            tasks.push(serde_json::from_slice(&bytes)?);
        }
        Ok(tasks)
    }

    /// Tasks that are neither cancelled nor expired.
    pub async fn live_tasks(&self) -> Result<Vec<Task>> {
        let cancelled = self.cancelled_ids().await?;
        let tasks = self.all_tasks().await?;
        Ok(tasks
            .into_iter()
            .filter(|t| !cancelled.contains(&t.task_id.to_lowercase()))
            .filter(|t| !Self::is_expired(t, 0))
            .collect())
    }

    pub async fn len(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.hlen(&self.hash_name).await?)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn contains(&self, task_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn
            .hexists(&self.hash_name, task_id.to_lowercase())
            .await?)
    }

    async fn add_to_set(&self, set: &str, task_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(set, task_id.to_lowercase()).await?;
        Ok(())
    }

    async fn in_set(&self, set: &str, task_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.sismember(set, task_id.to_lowercase()).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_with_deadline(deadline: i64) -> Task {
        Task {
            task_id: "t1".to_string(),
            deadline,
            ..Task::default()
        }
    }

    #[test]
    fn expired_when_deadline_passed() {
        let task = task_with_deadline(Utc::now().timestamp_millis() - 1000);
        assert!(TaskRegistry::is_expired(&task, 0));
    }

    #[test]
    fn not_expired_before_deadline() {
        let task = task_with_deadline(Utc::now().timestamp_millis() + 3_600_000);
        assert!(!TaskRegistry::is_expired(&task, 0));
    }

    #[test]
    fn positive_delta_expires_earlier() {
        // Deadline is one minute out; pretending we need two minutes of
        // runway makes the task unusable now.
        let task = task_with_deadline(Utc::now().timestamp_millis() + 60_000);
        assert!(TaskRegistry::is_expired(&task, 120));
        assert!(!TaskRegistry::is_expired(&task, -120));
    }

    #[test]
    fn task_id_accepts_records_and_strings() {
        let task = task_with_deadline(0);
        assert_eq!(TaskId::id(&task), "t1");
        assert_eq!(TaskId::id("raw"), "raw");
        assert_eq!(TaskId::id(&"owned".to_string()), "owned");
    }
}

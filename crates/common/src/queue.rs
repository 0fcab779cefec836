//! Reliable at-least-once queues on Redis streams.
//!
//! Each queue is one stream; each consumer group sees every message in push
//! order, independently of other groups. An item that is popped but not
//! acked within the visibility timeout is reclaimed (XAUTOCLAIM) and
//! redelivered to the same group with an incremented delivery counter.
//! Acks (XACK) are idempotent.

use std::marker::PhantomData;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::constants::DEFAULT_VISIBILITY_TIMEOUT_MS;
use crate::error::{CommonError, Result};
use crate::messages::{
    BuildOutput, BuildRequest, ConfirmedVulnerability, Crash, Patch, Task, TracedCrash,
};

/// Sealed set of payload types a reliable queue may carry. One variant per
/// queue instance; the codec is serde JSON.
pub trait QueueMessage: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl QueueMessage for Task {}
impl QueueMessage for BuildRequest {}
impl QueueMessage for BuildOutput {}
impl QueueMessage for Crash {}
impl QueueMessage for TracedCrash {}
impl QueueMessage for ConfirmedVulnerability {}
impl QueueMessage for Patch {}

/// A delivered queue item. `times_delivered` is monotonically increasing
/// across redeliveries of the same item to the same group.
#[derive(Debug, Clone)]
pub struct RQItem<T> {
    pub item_id: String,
    pub deserialized: T,
    pub times_delivered: u64,
}

/// Creates queues bound to a (stream, consumer group) pair and ensures the
/// group exists before first use.
#[derive(Clone)]
pub struct QueueFactory {
    conn: ConnectionManager,
}

impl QueueFactory {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Create a queue handle for `queue_name`, consuming as `group_id`.
    /// The group starts at the beginning of the stream so late-registered
    /// groups still see earlier messages.
    pub async fn create<T: QueueMessage>(
        &self,
        queue_name: &str,
        group_id: &str,
    ) -> Result<ReliableQueue<T>> {
        let mut conn = self.conn.clone();
        let created: std::result::Result<Value, redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(queue_name)
            .arg(group_id)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        if let Err(e) = created {
            // BUSYGROUP means another worker already created it
            if !e.to_string().contains("BUSYGROUP") {
                return Err(e.into());
            }
        }
        Ok(ReliableQueue {
            conn: self.conn.clone(),
            queue_name: queue_name.to_string(),
            group_id: group_id.to_string(),
            consumer_id: format!("consumer-{}", Uuid::new_v4()),
            visibility_timeout_ms: DEFAULT_VISIBILITY_TIMEOUT_MS,
            block_time_ms: None,
            _marker: PhantomData,
        })
    }

    /// A push-only handle. No consumer group is registered; calling `pop`
    /// on it yields nothing.
    pub fn producer<T: QueueMessage>(&self, queue_name: &str) -> ReliableQueue<T> {
        ReliableQueue {
            conn: self.conn.clone(),
            queue_name: queue_name.to_string(),
            group_id: String::new(),
            consumer_id: format!("producer-{}", Uuid::new_v4()),
            visibility_timeout_ms: DEFAULT_VISIBILITY_TIMEOUT_MS,
            block_time_ms: None,
            _marker: PhantomData,
        }
    }
}

/// A FIFO queue with at-least-once delivery per consumer group.
pub struct ReliableQueue<T> {
    conn: ConnectionManager,
    queue_name: String,
    group_id: String,
    consumer_id: String,
    visibility_timeout_ms: u64,
    block_time_ms: Option<u64>,
    _marker: PhantomData<T>,
}

impl<T: QueueMessage> ReliableQueue<T> {
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Override the visibility timeout for this handle.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Poll with a blocking wait instead of returning immediately.
    pub fn with_block_time(mut self, block: Duration) -> Self {
        self.block_time_ms = Some(block.as_millis() as u64);
        self
    }

    /// Append a message to the stream. Producers never throttle.
    pub async fn push(&self, msg: &T) -> Result<()> {
        let payload = serde_json::to_vec(msg)?;
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("XADD")
            .arg(&self.queue_name)
            .arg("*")
            .arg("data")
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Pop the next available item for this group: first any item whose
    /// visibility timeout expired, then the oldest undelivered one.
    /// Returns `None` when the queue has nothing for this group.
    pub async fn pop(&self) -> Result<Option<RQItem<T>>> {
        if let Some(entry) = self.claim_expired().await? {
            return self.into_item(entry).await;
        }
        if let Some(entry) = self.read_new().await? {
            return self.into_item(entry).await;
        }
        Ok(None)
    }

    /// Remove an item from this group's pending list. A no-op when the item
    /// was already acked.
    pub async fn ack(&self, item_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("XACK")
            .arg(&self.queue_name)
            .arg(&self.group_id)
            .arg(item_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// How many times an item has been delivered to this group.
    pub async fn times_delivered(&self, item_id: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XPENDING")
            .arg(&self.queue_name)
            .arg(&self.group_id)
            .arg(item_id)
            .arg(item_id)
            .arg(1)
            .query_async(&mut conn)
            .await?;
        if let Value::Bulk(entries) = reply {
            if let Some(Value::Bulk(fields)) = entries.first() {
                if let Some(Value::Int(count)) = fields.get(3) {
                    return Ok(*count as u64);
                }
            }
        }
        Ok(0)
    }

    /// Total number of messages in the stream.
    pub async fn size(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let len: i64 = redis::cmd("XLEN")
            .arg(&self.queue_name)
            .query_async(&mut conn)
            .await?;
        Ok(len as u64)
    }

    /// Messages this group has not acked yet: delivered-but-pending plus
    /// not-yet-delivered (when the server reports a lag).
    pub async fn group_backlog(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XINFO")
            .arg("GROUPS")
            .arg(&self.queue_name)
            .query_async(&mut conn)
            .await?;
        let Value::Bulk(groups) = reply else {
            return Ok(0);
        };
        for group in groups {
            let Value::Bulk(fields) = group else { continue };
            let mut name = None;
            let mut pending = 0u64;
            let mut lag = 0u64;
            let mut it = fields.iter();
            while let (Some(k), Some(v)) = (it.next(), it.next()) {
                match (as_string(k).as_deref(), v) {
                    (Some("name"), v) => name = as_string(v),
                    (Some("pending"), Value::Int(n)) => pending = *n as u64,
                    (Some("lag"), Value::Int(n)) => lag = *n as u64,
                    _ => {}
                }
            }
            if name.as_deref() == Some(self.group_id.as_str()) {
                return Ok(pending + lag);
            }
        }
        Ok(0)
    }

    /// Reclaim one item whose visibility timeout expired.
    async fn claim_expired(&self) -> Result<Option<(String, Vec<u8>)>> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.queue_name)
            .arg(&self.group_id)
            .arg(&self.consumer_id)
            .arg(self.visibility_timeout_ms)
            .arg("0-0")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await?;
        let Value::Bulk(parts) = reply else {
            return Ok(None);
        };
        // [next-cursor, entries, (deleted ids)]
        let Some(Value::Bulk(entries)) = parts.get(1) else {
            return Ok(None);
        };
        Ok(entries.first().and_then(parse_stream_entry))
    }

    /// Read the next undelivered item for this group.
    async fn read_new(&self) -> Result<Option<(String, Vec<u8>)>> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group_id)
            .arg(&self.consumer_id)
            .arg("COUNT")
            .arg(1);
        if let Some(block) = self.block_time_ms {
            cmd.arg("BLOCK").arg(block);
        }
        cmd.arg("STREAMS").arg(&self.queue_name).arg(">");
        let reply: Value = cmd.query_async(&mut conn).await?;
        // [[stream-name, [[id, [field, value, ...]], ...]]]
        let Value::Bulk(streams) = reply else {
            return Ok(None);
        };
        let Some(Value::Bulk(stream)) = streams.first() else {
            return Ok(None);
        };
        let Some(Value::Bulk(entries)) = stream.get(1) else {
            return Ok(None);
        };
        Ok(entries.first().and_then(parse_stream_entry))
    }

    async fn into_item(&self, (item_id, payload): (String, Vec<u8>)) -> Result<Option<RQItem<T>>> {
        let times_delivered = self.times_delivered(&item_id).await?.max(1);
        match serde_json::from_slice::<T>(&payload) {
            Ok(deserialized) => Ok(Some(RQItem {
                item_id,
                deserialized,
                times_delivered,
            })),
            Err(e) => {
                // Poison item: drop it so it does not wedge the group
                warn!(
                    "Dropping malformed payload {} on '{}': {}",
                    item_id, self.queue_name, e
                );
                self.ack(&item_id).await?;
                Err(CommonError::MalformedPayload {
                    queue: self.queue_name.clone(),
                    source: e,
                })
            }
        }
    }
}

/// Parse `[id, [field, value, ...]]` and pull out the `data` field.
fn parse_stream_entry(entry: &Value) -> Option<(String, Vec<u8>)> {
    let Value::Bulk(parts) = entry else {
        return None;
    };
    let id = as_string(parts.first()?)?;
    let Value::Bulk(fields) = parts.get(1)? else {
        return None;
    };
    let mut it = fields.iter();
    while let (Some(k), Some(v)) = (it.next(), it.next()) {
        if as_string(k).as_deref() == Some("data") {
            if let Value::Data(bytes) = v {
                return Some((id, bytes.clone()));
            }
        }
    }
    None
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::Data(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

/// Capped exponential backoff for consumers retrying transient store errors.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            current: Duration::from_millis(100),
            max: Duration::from_secs(10),
        }
    }
}

impl Backoff {
    /// Sleep for the current delay, then double it up to the cap.
    pub async fn wait(&mut self) {
        debug!("Backing off for {:?}", self.current);
        tokio::time::sleep(self.current).await;
        self.current = (self.current * 2).min(self.max);
    }

    /// Reset after a successful operation.
    pub fn reset(&mut self) {
        self.current = Duration::from_millis(100);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, data: &[u8]) -> Value {
        Value::Bulk(vec![
            Value::Data(id.as_bytes().to_vec()),
            Value::Bulk(vec![
                Value::Data(b"data".to_vec()),
                Value::Data(data.to_vec()),
            ]),
        ])
    }

    #[test]
    fn parses_stream_entry() {
        let parsed = parse_stream_entry(&entry("1690000000000-0", b"{\"x\":1}"));
        let (id, payload) = parsed.unwrap();
        assert_eq!(id, "1690000000000-0");
        assert_eq!(payload, b"{\"x\":1}");
    }

    #[test]
    fn ignores_entries_without_data_field() {
        let malformed = Value::Bulk(vec![
            Value::Data(b"1-0".to_vec()),
            Value::Bulk(vec![
                Value::Data(b"other".to_vec()),
                Value::Data(b"zzz".to_vec()),
            ]),
        ]);
        assert!(parse_stream_entry(&malformed).is_none());
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut b = Backoff {
            current: Duration::from_secs(8),
            max: Duration::from_secs(10),
        };
        // advance synchronously by simulating the doubling
        b.current = (b.current * 2).min(b.max);
        assert_eq!(b.current, Duration::from_secs(10));
        b.reset();
        assert_eq!(b.current, Duration::from_millis(100));
    }
}

//! Distributed locks on the key/value store.
//!
//! A lock is a key holding the owner's worker id with a TTL. Acquisition is
//! SET NX EX; release deletes the key only when the value still matches the
//! owner, so a worker cannot release a lock it lost to TTL expiry. Failing
//! to acquire is a normal outcome, not an error.

use redis::aio::ConnectionManager;
use redis::Script;
use uuid::Uuid;

use crate::error::Result;

const RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
";

/// Outcome of a lock acquisition attempt.
pub enum LockAcquisition {
    /// The caller now owns the lock until release or TTL expiry.
    Acquired(DistributedLock),
    /// Another worker holds the lock.
    Busy,
}

/// A held lock. Dropping the handle does NOT release the lock; call
/// `release` so expiry semantics stay explicit.
pub struct DistributedLock {
    conn: ConnectionManager,
    key: String,
    token: String,
}

impl DistributedLock {
    /// Try to take the lock for `ttl_seconds`.
    pub async fn acquire(
        conn: ConnectionManager,
        key: &str,
        ttl_seconds: u64,
    ) -> Result<LockAcquisition> {
        let token = Uuid::new_v4().to_string();
        let mut c = conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut c)
            .await?;
        match reply {
            Some(_) => Ok(LockAcquisition::Acquired(DistributedLock {
                conn,
                key: key.to_string(),
                token,
            })),
            None => Ok(LockAcquisition::Busy),
        }
    }

    /// Release the lock. Returns false when the lock had already expired
    /// and been taken by someone else.
    pub async fn release(self) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = Script::new(RELEASE_SCRIPT)
            .key(&self.key)
            .arg(&self.token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}

/// Lock serializing corpus merges for one (task, harness) pair.
pub struct MergedCorpusSetLock;

impl MergedCorpusSetLock {
    pub fn key(task_id: &str, harness_name: &str) -> String {
        format!("merge_lock:{}:{}", task_id.to_lowercase(), harness_name)
    }

    pub async fn acquire(
        conn: ConnectionManager,
        task_id: &str,
        harness_name: &str,
        ttl_seconds: u64,
    ) -> Result<LockAcquisition> {
        DistributedLock::acquire(conn, &Self::key(task_id, harness_name), ttl_seconds).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_key_is_scoped_per_task_and_harness() {
        assert_eq!(
            MergedCorpusSetLock::key("T1", "read_fuzzer"),
            "merge_lock:t1:read_fuzzer"
        );
        assert_ne!(
            MergedCorpusSetLock::key("t1", "a"),
            MergedCorpusSetLock::key("t1", "b")
        );
    }
}

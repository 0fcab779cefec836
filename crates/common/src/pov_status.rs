//! Registry of PoV-against-patch reproduction requests.
//!
//! Each request has a status that starts `pending` and moves out of it at
//! most once, via a compare-and-set script. Concurrent reproducers may all
//! finish the same request; only the first transition wins and the rest
//! observe a failed CAS.

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use crate::error::Result;
use crate::messages::POVReproduceRequest;

const REQUESTS_HASH: &str = "pov_reproduce_requests";
const STATUS_HASH: &str = "pov_reproduce_status";
const PENDING_LIST: &str = "pov_reproduce_pending";

const CAS_SCRIPT: &str = r"
if redis.call('HGET', KEYS[1], ARGV[1]) == ARGV[2] then
    redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
    redis.call('LREM', KEYS[2], 0, ARGV[1])
    return 1
else
    return 0
end
";

/// Reproduction outcome of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PovReproduceState {
    Pending,
    /// The patched build no longer crashes on the PoV.
    Mitigated,
    /// The PoV still crashes the patched build.
    NonMitigated,
    /// The task was cancelled or hit its deadline before reproduction.
    Expired,
}

impl PovReproduceState {
    fn as_str(self) -> &'static str {
        match self {
            PovReproduceState::Pending => "pending",
            PovReproduceState::Mitigated => "mitigated",
            PovReproduceState::NonMitigated => "non_mitigated",
            PovReproduceState::Expired => "expired",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PovReproduceState::Pending),
            "mitigated" => Some(PovReproduceState::Mitigated),
            "non_mitigated" => Some(PovReproduceState::NonMitigated),
            "expired" => Some(PovReproduceState::Expired),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct PoVReproduceStatus {
    conn: ConnectionManager,
}

impl PoVReproduceStatus {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn request_key(request: &POVReproduceRequest) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            request.task_id.to_lowercase(),
            request.internal_patch_id,
            request.sanitizer,
            request.harness_name,
            request.pov_path.display()
        )
    }

    /// Register a request in `pending` state. Re-registering an existing
    /// request is a no-op, whatever state it reached.
    pub async fn request(&self, request: &POVReproduceRequest) -> Result<()> {
        let key = Self::request_key(request);
        let mut conn = self.conn.clone();
        let is_new: bool = conn
            .hset_nx(STATUS_HASH, &key, PovReproduceState::Pending.as_str())
            .await?;
        if is_new {
            let bytes = serde_json::to_vec(request)?;
            let _: () = redis::pipe()
                .atomic()
                .hset(REQUESTS_HASH, &key, bytes)
                .rpush(PENDING_LIST, &key)
                .query_async(&mut conn)
                .await?;
        }
        Ok(())
    }

    /// One request still in `pending`, oldest first. `None` when the
    /// pending list is drained.
    pub async fn get_one_pending(&self) -> Result<Option<POVReproduceRequest>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.lrange(PENDING_LIST, 0, -1).await?;
        for key in keys {
            let status: Option<String> = conn.hget(STATUS_HASH, &key).await?;
            if status.as_deref() == Some(PovReproduceState::Pending.as_str()) {
                let bytes: Option<Vec<u8>> = conn.hget(REQUESTS_HASH, &key).await?;
                if let Some(bytes) = bytes {
                    return Ok(Some(serde_json::from_slice(&bytes)?));
                }
            }
        }
        Ok(None)
    }

    pub async fn mark_mitigated(&self, request: &POVReproduceRequest) -> Result<bool> {
        self.transition(request, PovReproduceState::Mitigated).await
    }

    pub async fn mark_non_mitigated(&self, request: &POVReproduceRequest) -> Result<bool> {
        self.transition(request, PovReproduceState::NonMitigated).await
    }

    pub async fn mark_expired(&self, request: &POVReproduceRequest) -> Result<bool> {
        self.transition(request, PovReproduceState::Expired).await
    }

    /// Current state, `None` for an unknown request.
    pub async fn status(&self, request: &POVReproduceRequest) -> Result<Option<PovReproduceState>> {
        let mut conn = self.conn.clone();
        let status: Option<String> = conn
            .hget(STATUS_HASH, Self::request_key(request))
            .await?;
        Ok(status.as_deref().and_then(PovReproduceState::parse))
    }

    /// CAS `pending -> to`. Returns false when the request had already left
    /// `pending` (another worker won).
    async fn transition(
        &self,
        request: &POVReproduceRequest,
        to: PovReproduceState,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let moved: i64 = Script::new(CAS_SCRIPT)
            .key(STATUS_HASH)
            .key(PENDING_LIST)
            .arg(Self::request_key(request))
            .arg(PovReproduceState::Pending.as_str())
            .arg(to.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(moved == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn request_key_distinguishes_patch_lines() {
        let base = POVReproduceRequest {
            task_id: "T1".into(),
            internal_patch_id: "p1".into(),
            pov_path: PathBuf::from("/remote/pov1"),
            sanitizer: "address".into(),
            harness_name: "h1".into(),
        };
        let other = POVReproduceRequest {
            internal_patch_id: "p2".into(),
            ..base.clone()
        };
        assert_ne!(
            PoVReproduceStatus::request_key(&base),
            PoVReproduceStatus::request_key(&other)
        );
        assert!(PoVReproduceStatus::request_key(&base).starts_with("t1:"));
    }

    #[test]
    fn state_strings_round_trip() {
        for state in [
            PovReproduceState::Pending,
            PovReproduceState::Mitigated,
            PovReproduceState::NonMitigated,
            PovReproduceState::Expired,
        ] {
            assert_eq!(PovReproduceState::parse(state.as_str()), Some(state));
        }
        assert_eq!(PovReproduceState::parse("bogus"), None);
    }
}

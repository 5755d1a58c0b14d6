//! Metadata row types: shard leases and container records.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// The right, held by one worker, to produce containers for a shard.
///
/// A lease is expired once `now > heartbeat_at + ttl_seconds`; an expired
/// lease may be taken over, which increments `generation`. All lease writes
/// (renew, release) are fenced on `(shard_id, owner_id, generation)` so a
/// worker that lost its lease can never touch the successor's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardLease {
    pub shard_id: u32,
    pub owner_id: String,
    /// Milliseconds since the Unix epoch.
    pub acquired_at: i64,
    /// Renewed by the heartbeat task; expiry is measured from here.
    pub heartbeat_at: i64,
    pub ttl_seconds: u32,
    /// Incremented on every (re)acquire.
    pub generation: u64,
}

impl ShardLease {
    pub fn expires_at_ms(&self) -> i64 {
        self.heartbeat_at + i64::from(self.ttl_seconds) * 1000
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms > self.expires_at_ms()
    }
}

/// Container life-cycle. Only `Committed` rows are visible to readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerState {
    Open,
    Uploading,
    Committed,
    Abandoned,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Open => "OPEN",
            ContainerState::Uploading => "UPLOADING",
            ContainerState::Committed => "COMMITTED",
            ContainerState::Abandoned => "ABANDONED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "OPEN" => Some(ContainerState::Open),
            "UPLOADING" => Some(ContainerState::Uploading),
            "COMMITTED" => Some(ContainerState::Committed),
            "ABANDONED" => Some(ContainerState::Abandoned),
            _ => None,
        }
    }
}

/// One container's metadata row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub container_id: String,
    pub shard_id: u32,
    pub day: NaiveDate,
    pub bucket: String,
    pub key: String,
    pub state: ContainerState,
    pub file_count: u64,
    pub byte_size: u64,
    pub created_at: i64,
    pub committed_at: Option<i64>,
    /// Lease owner and generation at creation time.
    pub owner_id: String,
    pub generation: u64,
}

//! Easy Store Metadata Store
//!
//! The metadata store is the coordination point of the packer fleet. It
//! holds two tables:
//!
//! - **shard_leases**: which worker currently owns each shard. Acquisition
//!   is an atomic compare-and-swap; every successful (re)acquire bumps the
//!   lease `generation`, and all later lease writes are fenced on
//!   `(shard_id, owner_id, generation)`.
//! - **containers**: one row per container with its life-cycle state
//!   (`OPEN -> UPLOADING -> COMMITTED`, or `ABANDONED`). Only COMMITTED
//!   rows are visible to readers; recovery sweeps the rest.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────┐
//! │ Packer 1 │   │ Packer 2 │   │ Packer 3 │
//! └────┬─────┘   └────┬─────┘   └────┬─────┘
//!      │  try_acquire / renew / release
//!      └──────────────┼───────────────┘
//!                     ▼
//!            ┌─────────────────┐
//!            │   PostgreSQL    │  ← shared leases + container records
//!            └─────────────────┘
//! ```
//!
//! ## Implementations
//!
//! - [`PostgresMetadataStore`]: the production backend. Uses runtime sqlx
//!   queries (no compile-time DATABASE_URL) and an
//!   `INSERT ... ON CONFLICT DO UPDATE` CAS guarded by lease expiry, so
//!   `try_acquire` is race-free without explicit row locks.
//! - [`MemoryMetadataStore`]: in-process implementation with identical
//!   semantics, used by tests and single-process deployments.
//!
//! All timestamps are milliseconds since the Unix epoch (`i64`).

pub mod error;
pub mod memory;
pub mod postgres;
pub mod types;

pub use error::{MetadataError, Result};
pub use memory::MemoryMetadataStore;
pub use postgres::PostgresMetadataStore;
pub use types::{ContainerRecord, ContainerState, ShardLease};

use async_trait::async_trait;

/// Current time in milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Typed accessor over the relational store holding shard leases and
/// container records.
///
/// Every method is a single atomic operation (one round trip where the
/// backend allows it). Implementations must be `Send + Sync` and are shared
/// across shard tasks via `Arc<dyn MetadataStore>`.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    // ------------------------------------------------------------
    // Shard leases
    // ------------------------------------------------------------

    /// Try to acquire the lease for a shard.
    ///
    /// Succeeds iff no lease row exists or the current one is expired
    /// (`now > heartbeat_at + ttl_seconds`). On success the stored
    /// `generation` is incremented and the new lease is returned; on
    /// contention `Ok(None)` is returned.
    async fn try_acquire(
        &self,
        shard_id: u32,
        owner_id: &str,
        ttl_seconds: u32,
    ) -> Result<Option<ShardLease>>;

    /// Renew the heartbeat iff `(shard_id, owner_id, generation)` still
    /// holds the lease. Returns whether the renewal took effect; a `false`
    /// means the lease was lost.
    async fn renew(&self, shard_id: u32, owner_id: &str, generation: u64) -> Result<bool>;

    /// Release the lease iff still held under the same generation.
    /// Releasing a lease that was already lost is a no-op.
    async fn release(&self, shard_id: u32, owner_id: &str, generation: u64) -> Result<()>;

    /// Current lease row for a shard, expired or not.
    async fn get_lease(&self, shard_id: u32) -> Result<Option<ShardLease>>;

    /// Leases with `heartbeat_at + ttl_seconds < now`.
    async fn list_expired_leases(&self, now_ms: i64) -> Result<Vec<ShardLease>>;

    /// Delete all expired leases; returns how many were released.
    async fn release_expired_leases(&self, now_ms: i64) -> Result<u64>;

    // ------------------------------------------------------------
    // Container records
    // ------------------------------------------------------------

    /// Insert a new container row in state OPEN.
    async fn create_container(&self, record: &ContainerRecord) -> Result<()>;

    async fn get_container(&self, container_id: &str) -> Result<Option<ContainerRecord>>;

    /// Checkpoint progress (`file_count`, `byte_size`) on an open container.
    async fn update_container_progress(
        &self,
        container_id: &str,
        file_count: u64,
        byte_size: u64,
    ) -> Result<()>;

    /// OPEN -> UPLOADING. Returns whether the transition applied.
    async fn mark_uploading(&self, container_id: &str) -> Result<bool>;

    /// OPEN | UPLOADING -> COMMITTED, stamping `committed_at`. Returns
    /// whether the transition applied.
    async fn mark_committed(&self, container_id: &str) -> Result<bool>;

    /// Any non-COMMITTED state -> ABANDONED. Returns whether the transition
    /// applied (a committed container is never abandoned).
    async fn abandon(&self, container_id: &str) -> Result<bool>;

    /// Non-terminal (OPEN or UPLOADING) containers created before `cutoff_ms`.
    async fn list_stale_containers(&self, cutoff_ms: i64) -> Result<Vec<ContainerRecord>>;
}

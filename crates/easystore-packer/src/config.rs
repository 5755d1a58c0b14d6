//! Packer Configuration
//!
//! [`PackerConfig`] drives one worker process; [`SourceConfig`] describes
//! one upstream source database (connection, dialect, table, column
//! mapping, claim semantics). Both deserialize with serde and carry
//! defaults for everything operational, so a minimal deployment config only
//! names the worker, the buckets, and the sources.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use easystore_core::sharding::shard_hex;

/// Supported source database dialects. Dialect specifics (claim locking,
/// placeholder style, limit syntax) live entirely inside the source module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceDialect {
    Postgres,
    MySql,
    Mssql,
    Oracle,
}

/// Mapping from source table columns to the pending-file row contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMapping {
    /// Primary key column.
    pub id: String,
    /// Column holding the source object-store bucket.
    pub bucket: String,
    /// Column holding the source object key.
    pub key: String,
    /// Column holding the payload size in bytes.
    pub size_bytes: String,
    /// Status column driving the claim state machine.
    pub status: String,

    /// Creation timestamp column (copied into file metadata when mapped).
    #[serde(default)]
    pub created_at: Option<String>,

    /// Column used for shard routing; defaults to the object key.
    #[serde(default)]
    pub shard_key: Option<String>,

    /// Marker-stamped target name. When the column is mapped and non-null
    /// the packer uses that name verbatim; otherwise it mints one.
    #[serde(default)]
    pub des_name: Option<String>,

    /// Claim owner stamp column.
    #[serde(default)]
    pub claimed_by: Option<String>,

    /// Claim timestamp column; required for stale-claim recovery.
    #[serde(default)]
    pub claimed_at: Option<String>,

    /// Failure reason column.
    #[serde(default)]
    pub error_message: Option<String>,

    /// Column receiving the committed container id on `mark_packed`.
    #[serde(default)]
    pub container_id: Option<String>,
}

/// One source database entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Unique source name, recorded in file metadata as provenance.
    pub name: String,
    pub dialect: SourceDialect,
    /// Connection string for the source database.
    pub url: String,
    pub table: String,
    #[serde(default)]
    pub schema: Option<String>,
    pub columns: ColumnMapping,

    #[serde(default = "default_pending")]
    pub status_pending_value: String,
    #[serde(default = "default_claimed")]
    pub status_claimed_value: String,
    #[serde(default = "default_packed")]
    pub status_packed_value: String,
    #[serde(default = "default_failed")]
    pub status_failed_value: String,

    /// Extra SQL predicate appended to the claim query (without `WHERE`).
    #[serde(default)]
    pub where_clause: Option<String>,

    #[serde(default = "default_shard_bits")]
    pub shard_bits: u8,

    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// A row claimed longer than this is eligible for re-claim.
    #[serde(default = "default_claim_timeout")]
    pub claim_timeout_seconds: u64,

    /// Result-metadata key -> source column.
    #[serde(default)]
    pub metadata_columns: BTreeMap<String, String>,
}

impl SourceConfig {
    /// Fully qualified table name.
    pub fn qualified_table(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{schema}.{}", self.table),
            None => self.table.clone(),
        }
    }
}

/// Worker-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackerConfig {
    /// Opaque worker identity stamped on leases, claims, and containers.
    pub owner_id: String,

    /// Local directory for in-progress container files.
    pub workdir: PathBuf,

    /// Archive bucket label (recorded in container rows; the object store
    /// handle itself is injected).
    pub archive_bucket: String,

    /// Optional key prefix inside the archive bucket.
    #[serde(default)]
    pub archive_prefix: Option<String>,

    #[serde(default = "default_shard_bits")]
    pub shard_bits: u8,

    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_seconds: u32,

    /// Rollover trigger: container byte size.
    #[serde(default = "default_max_container_bytes")]
    pub max_container_bytes: u64,

    /// Rollover trigger: file count.
    #[serde(default = "default_max_files")]
    pub max_files_per_container: u64,

    /// Checkpoint the container row every this many files...
    #[serde(default = "default_checkpoint_files")]
    pub checkpoint_interval_files: u64,

    /// ...or this many appended bytes, whichever comes first.
    #[serde(default = "default_checkpoint_bytes")]
    pub checkpoint_interval_bytes: u64,

    #[serde(default = "default_big_file_threshold")]
    pub big_file_threshold: u64,

    /// On shutdown, finalize the open container when it holds at least this
    /// many files; abort otherwise.
    #[serde(default = "default_min_commit_files")]
    pub min_commit_files: u64,

    /// Grace window for in-flight finalize/upload on shutdown.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,

    /// Upper bound for the adaptive claim batch size.
    #[serde(default = "default_claim_batch_max")]
    pub claim_batch_max: u32,

    /// Sleep between polls when a shard has no pending files.
    #[serde(default = "default_idle_poll")]
    pub idle_poll_seconds: u64,

    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    #[serde(default)]
    pub node_id: u8,
}

impl PackerConfig {
    /// Archive object key for a container:
    /// `[prefix/]<day>/<shard_hex>/<container_id>.des`.
    pub fn archive_key(&self, day: chrono::NaiveDate, shard_id: u32, container_id: &str) -> String {
        let base = format!(
            "{}/{}/{}.des",
            day.format("%Y-%m-%d"),
            shard_hex(shard_id, self.shard_bits),
            container_id
        );
        match &self.archive_prefix {
            Some(prefix) if !prefix.is_empty() => {
                format!("{}/{base}", prefix.trim_matches('/'))
            }
            _ => base,
        }
    }

    /// Local scratch path for an in-progress container.
    pub fn workdir_path(&self, shard_id: u32, day: chrono::NaiveDate, container_id: &str) -> PathBuf {
        self.workdir.join(format!(
            "{}-{}-{}.des.tmp",
            shard_hex(shard_id, self.shard_bits),
            day.format("%Y-%m-%d"),
            container_id
        ))
    }
}

fn default_pending() -> String {
    "pending".to_string()
}
fn default_claimed() -> String {
    "claimed".to_string()
}
fn default_packed() -> String {
    "packed".to_string()
}
fn default_failed() -> String {
    "failed".to_string()
}
fn default_shard_bits() -> u8 {
    8
}
fn default_batch_size() -> u32 {
    100
}
fn default_claim_timeout() -> u64 {
    300
}
fn default_lease_ttl() -> u32 {
    60
}
fn default_max_container_bytes() -> u64 {
    1024 * 1024 * 1024 // 1 GiB
}
fn default_max_files() -> u64 {
    100_000
}
fn default_checkpoint_files() -> u64 {
    256
}
fn default_checkpoint_bytes() -> u64 {
    64 * 1024 * 1024
}
fn default_big_file_threshold() -> u64 {
    easystore_core::format::DEFAULT_BIG_FILE_THRESHOLD
}
fn default_min_commit_files() -> u64 {
    1
}
fn default_shutdown_grace() -> u64 {
    30
}
fn default_claim_batch_max() -> u32 {
    1000
}
fn default_idle_poll() -> u64 {
    5
}
fn default_name_prefix() -> String {
    "DES".to_string()
}

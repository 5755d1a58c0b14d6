//! Easy Store Packer
//!
//! The distributed pipeline that turns very large numbers of small source
//! files into a smaller number of DES containers.
//!
//! ```text
//! source rows ──claim──► provider ──fetch──► packer ──add──► container writer
//!                                                                 │ rollover
//!                                                                 ▼
//!  metadata row ◄──commit── archive bucket ◄──upload── finalized container
//! ```
//!
//! ## Components
//!
//! - [`source`]: claims pending rows from configured source databases under
//!   dialect-appropriate locking, fetches bodies from the source object
//!   store, and records terminal outcomes.
//! - [`packer`]: the per-shard control loop — lease, pack, checkpoint,
//!   rollover, upload, commit.
//! - [`heartbeat`]: renews held leases at ttl/3 and signals loss.
//! - [`recovery`]: reconciles expired leases, orphan containers, and stuck
//!   claims after crashes.
//! - [`backpressure`]: AIMD sizing of the claim batch, the pipeline's only
//!   flow-control primitive.
//! - [`retry`]: transient/permanent classification with capped, jittered
//!   exponential backoff.
//! - [`metrics`]: the counter hook and readiness probe the process shell
//!   plugs observability into.
//!
//! ## Wiring example
//!
//! ```ignore
//! let store: Arc<dyn MetadataStore> = Arc::new(PostgresMetadataStore::new(&db_url).await?);
//! let source: Arc<dyn FileSource> = Arc::new(
//!     MultiSourceProvider::connect(sources, SourceStores::single(source_s3), &owner).await?,
//! );
//!
//! CrashRecovery::new(store.clone(), archive.clone(), Some(source.clone()), Default::default())
//!     .sweep_once()
//!     .await?;
//!
//! let packer = Packer::new(store, source, archive, config, metrics, readiness)?;
//! let assignment = shard_assignment(pod_ordinal, pod_count, shard_bits)?;
//! packer.run(assignment, shutdown_rx).await?;
//! ```

pub mod backpressure;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod metrics;
pub mod packer;
pub mod recovery;
pub mod retry;
pub mod source;

pub use backpressure::BatchSizer;
pub use config::{ColumnMapping, PackerConfig, SourceConfig, SourceDialect};
pub use error::{PackerError, Result};
pub use metrics::{MetricsSink, NullSink, Readiness, RecordingSink};
pub use packer::Packer;
pub use recovery::{CrashRecovery, RecoveryConfig, RecoveryReport};
pub use retry::{RetryClass, RetryPolicy};
pub use source::{FileSource, MultiSourceProvider, PackedFile, PendingFile, SourceStores};

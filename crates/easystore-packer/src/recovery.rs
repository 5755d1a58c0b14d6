//! Crash Recovery
//!
//! Runs at packer startup and periodically afterwards. Three sweeps, in
//! order:
//!
//! 1. **Expired leases** are released so surviving workers can take the
//!    orphaned shards over.
//! 2. **Stale containers** (non-COMMITTED rows older than the configured
//!    age) are reconciled against the archive: a trailing-range read checks
//!    for a well-formed footer. A valid footer means the upload finished
//!    before the crash — the record is salvaged to COMMITTED (and its file
//!    count corrected if the footer disagrees). Anything else is marked
//!    ABANDONED and the partial object, if present, is deleted.
//! 3. **Stuck claims** — rows claimed longer than the source's claim
//!    timeout — are reset to pending.
//!
//! Append-only containers make this tractable: an object either ends in a
//! valid footer or it is not a container, there is never a half-mutated
//! entry.

use std::sync::Arc;
use std::time::Duration;

use object_store::{path::Path as ObjectPath, ObjectStore};

use easystore_metadata::{ContainerRecord, MetadataStore};
use easystore_storage::RangeContainerReader;

use crate::error::Result;
use crate::metrics::{MetricsSink, NullSink};
use crate::retry::{classify, RetryClass};
use crate::source::FileSource;

/// Recovery tuning.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Non-COMMITTED containers older than this are reconciled.
    pub stale_age: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            stale_age: Duration::from_secs(900),
        }
    }
}

/// Counts of what one sweep changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub leases_released: u64,
    pub containers_salvaged: u64,
    pub containers_abandoned: u64,
    pub file_counts_corrected: u64,
    pub claims_reset: u64,
}

/// Reconciles expired leases, orphan containers, and stuck claims.
pub struct CrashRecovery {
    store: Arc<dyn MetadataStore>,
    archive: Arc<dyn ObjectStore>,
    source: Option<Arc<dyn FileSource>>,
    config: RecoveryConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl CrashRecovery {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        archive: Arc<dyn ObjectStore>,
        source: Option<Arc<dyn FileSource>>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            store,
            archive,
            source,
            config,
            metrics: Arc::new(NullSink),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// One full sweep. Individual reconciliation failures are logged and
    /// left for the next sweep; only store-wide failures surface.
    pub async fn sweep_once(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let now = chrono::Utc::now().timestamp_millis();

        // 1. Expired leases.
        report.leases_released = self.store.release_expired_leases(now).await?;
        if report.leases_released > 0 {
            tracing::info!(released = report.leases_released, "released expired leases");
            self.metrics
                .on_event("recovery_leases_released", &[], report.leases_released as f64);
        }

        // 2. Stale containers.
        let cutoff = now - self.config.stale_age.as_millis() as i64;
        for record in self.store.list_stale_containers(cutoff).await? {
            match self.reconcile_container(&record).await {
                Ok(outcome) => match outcome {
                    Reconciled::Salvaged { count_corrected } => {
                        report.containers_salvaged += 1;
                        if count_corrected {
                            report.file_counts_corrected += 1;
                        }
                    }
                    Reconciled::Abandoned => report.containers_abandoned += 1,
                },
                Err(e) => {
                    tracing::warn!(
                        container_id = %record.container_id,
                        error = %e,
                        "container reconciliation deferred"
                    );
                }
            }
        }

        // 3. Stuck claims.
        if let Some(source) = &self.source {
            report.claims_reset = source.reset_stale_claims().await?;
            if report.claims_reset > 0 {
                self.metrics
                    .on_event("recovery_claims_reset", &[], report.claims_reset as f64);
            }
        }

        tracing::info!(
            leases_released = report.leases_released,
            salvaged = report.containers_salvaged,
            abandoned = report.containers_abandoned,
            claims_reset = report.claims_reset,
            "recovery sweep complete"
        );
        Ok(report)
    }

    async fn reconcile_container(&self, record: &ContainerRecord) -> Result<Reconciled> {
        match RangeContainerReader::open(self.archive.clone(), &record.key).await {
            Ok(reader) => {
                // A well-formed footer proves the upload completed; salvage.
                let footer = *reader.footer();
                let count_corrected = footer.file_count != record.file_count;
                if count_corrected {
                    tracing::info!(
                        container_id = %record.container_id,
                        recorded = record.file_count,
                        actual = footer.file_count,
                        "correcting container file count from footer"
                    );
                    self.store
                        .update_container_progress(
                            &record.container_id,
                            footer.file_count,
                            footer.footer_start() + easystore_core::format::FOOTER_SIZE as u64,
                        )
                        .await?;
                }
                self.store.mark_committed(&record.container_id).await?;
                tracing::info!(
                    container_id = %record.container_id,
                    key = %record.key,
                    "salvaged container with valid footer"
                );
                self.metrics.on_event("recovery_containers_salvaged", &[], 1.0);
                Ok(Reconciled::Salvaged { count_corrected })
            }
            Err(e) if e.is_corrupt() => {
                // Present but not a valid container: a partial upload.
                self.delete_object(&record.key).await;
                self.store.abandon(&record.container_id).await?;
                tracing::warn!(
                    container_id = %record.container_id,
                    key = %record.key,
                    "abandoned partial container"
                );
                self.metrics.on_event("recovery_containers_abandoned", &[], 1.0);
                Ok(Reconciled::Abandoned)
            }
            Err(easystore_storage::Error::ObjectStore(object_store::Error::NotFound {
                ..
            })) => {
                // Never uploaded.
                self.store.abandon(&record.container_id).await?;
                tracing::warn!(
                    container_id = %record.container_id,
                    key = %record.key,
                    "abandoned container with no archive object"
                );
                self.metrics.on_event("recovery_containers_abandoned", &[], 1.0);
                Ok(Reconciled::Abandoned)
            }
            Err(e) => {
                // Transient store trouble: leave the record for next sweep.
                let error = crate::error::PackerError::Storage(e);
                if classify(&error) == RetryClass::Transient {
                    Err(error)
                } else {
                    self.store.abandon(&record.container_id).await?;
                    self.metrics.on_event("recovery_containers_abandoned", &[], 1.0);
                    Ok(Reconciled::Abandoned)
                }
            }
        }
    }

    async fn delete_object(&self, key: &str) {
        match self.archive.delete(&ObjectPath::from(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "partial object deletion failed");
            }
        }
    }
}

enum Reconciled {
    Salvaged { count_corrected: bool },
    Abandoned,
}

//! Multi-Shard Packer
//!
//! The control loop of the pipeline. Each worker process runs one
//! [`Packer`] over its shard assignment; every shard gets its own task
//! moving through the per-shard state machine:
//!
//! ```text
//! IDLE ──try_acquire──► LEASED ──open_writer──► PACKING ──rollover──► FINALIZING
//!   ▲                     │                        │                       │
//!   │                     │ renew fails            │ error                 │ upload ack
//!   │                     ▼                        ▼                       ▼
//!   └──────────────────── LOST ◄── (abort writer, abandon, release)   COMMITTED → IDLE
//! ```
//!
//! ## Packing loop (one shard)
//!
//! 1. Open a writer for `(shard, today)` under the workdir and insert an
//!    OPEN container record.
//! 2. Claim a batch of pending files for this shard from the provider.
//! 3. Fetch each body and append it to the writer; per-file failures mark
//!    that row failed and the batch continues.
//! 4. Checkpoint the container record every N files / M bytes.
//! 5. Roll over on byte size, file count, day boundary, or shutdown:
//!    finalize → mark UPLOADING → upload → mark COMMITTED → mark source
//!    rows packed (container first, then rows) → fresh writer or idle.
//!
//! ## Concurrency
//!
//! The metadata store, provider, and archive client are shared across shard
//! tasks; the lease (renewed by a heartbeat task at ttl/3) guarantees at
//! most one writer per shard fleet-wide. Claim batch size is the only flow
//! control: it shrinks multiplicatively on fetch errors and grows
//! additively on sustained success.
//!
//! ## Shutdown
//!
//! On the shutdown signal each shard task stops claiming, finalizes its
//! writer if it holds at least `min_commit_files` files (within the grace
//! window) or aborts it otherwise, and releases its lease. Aborted claims
//! revert to pending through crash recovery.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::NaiveDate;
use object_store::{path::Path as ObjectPath, ObjectStore};
use tokio::sync::watch;

use easystore_core::naming::{NameGenerator, NameGeneratorConfig};
use easystore_metadata::{ContainerRecord, ContainerState, MetadataStore, ShardLease};
use easystore_storage::{ContainerWriter, Error as StorageError, ExternalFileStore, WriterOptions};

use crate::backpressure::BatchSizer;
use crate::config::PackerConfig;
use crate::error::{PackerError, Result};
use crate::heartbeat::{spawn_heartbeat, Heartbeat};
use crate::metrics::{MetricsSink, Readiness};
use crate::retry::{classify, with_retries, RetryClass, RetryPolicy};
use crate::source::{FileSource, PackedFile, PendingFile};

/// One worker's packer: leases shards, drives per-shard writers, uploads
/// finished containers, and commits their metadata.
#[derive(Clone)]
pub struct Packer {
    store: Arc<dyn MetadataStore>,
    source: Arc<dyn FileSource>,
    archive: Arc<dyn ObjectStore>,
    config: Arc<PackerConfig>,
    names: Arc<NameGenerator>,
    metrics: Arc<dyn MetricsSink>,
    readiness: Arc<Readiness>,
    retry: RetryPolicy,
}

impl Packer {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        source: Arc<dyn FileSource>,
        archive: Arc<dyn ObjectStore>,
        config: PackerConfig,
        metrics: Arc<dyn MetricsSink>,
        readiness: Arc<Readiness>,
    ) -> Result<Self> {
        let names = NameGenerator::new(NameGeneratorConfig {
            prefix: config.name_prefix.clone(),
            node_id: config.node_id,
            wrap_bits: 32,
        })?;
        Ok(Self {
            store,
            source,
            archive,
            config: Arc::new(config),
            names: Arc::new(names),
            metrics,
            readiness,
            retry: RetryPolicy::default(),
        })
    }

    /// Run shard tasks for the given assignment until the shutdown signal
    /// flips and every task has wound down.
    pub async fn run(&self, assignment: Vec<u32>, shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!(
            owner = %self.config.owner_id,
            shards = assignment.len(),
            "packer starting"
        );

        let mut tasks = tokio::task::JoinSet::new();
        for shard_id in assignment {
            let packer = self.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move { (shard_id, packer.shard_loop(shard_id, shutdown).await) });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((shard_id, Ok(()))) => {
                    tracing::debug!(shard_id, "shard task finished");
                }
                Ok((shard_id, Err(e))) => {
                    tracing::error!(shard_id, error = %e, "shard task failed");
                }
                Err(e) => {
                    tracing::error!(error = %e, "shard task panicked");
                }
            }
        }
        tracing::info!(owner = %self.config.owner_id, "packer stopped");
        Ok(())
    }

    async fn shard_loop(&self, shard_id: u32, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self
                .store
                .try_acquire(shard_id, &self.config.owner_id, self.config.lease_ttl_seconds)
                .await
            {
                Ok(Some(lease)) => {
                    tracing::info!(shard_id, generation = lease.generation, "lease acquired");
                    self.readiness.record_lease_renew();
                    self.readiness.record_db_ping();

                    match self.run_leased(shard_id, lease, &mut shutdown).await {
                        Ok(()) => {}
                        Err(PackerError::LeaseLost { .. }) => {
                            self.metrics.on_event("shard_lost", &[], 1.0);
                            tracing::warn!(shard_id, "shard lost; yielding");
                        }
                        Err(e) => {
                            tracing::error!(shard_id, error = %e, "shard packing failed");
                        }
                    }
                }
                Ok(None) => {
                    tracing::debug!(shard_id, "shard is leased elsewhere");
                }
                Err(e) => {
                    tracing::warn!(shard_id, error = %e, "lease acquisition failed");
                }
            }

            if *shutdown.borrow() {
                return Ok(());
            }
            let idle = Duration::from_secs(self.config.idle_poll_seconds.max(1));
            tokio::select! {
                _ = tokio::time::sleep(idle) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// Drive one leased tenure: heartbeat running, packing until shutdown,
    /// loss, or a shard-scope error; the lease is released on every exit.
    async fn run_leased(
        &self,
        shard_id: u32,
        lease: ShardLease,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let heartbeat: Heartbeat = spawn_heartbeat(
            self.store.clone(),
            lease.clone(),
            self.readiness.clone(),
            self.metrics.clone(),
        );
        let mut lost = heartbeat.lost();

        let mut runner = ShardRunner {
            packer: self,
            shard_id,
            lease: lease.clone(),
            open: None,
            sizer: BatchSizer::new(self.config.claim_batch_max),
            carry: VecDeque::new(),
            deferred: Vec::new(),
        };

        let outcome = runner.drive(shutdown, &mut lost).await;
        heartbeat.stop();

        // Best-effort: generation fencing makes this a no-op if the lease
        // was already taken over.
        if let Err(e) = self
            .store
            .release(shard_id, &lease.owner_id, lease.generation)
            .await
        {
            tracing::warn!(shard_id, error = %e, "lease release failed");
        }

        outcome
    }
}

struct Fetched {
    pending: PendingFile,
    bytes: Bytes,
}

struct OpenContainer {
    writer: ContainerWriter,
    record: ContainerRecord,
    external: ExternalFileStore,
    day: NaiveDate,
    path: std::path::PathBuf,
    claims: Vec<PackedFile>,
    files_since_checkpoint: u64,
    bytes_since_checkpoint: u64,
}

struct ShardRunner<'a> {
    packer: &'a Packer,
    shard_id: u32,
    lease: ShardLease,
    open: Option<OpenContainer>,
    sizer: BatchSizer,
    /// Files ready to pack ahead of new claims (deferred duplicates).
    carry: VecDeque<Fetched>,
    /// Duplicate-named files waiting for the next container.
    deferred: Vec<Fetched>,
}

impl ShardRunner<'_> {
    async fn drive(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
        lost: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let result = self.packing_loop(shutdown, lost).await;
        if result.is_err() {
            // Shard-scope failure: nothing half-written may survive the
            // tenure. No-op when the loop already cleaned up.
            self.abandon_open("shard error").await;
        }
        result
    }

    async fn packing_loop(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
        lost: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            if *lost.borrow() {
                self.abandon_open("lease lost").await;
                return Err(PackerError::LeaseLost {
                    shard_id: self.shard_id,
                });
            }
            if *shutdown.borrow() {
                self.shutdown_flush().await;
                return Ok(());
            }

            // Day boundary: close yesterday's container before packing on.
            if let Some(open) = &self.open {
                if open.day != today() {
                    self.rollover().await?;
                    continue;
                }
            }

            // Deferred duplicates go ahead of fresh claims.
            if let Some(fetched) = self.carry.pop_front() {
                self.pack_one(fetched).await?;
                continue;
            }

            let batch = match self
                .packer
                .source
                .claim(&[self.shard_id], self.sizer.current())
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    self.sizer.on_failure();
                    tracing::warn!(shard_id = self.shard_id, error = %e, "claim failed");
                    self.idle_wait(shutdown, lost).await;
                    continue;
                }
            };

            if batch.is_empty() {
                self.idle_wait(shutdown, lost).await;
                continue;
            }

            let mut fetch_failures = false;
            for pending in batch {
                if *lost.borrow() || *shutdown.borrow() {
                    // Remaining claims stay stamped; the claim timeout
                    // returns them to pending.
                    break;
                }
                match self.fetch_one(&pending).await {
                    Ok(bytes) => self.pack_one(Fetched { pending, bytes }).await?,
                    Err(e) => {
                        fetch_failures = true;
                        self.packer.metrics.on_event("fetch_failed", &[], 1.0);
                        tracing::warn!(
                            shard_id = self.shard_id,
                            source = %pending.source,
                            id = pending.id,
                            error = %e,
                            "fetch failed; marking row failed"
                        );
                        if let Err(mark_err) = self
                            .packer
                            .source
                            .mark_failed(&pending, &e.to_string())
                            .await
                        {
                            tracing::warn!(error = %mark_err, "mark_failed errored");
                        }
                    }
                }
            }

            if fetch_failures {
                self.sizer.on_failure();
            } else {
                self.sizer.on_success();
            }
        }
    }

    async fn idle_wait(&self, shutdown: &mut watch::Receiver<bool>, lost: &mut watch::Receiver<bool>) {
        let idle = Duration::from_secs(self.packer.config.idle_poll_seconds.max(1));
        tokio::select! {
            _ = tokio::time::sleep(idle) => {}
            _ = shutdown.changed() => {}
            _ = lost.changed() => {}
        }
    }

    async fn fetch_one(&self, pending: &PendingFile) -> Result<Bytes> {
        let source: &dyn FileSource = self.packer.source.as_ref();
        with_retries(&self.packer.retry, "source_fetch", || source.fetch(pending)).await
    }

    /// Append one fetched file to the current container.
    ///
    /// Per-file failures (invalid name, invalid metadata) mark that row
    /// failed and return `Ok`; I/O failures are shard-scope and propagate.
    async fn pack_one(&mut self, fetched: Fetched) -> Result<()> {
        self.ensure_open().await?;
        let Some(open) = self.open.as_mut() else {
            return Ok(());
        };

        let name = match &fetched.pending.name {
            Some(stamped) => stamped.clone(),
            None => self.packer.names.next(),
        };

        if open.writer.contains(&name) {
            // Names are only unique within one container; the duplicate is
            // re-routed to the successor container after the next rollover.
            tracing::warn!(
                shard_id = self.shard_id,
                name = %name,
                container_id = %open.record.container_id,
                "duplicate name in open container; deferring to successor"
            );
            self.deferred.push(fetched);
            return Ok(());
        }

        let size = fetched.bytes.len() as u64;
        match open
            .writer
            .add(&name, &fetched.bytes, fetched.pending.meta.clone())
            .await
        {
            Ok(()) => {}
            Err(
                e @ (StorageError::Core(_)
                | StorageError::InvalidMeta(_)
                | StorageError::NameConflict { .. }),
            ) => {
                // Caller-level rejection: this file cannot be packed.
                if let Err(mark_err) = self
                    .packer
                    .source
                    .mark_failed(&fetched.pending, &e.to_string())
                    .await
                {
                    tracing::warn!(error = %mark_err, "mark_failed errored");
                }
                return Ok(());
            }
            Err(e @ (StorageError::ObjectStore(_) | StorageError::ExternalFetch { .. })) => {
                // External sidecar upload failed; the writer state is
                // untouched, so only this file is affected.
                let reason = e.to_string();
                if classify(&PackerError::Storage(e)) == RetryClass::Transient {
                    self.sizer.on_failure();
                }
                if let Err(mark_err) = self
                    .packer
                    .source
                    .mark_failed(&fetched.pending, &reason)
                    .await
                {
                    tracing::warn!(error = %mark_err, "mark_failed errored");
                }
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        open.claims.push(PackedFile {
            source: fetched.pending.source.clone(),
            id: fetched.pending.id,
            name,
        });
        open.files_since_checkpoint += 1;
        open.bytes_since_checkpoint += size;

        self.packer
            .metrics
            .on_event("files_packed", &[("source", fetched.pending.source.as_str())], 1.0);
        self.packer.metrics.on_event("bytes_packed", &[], size as f64);

        self.checkpoint_if_due().await;

        let config = &self.packer.config;
        let must_roll = {
            let open = match self.open.as_ref() {
                Some(open) => open,
                None => return Ok(()),
            };
            open.writer.approximate_size() >= config.max_container_bytes
                || open.writer.file_count() >= config.max_files_per_container
        };
        if must_roll {
            self.rollover().await?;
        }
        Ok(())
    }

    async fn ensure_open(&mut self) -> Result<()> {
        if self.open.is_some() {
            return Ok(());
        }

        let config = &self.packer.config;
        let day = today();
        let container_id = mint_container_id(config.node_id);
        let key = config.archive_key(day, self.shard_id, &container_id);
        let path = config.workdir_path(self.shard_id, day, &container_id);

        let external = ExternalFileStore::for_container(
            self.packer.archive.clone(),
            config.archive_prefix.as_deref(),
            &container_id,
        );
        let writer = ContainerWriter::open(
            &path,
            WriterOptions {
                big_file_threshold: config.big_file_threshold,
                external: Some(external.clone()),
            },
        )
        .await?;

        let record = ContainerRecord {
            container_id: container_id.clone(),
            shard_id: self.shard_id,
            day,
            bucket: config.archive_bucket.clone(),
            key,
            state: ContainerState::Open,
            file_count: 0,
            byte_size: 0,
            created_at: chrono::Utc::now().timestamp_millis(),
            committed_at: None,
            owner_id: self.lease.owner_id.clone(),
            generation: self.lease.generation,
        };
        let store: &dyn MetadataStore = self.packer.store.as_ref();
        let record_ref = &record;
        with_retries(&self.packer.retry, "create_container", || async move {
            store.create_container(record_ref).await.map_err(PackerError::from)
        })
        .await?;

        tracing::info!(
            shard_id = self.shard_id,
            container_id = %container_id,
            day = %day,
            "container opened"
        );
        self.packer.metrics.on_event("containers_opened", &[], 1.0);

        self.open = Some(OpenContainer {
            writer,
            record,
            external,
            day,
            path,
            claims: Vec::new(),
            files_since_checkpoint: 0,
            bytes_since_checkpoint: 0,
        });
        Ok(())
    }

    /// Best-effort progress checkpoint; a failed checkpoint only costs
    /// restart precision, never the shard.
    async fn checkpoint_if_due(&mut self) {
        let config = &self.packer.config;
        let Some(open) = self.open.as_mut() else {
            return;
        };
        if open.files_since_checkpoint < config.checkpoint_interval_files
            && open.bytes_since_checkpoint < config.checkpoint_interval_bytes
        {
            return;
        }

        let result = self
            .packer
            .store
            .update_container_progress(
                &open.record.container_id,
                open.writer.file_count(),
                open.writer.approximate_size(),
            )
            .await;
        match result {
            Ok(()) => {
                open.files_since_checkpoint = 0;
                open.bytes_since_checkpoint = 0;
                self.packer.readiness.record_db_ping();
            }
            Err(e) => {
                tracing::warn!(
                    container_id = %open.record.container_id,
                    error = %e,
                    "progress checkpoint failed"
                );
            }
        }
    }

    /// Close the current container: finalize, upload, commit, mark rows.
    async fn rollover(&mut self) -> Result<()> {
        let Some(open) = self.open.take() else {
            return Ok(());
        };

        if open.writer.file_count() == 0 {
            // Nothing packed (e.g. a day boundary hit an empty writer).
            let container_id = open.record.container_id.clone();
            if let Err(e) = open.writer.abort().await {
                tracing::warn!(error = %e, "empty container discard failed");
            }
            let _ = self.packer.store.abandon(&container_id).await;
            self.carry.extend(self.deferred.drain(..));
            return Ok(());
        }

        let record = open.record;
        let claims = open.claims;
        let path = open.path;
        let external = open.external;
        let external_uploads: Vec<String> = open
            .writer
            .external_files()
            .iter()
            .map(|r| r.name.clone())
            .collect();

        let stats = match open.writer.finalize().await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::error!(
                    container_id = %record.container_id,
                    error = %e,
                    "finalize failed; abandoning container"
                );
                let _ = tokio::fs::remove_file(&path).await;
                for name in &external_uploads {
                    let _ = external.delete(name).await;
                }
                let _ = self.packer.store.abandon(&record.container_id).await;
                self.packer.metrics.on_event("containers_abandoned", &[], 1.0);
                return Err(e.into());
            }
        };

        let store: &dyn MetadataStore = self.packer.store.as_ref();
        let retry = &self.packer.retry;
        let container_id = record.container_id.as_str();

        with_retries(retry, "container_progress", || async move {
            store
                .update_container_progress(container_id, stats.file_count, stats.byte_size)
                .await
                .map_err(PackerError::from)
        })
        .await?;
        with_retries(retry, "mark_uploading", || async move {
            store.mark_uploading(container_id).await.map_err(PackerError::from)
        })
        .await?;

        // Upload the finished container.
        let body = tokio::fs::read(&path).await?;
        let location = ObjectPath::from(record.key.as_str());
        let location_ref = &location;
        let archive: &dyn ObjectStore = self.packer.archive.as_ref();
        let upload = with_retries(retry, "archive_upload", || {
            let payload = Bytes::from(body.clone());
            async move {
                archive
                    .put(location_ref, payload)
                    .await
                    .map_err(PackerError::from)?;
                Ok(())
            }
        })
        .await;

        if let Err(e) = upload {
            tracing::error!(
                container_id = %record.container_id,
                key = %record.key,
                error = %e,
                "upload failed; abandoning container"
            );
            let _ = tokio::fs::remove_file(&path).await;
            let _ = store.abandon(&record.container_id).await;
            self.packer.metrics.on_event("containers_abandoned", &[], 1.0);
            return Err(e);
        }
        self.packer.readiness.record_store_head();

        // Container first, then rows: commit the record before marking the
        // source claims packed.
        with_retries(retry, "mark_committed", || async move {
            store.mark_committed(container_id).await.map_err(PackerError::from)
        })
        .await?;

        if let Err(e) = self
            .packer
            .source
            .mark_packed(&record.container_id, &claims)
            .await
        {
            // The container is committed; unmarked rows will be reclaimed
            // and re-packed, which duplicate-across-containers allows.
            tracing::error!(
                container_id = %record.container_id,
                error = %e,
                "failed to mark source rows packed"
            );
        }

        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::warn!(path = %path.display(), error = %e, "scratch file cleanup failed");
        }

        tracing::info!(
            shard_id = self.shard_id,
            container_id = %record.container_id,
            key = %record.key,
            file_count = stats.file_count,
            byte_size = stats.byte_size,
            external_files = stats.external_files,
            "container committed"
        );
        self.packer.metrics.on_event("containers_committed", &[], 1.0);
        self.packer
            .metrics
            .on_event("container_bytes", &[], stats.byte_size as f64);

        // Deferred duplicates now have a fresh container to land in.
        self.carry.extend(self.deferred.drain(..));
        Ok(())
    }

    /// LOST / failure path: discard the writer, abandon the record, clean
    /// up sidecar uploads. Claims revert to pending through recovery.
    async fn abandon_open(&mut self, reason: &str) {
        let Some(open) = self.open.take() else {
            return;
        };
        let container_id = open.record.container_id.clone();
        let externals: Vec<String> = open
            .writer
            .external_files()
            .iter()
            .map(|r| r.name.clone())
            .collect();

        if let Err(e) = open.writer.abort().await {
            tracing::warn!(container_id = %container_id, error = %e, "writer abort failed");
        }
        for name in externals {
            let _ = open.external.delete(&name).await;
        }
        if let Err(e) = self.packer.store.abandon(&container_id).await {
            tracing::warn!(container_id = %container_id, error = %e, "abandon failed");
        }

        tracing::warn!(
            shard_id = self.shard_id,
            container_id = %container_id,
            reason,
            "container abandoned"
        );
        self.packer.metrics.on_event("containers_abandoned", &[], 1.0);
    }

    /// Shutdown policy: finalize and upload when at least `min_commit_files`
    /// are buffered and the grace window allows; abort otherwise.
    async fn shutdown_flush(&mut self) {
        let Some(open) = &self.open else {
            return;
        };
        let container_id = open.record.container_id.clone();
        let config = &self.packer.config;

        if open.writer.file_count() < config.min_commit_files {
            self.abandon_open("below min_commit_files at shutdown").await;
            return;
        }

        let grace = Duration::from_secs(config.shutdown_grace_seconds.max(1));
        match tokio::time::timeout(grace, self.rollover()).await {
            Ok(Ok(())) => {
                tracing::info!(shard_id = self.shard_id, "flushed open container on shutdown");
            }
            Ok(Err(e)) => {
                tracing::error!(shard_id = self.shard_id, error = %e, "shutdown flush failed");
            }
            Err(_) => {
                // The in-flight rollover was dropped; the record stays
                // non-committed and the next recovery sweep reconciles it.
                tracing::error!(
                    shard_id = self.shard_id,
                    container_id = %container_id,
                    "shutdown grace expired mid-flush"
                );
                let _ = self.packer.store.abandon(&container_id).await;
            }
        }
    }
}

fn today() -> NaiveDate {
    chrono::Utc::now().date_naive()
}

/// Time-sortable container id: 44 bits of epoch milliseconds, the node id,
/// and 32 random bits, all hex.
fn mint_container_id(node_id: u8) -> String {
    let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let suffix: u32 = rand::random();
    format!("{now:011x}{node_id:02x}{suffix:08x}")
}

//! Crash recovery sweep tests.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::ObjectStore;
use serde_json::json;
use tempfile::TempDir;

use common::MemorySource;
use easystore_metadata::{
    ContainerRecord, ContainerState, MemoryMetadataStore, MetadataStore,
};
use easystore_packer::{CrashRecovery, FileSource, RecoveryConfig};
use easystore_storage::{ContainerWriter, WriterOptions};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn stale_record(id: &str, key: &str, file_count: u64) -> ContainerRecord {
    ContainerRecord {
        container_id: id.to_string(),
        shard_id: 1,
        day: chrono::NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
        bucket: "archive".to_string(),
        key: key.to_string(),
        state: ContainerState::Open,
        file_count,
        byte_size: 0,
        created_at: now_ms() - 3_600_000,
        committed_at: None,
        owner_id: "dead-worker".to_string(),
        generation: 1,
    }
}

/// Build a valid container with `files` entries and return its bytes.
async fn container_bytes(files: usize) -> Vec<u8> {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("c.des");
    let mut writer = ContainerWriter::open(&path, WriterOptions::default())
        .await
        .unwrap();
    for i in 0..files {
        writer
            .add(&format!("f{i}"), format!("body-{i}").as_bytes(), json!({}))
            .await
            .unwrap();
    }
    writer.finalize().await.unwrap();
    std::fs::read(&path).unwrap()
}

fn recovery(
    store: &Arc<MemoryMetadataStore>,
    archive: &Arc<dyn ObjectStore>,
    source: Option<Arc<dyn FileSource>>,
) -> CrashRecovery {
    CrashRecovery::new(
        store.clone() as Arc<dyn MetadataStore>,
        archive.clone(),
        source,
        RecoveryConfig {
            stale_age: Duration::from_secs(60),
        },
    )
}

#[tokio::test]
async fn test_expired_leases_are_released() {
    let store = Arc::new(MemoryMetadataStore::new());
    let archive: Arc<dyn ObjectStore> = Arc::new(InMemory::new());

    store.try_acquire(1, "dead", 0).await.unwrap().unwrap();
    store.try_acquire(2, "alive", 3600).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let report = recovery(&store, &archive, None).sweep_once().await.unwrap();
    assert_eq!(report.leases_released, 1);
    assert!(store.get_lease(1).await.unwrap().is_none());
    assert!(store.get_lease(2).await.unwrap().is_some());
}

#[tokio::test]
async fn test_valid_footer_salvages_container() {
    let store = Arc::new(MemoryMetadataStore::new());
    let archive: Arc<dyn ObjectStore> = Arc::new(InMemory::new());

    // Crash happened after upload but before mark_uploaded: the object is
    // complete, the record still says OPEN with a stale file_count.
    let bytes = container_bytes(5).await;
    archive
        .put(&Path::from("2025-01-15/01/c-salvage.des"), Bytes::from(bytes))
        .await
        .unwrap();
    store
        .create_container(&stale_record("c-salvage", "2025-01-15/01/c-salvage.des", 2))
        .await
        .unwrap();

    let report = recovery(&store, &archive, None).sweep_once().await.unwrap();
    assert_eq!(report.containers_salvaged, 1);
    assert_eq!(report.containers_abandoned, 0);
    assert_eq!(report.file_counts_corrected, 1);

    let record = store.get_container("c-salvage").await.unwrap().unwrap();
    assert_eq!(record.state, ContainerState::Committed);
    assert_eq!(record.file_count, 5);
}

#[tokio::test]
async fn test_partial_object_is_deleted_and_abandoned() {
    let store = Arc::new(MemoryMetadataStore::new());
    let archive: Arc<dyn ObjectStore> = Arc::new(InMemory::new());

    // A truncated upload: bytes exist but the trailing magic is garbage.
    let mut bytes = container_bytes(3).await;
    bytes.truncate(bytes.len() - 37);
    let key = "2025-01-15/01/c-partial.des";
    archive.put(&Path::from(key), Bytes::from(bytes)).await.unwrap();
    store
        .create_container(&stale_record("c-partial", key, 3))
        .await
        .unwrap();

    let report = recovery(&store, &archive, None).sweep_once().await.unwrap();
    assert_eq!(report.containers_abandoned, 1);
    assert_eq!(report.containers_salvaged, 0);

    let record = store.get_container("c-partial").await.unwrap().unwrap();
    assert_eq!(record.state, ContainerState::Abandoned);
    // The partial object is gone.
    assert!(archive.head(&Path::from(key)).await.is_err());
}

#[tokio::test]
async fn test_missing_object_is_abandoned() {
    let store = Arc::new(MemoryMetadataStore::new());
    let archive: Arc<dyn ObjectStore> = Arc::new(InMemory::new());

    store
        .create_container(&stale_record("c-ghost", "2025-01-15/01/c-ghost.des", 0))
        .await
        .unwrap();

    let report = recovery(&store, &archive, None).sweep_once().await.unwrap();
    assert_eq!(report.containers_abandoned, 1);
    assert_eq!(
        store.get_container("c-ghost").await.unwrap().unwrap().state,
        ContainerState::Abandoned
    );
}

#[tokio::test]
async fn test_fresh_open_containers_are_left_alone() {
    let store = Arc::new(MemoryMetadataStore::new());
    let archive: Arc<dyn ObjectStore> = Arc::new(InMemory::new());

    let mut record = stale_record("c-live", "2025-01-15/01/c-live.des", 0);
    record.created_at = now_ms();
    store.create_container(&record).await.unwrap();

    let report = recovery(&store, &archive, None).sweep_once().await.unwrap();
    assert_eq!(report.containers_abandoned, 0);
    assert_eq!(
        store.get_container("c-live").await.unwrap().unwrap().state,
        ContainerState::Open
    );
}

#[tokio::test]
async fn test_committed_containers_are_never_touched() {
    let store = Arc::new(MemoryMetadataStore::new());
    let archive: Arc<dyn ObjectStore> = Arc::new(InMemory::new());

    let mut record = stale_record("c-done", "2025-01-15/01/c-done.des", 4);
    record.state = ContainerState::Committed;
    store.create_container(&record).await.unwrap();

    let report = recovery(&store, &archive, None).sweep_once().await.unwrap();
    assert_eq!(report.containers_salvaged + report.containers_abandoned, 0);
    assert_eq!(
        store.get_container("c-done").await.unwrap().unwrap().state,
        ContainerState::Committed
    );
}

#[tokio::test]
async fn test_stuck_claims_reset_to_pending() {
    let store = Arc::new(MemoryMetadataStore::new());
    let archive: Arc<dyn ObjectStore> = Arc::new(InMemory::new());

    let source = Arc::new(MemorySource::new(Duration::ZERO));
    for i in 0..6 {
        source.add_file(i, 1, None, b"x");
    }
    source.claim_all_externally();
    assert_eq!(source.count("claimed"), 6);

    let report = recovery(&store, &archive, Some(source.clone() as Arc<dyn FileSource>))
        .sweep_once()
        .await
        .unwrap();
    assert_eq!(report.claims_reset, 6);
    assert_eq!(source.count("pending"), 6);
}

#[tokio::test]
async fn test_crash_mid_upload_scenario_reconciles() {
    // The 8.8.6-style scenario: the packer died between finalize and
    // mark_uploaded. One container made it to the archive intact, one did
    // not; claims are stuck; the dead worker's lease is expired.
    let store = Arc::new(MemoryMetadataStore::new());
    let archive: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let source = Arc::new(MemorySource::new(Duration::ZERO));

    store.try_acquire(1, "dead-worker", 0).await.unwrap().unwrap();

    let good = container_bytes(2).await;
    archive
        .put(&Path::from("2025-01-15/01/c-good.des"), Bytes::from(good))
        .await
        .unwrap();
    store
        .create_container(&stale_record("c-good", "2025-01-15/01/c-good.des", 2))
        .await
        .unwrap();

    let mut bad = container_bytes(2).await;
    let len = bad.len();
    bad[len - 4] ^= 0xFF;
    archive
        .put(&Path::from("2025-01-15/01/c-bad.des"), Bytes::from(bad))
        .await
        .unwrap();
    store
        .create_container(&stale_record("c-bad", "2025-01-15/01/c-bad.des", 2))
        .await
        .unwrap();

    for i in 0..4 {
        source.add_file(i, 1, None, b"x");
    }
    source.claim_all_externally();

    tokio::time::sleep(Duration::from_millis(5)).await;
    let report = recovery(&store, &archive, Some(source.clone() as Arc<dyn FileSource>))
        .sweep_once()
        .await
        .unwrap();

    // (a) no row is stuck in claimed
    assert_eq!(source.count("claimed"), 0);
    assert_eq!(source.count("pending"), 4);
    // (b) no non-COMMITTED record keeps a live archive object
    assert_eq!(
        store.get_container("c-bad").await.unwrap().unwrap().state,
        ContainerState::Abandoned
    );
    assert!(archive
        .head(&Path::from("2025-01-15/01/c-bad.des"))
        .await
        .is_err());
    // (c) every committed container validates
    assert_eq!(
        store.get_container("c-good").await.unwrap().unwrap().state,
        ContainerState::Committed
    );
    easystore_storage::RangeContainerReader::open(archive.clone(), "2025-01-15/01/c-good.des")
        .await
        .unwrap();
    // and the worker's lease is gone
    assert_eq!(report.leases_released, 1);
    assert!(store.get_lease(1).await.unwrap().is_none());
}

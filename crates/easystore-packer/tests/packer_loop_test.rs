//! End-to-end packer tests: in-memory source, metadata store, and archive.

mod common;

use std::sync::Arc;
use std::time::Duration;

use object_store::memory::InMemory;
use object_store::ObjectStore;
use tempfile::TempDir;
use tokio::sync::watch;

use common::MemorySource;
use easystore_metadata::{ContainerState, MemoryMetadataStore, MetadataStore};
use easystore_packer::{FileSource, Packer, PackerConfig, Readiness, RecordingSink};
use easystore_storage::RangeContainerReader;

struct Harness {
    _workdir: TempDir,
    store: Arc<MemoryMetadataStore>,
    source: Arc<MemorySource>,
    archive: Arc<dyn ObjectStore>,
    metrics: Arc<RecordingSink>,
    packer: Packer,
}

fn harness(tune: impl FnOnce(&mut PackerConfig)) -> Harness {
    let workdir = TempDir::new().unwrap();
    let mut config: PackerConfig = serde_json::from_value(serde_json::json!({
        "owner_id": "test-worker",
        "workdir": workdir.path(),
        "archive_bucket": "archive",
        "shard_bits": 3,
        "lease_ttl_seconds": 30,
        "idle_poll_seconds": 1,
        "claim_batch_max": 16,
        "shutdown_grace_seconds": 10,
    }))
    .unwrap();
    tune(&mut config);

    let store = Arc::new(MemoryMetadataStore::new());
    let source = Arc::new(MemorySource::new(Duration::ZERO));
    let archive: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let metrics = Arc::new(RecordingSink::new());

    let packer = Packer::new(
        store.clone(),
        source.clone(),
        archive.clone(),
        config,
        metrics.clone(),
        Arc::new(Readiness::default()),
    )
    .unwrap();

    Harness {
        _workdir: workdir,
        store,
        source,
        archive,
        metrics,
        packer,
    }
}

async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

#[tokio::test]
async fn test_packs_commits_and_reads_back() {
    let h = harness(|_| {});
    for i in 0..8 {
        h.source
            .add_file(i, 5, None, format!("payload-{i}").as_bytes());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let packer = h.packer.clone();
    let run = tokio::spawn(async move { packer.run(vec![5], shutdown_rx).await });

    // All rows get claimed and appended, then the shutdown flush commits.
    assert!(
        wait_until(Duration::from_secs(10), || h.metrics.total("files_packed") >= 8.0).await,
        "files never packed: {:?}",
        h.source.status_counts()
    );
    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(15), run)
        .await
        .expect("packer did not stop")
        .unwrap()
        .unwrap();

    assert_eq!(h.source.count("packed"), 8, "{:?}", h.source.status_counts());

    // Every packed row points at a COMMITTED container whose archive object
    // validates and holds the row's bytes under its recorded name.
    let packed = h.source.packed_rows();
    for row in &packed {
        let container_id = row.container_id.as_ref().unwrap();
        let record = h.store.get_container(container_id).await.unwrap().unwrap();
        assert_eq!(record.state, ContainerState::Committed);
        assert!(record.committed_at.is_some());

        let reader = RangeContainerReader::open(h.archive.clone(), &record.key)
            .await
            .unwrap();
        let name = row.packed_name.as_ref().unwrap();
        assert_eq!(
            &reader.get(name).await.unwrap()[..],
            &row.bytes[..],
            "bytes mismatch for {name}"
        );
        let meta = reader.get_meta(name).await.unwrap();
        assert_eq!(meta["origin"], "test");
        assert_eq!(meta["size"], row.bytes.len() as u64);
    }

    // The shutdown path released the lease.
    assert!(h.store.get_lease(5).await.unwrap().is_none());
    assert!(h.metrics.total("containers_committed") >= 1.0);
}

#[tokio::test]
async fn test_rollover_on_file_count() {
    let h = harness(|config| {
        config.max_files_per_container = 3;
    });
    for i in 0..7 {
        h.source.add_file(i, 2, None, b"x");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let packer = h.packer.clone();
    let run = tokio::spawn(async move { packer.run(vec![2], shutdown_rx).await });

    assert!(
        wait_until(Duration::from_secs(10), || {
            h.metrics.total("containers_committed") >= 2.0
        })
        .await,
        "rollover never happened"
    );
    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(15), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    // 7 files at 3 per container: two full containers plus the flush.
    assert_eq!(h.source.count("packed"), 7);
    assert!(h.metrics.total("containers_committed") >= 3.0);

    // Full containers really hold at most 3 files.
    for row in h.source.packed_rows() {
        let record = h
            .store
            .get_container(row.container_id.as_ref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(record.file_count <= 3, "container overfilled: {record:?}");
    }
}

#[tokio::test]
async fn test_fetch_failure_marks_row_failed_and_batch_continues() {
    let h = harness(|_| {});
    for i in 0..5 {
        h.source.add_file(i, 1, None, b"data");
    }
    h.source.fail_fetch(3);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let packer = h.packer.clone();
    let run = tokio::spawn(async move { packer.run(vec![1], shutdown_rx).await });

    assert!(
        wait_until(Duration::from_secs(10), || {
            h.source.count("failed") == 1 && h.metrics.total("files_packed") >= 4.0
        })
        .await,
        "{:?}",
        h.source.status_counts()
    );
    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(15), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(h.source.count("packed"), 4);
    assert_eq!(h.source.count("failed"), 1);
}

#[tokio::test]
async fn test_stamped_names_are_used_verbatim() {
    let h = harness(|_| {});
    h.source.add_file(1, 4, Some("IMG_20250115_AABBCCDDEEFF_01"), b"stamped");
    h.source.add_file(2, 4, None, b"minted");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let packer = h.packer.clone();
    let run = tokio::spawn(async move { packer.run(vec![4], shutdown_rx).await });

    assert!(wait_until(Duration::from_secs(10), || h.metrics.total("files_packed") >= 2.0).await);
    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(15), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let packed = h.source.packed_rows();
    let stamped = packed.iter().find(|r| r.file.id == 1).unwrap();
    assert_eq!(
        stamped.packed_name.as_deref(),
        Some("IMG_20250115_AABBCCDDEEFF_01")
    );
    let minted = packed.iter().find(|r| r.file.id == 2).unwrap();
    assert!(minted.packed_name.as_deref().unwrap().starts_with("DES_"));
}

#[tokio::test]
async fn test_lease_takeover_triggers_lost_and_abandon() {
    let h = harness(|config| {
        // A lease that expires immediately: any successor can take it.
        config.lease_ttl_seconds = 0;
    });
    for i in 0..4 {
        h.source.add_file(i, 6, None, b"doomed");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let packer = h.packer.clone();
    let run = tokio::spawn(async move { packer.run(vec![6], shutdown_rx).await });

    // Wait for the worker to open a container, then steal the shard.
    assert!(
        wait_until(Duration::from_secs(10), || {
            h.metrics.total("containers_opened") >= 1.0
        })
        .await
    );
    // The ttl-0 lease is expired except in the exact millisecond of a
    // renewal; retry the steal until it lands.
    let mut stolen = false;
    for _ in 0..500 {
        if h.store.try_acquire(6, "thief", 300).await.unwrap().is_some() {
            stolen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(stolen, "could not take over the expired lease");

    // The next heartbeat renewal is refused and the shard goes LOST.
    assert!(
        wait_until(Duration::from_secs(10), || h.metrics.total("shard_lost") >= 1.0).await,
        "loss never detected"
    );
    assert!(h.metrics.total("containers_abandoned") >= 1.0);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(15), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    // Nothing was committed; claimed rows are recoverable, the thief's
    // lease is untouched.
    assert_eq!(h.source.count("packed"), 0);
    assert_eq!(h.store.get_lease(6).await.unwrap().unwrap().owner_id, "thief");
    let reset = h.source.reset_stale_claims().await.unwrap();
    assert!(reset > 0, "claims should revert to pending");
    assert_eq!(h.source.count("pending"), h.source.status_counts().values().sum::<usize>());
}

#[tokio::test]
async fn test_external_files_divert_to_sidecar() {
    let h = harness(|config| {
        config.big_file_threshold = 1024;
    });
    let big = vec![0x42u8; 10 * 1024];
    h.source.add_file(1, 3, None, &big);
    h.source.add_file(2, 3, None, b"small");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let packer = h.packer.clone();
    let run = tokio::spawn(async move { packer.run(vec![3], shutdown_rx).await });

    assert!(wait_until(Duration::from_secs(10), || h.metrics.total("files_packed") >= 2.0).await);
    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(15), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let packed = h.source.packed_rows();
    let big_row = packed.iter().find(|r| r.file.id == 1).unwrap();
    let record = h
        .store
        .get_container(big_row.container_id.as_ref().unwrap())
        .await
        .unwrap()
        .unwrap();

    let reader = RangeContainerReader::open(h.archive.clone(), &record.key)
        .await
        .unwrap();
    let name = big_row.packed_name.as_ref().unwrap();
    let meta = reader.get_meta(name).await.unwrap();
    assert_eq!(meta["is_external"], true);
    assert_eq!(&reader.get(name).await.unwrap()[..], &big[..]);
}

//! In-memory source database for pipeline tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;

use easystore_packer::{FileSource, PackedFile, PendingFile, Result};

#[derive(Clone)]
pub struct SourceRow {
    pub file: PendingFile,
    pub bytes: Bytes,
    pub status: String,
    pub claimed_at: Option<Instant>,
    pub packed_name: Option<String>,
    pub container_id: Option<String>,
}

/// A [`FileSource`] over plain vectors: claim/fetch/mark semantics match
/// the SQL provider, minus the SQL.
pub struct MemorySource {
    rows: Mutex<Vec<SourceRow>>,
    claim_timeout: Duration,
    fail_fetch: Mutex<HashSet<i64>>,
}

impl MemorySource {
    pub fn new(claim_timeout: Duration) -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            claim_timeout,
            fail_fetch: Mutex::new(HashSet::new()),
        }
    }

    pub fn add_file(&self, id: i64, shard_id: u32, name: Option<&str>, bytes: &[u8]) {
        let file = PendingFile {
            source: "memory".to_string(),
            id,
            bucket: "source-bucket".to_string(),
            key: format!("incoming/{id}"),
            size_bytes: bytes.len() as u64,
            shard_id,
            name: name.map(str::to_string),
            meta: json!({"origin": "test"}),
        };
        self.rows.lock().unwrap().push(SourceRow {
            file,
            bytes: Bytes::copy_from_slice(bytes),
            status: "pending".to_string(),
            claimed_at: None,
            packed_name: None,
            container_id: None,
        });
    }

    /// Make fetches of this row fail permanently.
    pub fn fail_fetch(&self, id: i64) {
        self.fail_fetch.lock().unwrap().insert(id);
    }

    /// Force every row into `claimed` (as a crashed worker would leave it).
    pub fn claim_all_externally(&self) {
        for row in self.rows.lock().unwrap().iter_mut() {
            row.status = "claimed".to_string();
            row.claimed_at = Some(Instant::now());
        }
    }

    pub fn status_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for row in self.rows.lock().unwrap().iter() {
            *counts.entry(row.status.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub fn count(&self, status: &str) -> usize {
        self.status_counts().get(status).copied().unwrap_or(0)
    }

    pub fn packed_rows(&self) -> Vec<SourceRow> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.status == "packed")
            .cloned()
            .collect()
    }
}

#[async_trait]
impl FileSource for MemorySource {
    async fn claim(&self, shard_ids: &[u32], limit: u32) -> Result<Vec<PendingFile>> {
        let mut rows = self.rows.lock().unwrap();
        let mut claimed = Vec::new();
        for row in rows.iter_mut() {
            if claimed.len() >= limit as usize {
                break;
            }
            if row.status == "pending" && shard_ids.contains(&row.file.shard_id) {
                row.status = "claimed".to_string();
                row.claimed_at = Some(Instant::now());
                claimed.push(row.file.clone());
            }
        }
        Ok(claimed)
    }

    async fn fetch(&self, file: &PendingFile) -> Result<Bytes> {
        if self.fail_fetch.lock().unwrap().contains(&file.id) {
            return Err(easystore_packer::PackerError::ObjectStore(
                object_store::Error::NotFound {
                    path: file.key.clone(),
                    source: "gone".into(),
                },
            ));
        }
        let rows = self.rows.lock().unwrap();
        let row = rows
            .iter()
            .find(|r| r.file.id == file.id)
            .expect("unknown file id");
        Ok(row.bytes.clone())
    }

    async fn mark_packed(&self, container_id: &str, files: &[PackedFile]) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        for packed in files {
            if let Some(row) = rows.iter_mut().find(|r| r.file.id == packed.id) {
                row.status = "packed".to_string();
                row.packed_name = Some(packed.name.clone());
                row.container_id = Some(container_id.to_string());
            }
        }
        Ok(())
    }

    async fn mark_failed(&self, file: &PendingFile, _reason: &str) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.iter_mut().find(|r| r.file.id == file.id) {
            row.status = "failed".to_string();
        }
        Ok(())
    }

    async fn reset_stale_claims(&self) -> Result<u64> {
        let mut rows = self.rows.lock().unwrap();
        let mut reset = 0;
        for row in rows.iter_mut() {
            let stale = row
                .claimed_at
                .map(|at| at.elapsed() >= self.claim_timeout)
                .unwrap_or(true);
            if row.status == "claimed" && stale {
                row.status = "pending".to_string();
                row.claimed_at = None;
                reset += 1;
            }
        }
        Ok(reset)
    }
}

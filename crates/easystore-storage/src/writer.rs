//! Container Writer
//!
//! [`ContainerWriter`] builds one DES container append-only:
//!
//! 1. `open` creates the file and writes the 16-byte header immediately.
//! 2. Every `add` appends raw bytes to DATA and remembers the entry; files
//!    at or above the big-file threshold are diverted to the external
//!    sidecar and leave only a stub entry behind.
//! 3. `finalize` writes META (length-prefixed canonical-JSON blobs), then
//!    INDEX (entries in insertion order), then the footer, and flushes.
//! 4. `abort` removes the in-progress file; nothing committed may reference
//!    an aborted object.
//!
//! Insertion order is preserved in both DATA and INDEX — that contiguity is
//! what makes batched range reads effective on the read side.
//!
//! Writers are single-owner (`&mut self` throughout); any I/O failure
//! surfaces as a typed error and the caller is expected to abort.
//!
//! ## Usage
//!
//! ```ignore
//! let mut writer = ContainerWriter::open(&path, WriterOptions::default()).await?;
//! writer.add("a.txt", b"hello", json!({"mime": "text/plain"})).await?;
//! let stats = writer.finalize().await?;
//! assert_eq!(stats.file_count, 1);
//! ```
//!
//! The scoped form runs `finalize` on success and `abort` on every error
//! path:
//!
//! ```ignore
//! let (names, stats) = with_container(&path, options, |w| {
//!     Box::pin(async move {
//!         w.add("a", data, meta).await?;
//!         Ok(vec!["a".to_string()])
//!     })
//! })
//! .await?;
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use easystore_core::format::{
    self, ContainerStats, Footer, IndexEntry, DEFAULT_BIG_FILE_THRESHOLD, ENTRY_FIXED_SIZE,
    FLAG_EXTERNAL, FOOTER_SIZE, HEADER_SIZE, VERSION,
};
use easystore_core::meta::canonical_meta_bytes;
use easystore_core::naming::validate_name;

use crate::error::{Error, Result};
use crate::external::ExternalFileStore;

/// Writer construction options.
#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Payloads at or above this size are diverted to the sidecar (when one
    /// is configured).
    pub big_file_threshold: u64,

    /// Sidecar handle for diverted files. Without it every payload stays in
    /// DATA regardless of size.
    pub external: Option<ExternalFileStore>,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            big_file_threshold: DEFAULT_BIG_FILE_THRESHOLD,
            external: None,
        }
    }
}

/// One external file uploaded while building a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalFileRecord {
    pub name: String,
    pub key: String,
    pub size_bytes: u64,
}

struct PendingEntry {
    name: String,
    data_offset: u64,
    data_length: u64,
    flags: u32,
    meta: Vec<u8>,
}

/// Append-only builder for one DES container.
pub struct ContainerWriter {
    path: PathBuf,
    file: Option<File>,
    cursor: u64,
    entries: Vec<PendingEntry>,
    names: HashSet<String>,
    options: WriterOptions,
    external_files: Vec<ExternalFileRecord>,
}

impl ContainerWriter {
    /// Create the container file (must not exist) and write the header.
    pub async fn open(path: impl AsRef<Path>, options: WriterOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;

        let mut header = BytesMut::with_capacity(HEADER_SIZE);
        format::encode_header(&mut header);
        file.write_all(&header).await?;
        file.flush().await?;

        Ok(Self {
            path,
            file: Some(file),
            cursor: HEADER_SIZE as u64,
            entries: Vec::new(),
            names: HashSet::new(),
            options,
            external_files: Vec::new(),
        })
    }

    /// Append one file.
    ///
    /// The name must be valid (see `easystore_core::naming::validate_name`)
    /// and unique within this container. `meta` must be a JSON object (or
    /// null); the writer injects `size`, and for diverted files
    /// `is_external` and `external_key`.
    pub async fn add(&mut self, name: &str, data: &[u8], meta: Value) -> Result<()> {
        let divert = self.options.external.is_some()
            && data.len() as u64 >= self.options.big_file_threshold;
        self.add_inner(name, data, meta, divert).await
    }

    /// Append one file, diverting it to the sidecar regardless of size.
    pub async fn add_external(&mut self, name: &str, data: &[u8], meta: Value) -> Result<()> {
        if self.options.external.is_none() {
            return Err(Error::ExternalNotConfigured);
        }
        self.add_inner(name, data, meta, true).await
    }

    async fn add_inner(&mut self, name: &str, data: &[u8], meta: Value, divert: bool) -> Result<()> {
        if self.file.is_none() {
            return Err(Error::WriterClosed);
        }
        validate_name(name)?;
        if self.names.contains(name) {
            return Err(Error::NameConflict {
                name: name.to_string(),
            });
        }

        let mut meta_obj = match meta {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => {
                return Err(Error::InvalidMeta(format!(
                    "metadata must be a JSON object, got {other}"
                )))
            }
        };
        meta_obj.insert("size".to_string(), Value::from(data.len() as u64));

        let (data_offset, data_length, flags) = if divert {
            let external = self
                .options
                .external
                .as_ref()
                .ok_or(Error::ExternalNotConfigured)?;
            let key = external.put(name, Bytes::copy_from_slice(data)).await?;

            meta_obj.insert("is_external".to_string(), Value::Bool(true));
            meta_obj.insert("external_key".to_string(), Value::from(key.clone()));
            self.external_files.push(ExternalFileRecord {
                name: name.to_string(),
                key,
                size_bytes: data.len() as u64,
            });

            (0u64, 0u64, FLAG_EXTERNAL)
        } else {
            let offset = self.cursor;
            let file = self.file.as_mut().ok_or(Error::WriterClosed)?;
            file.write_all(data).await?;
            self.cursor += data.len() as u64;
            (offset, data.len() as u64, 0u32)
        };

        let meta_bytes = canonical_meta_bytes(&Value::Object(meta_obj))?;

        self.names.insert(name.to_string());
        self.entries.push(PendingEntry {
            name: name.to_string(),
            data_offset,
            data_length,
            flags,
            meta: meta_bytes,
        });

        Ok(())
    }

    /// Whether a name was already added.
    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Number of files added so far.
    pub fn file_count(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Bytes of the finished container, estimated from what is buffered.
    pub fn approximate_size(&self) -> u64 {
        let pending: u64 = self
            .entries
            .iter()
            .map(|e| 4 + e.meta.len() as u64 + (2 + e.name.len() + ENTRY_FIXED_SIZE) as u64)
            .sum();
        self.cursor + pending + FOOTER_SIZE as u64
    }

    /// External files uploaded by this writer so far.
    pub fn external_files(&self) -> &[ExternalFileRecord] {
        &self.external_files
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write META, INDEX, and the footer, then flush and sync.
    pub async fn finalize(mut self) -> Result<ContainerStats> {
        let mut file = self.file.take().ok_or(Error::WriterClosed)?;

        let data_length = self.cursor - HEADER_SIZE as u64;
        let meta_start = self.cursor;

        // META region: u32 length prefix + canonical JSON blob per entry.
        // Offsets recorded against the blob itself, not its prefix.
        let mut meta_region = BytesMut::new();
        let mut index_entries = Vec::with_capacity(self.entries.len());
        for pending in &self.entries {
            let blob_offset = meta_start + meta_region.len() as u64 + 4;
            meta_region.extend_from_slice(&(pending.meta.len() as u32).to_le_bytes());
            meta_region.extend_from_slice(&pending.meta);
            index_entries.push(IndexEntry {
                name: pending.name.clone(),
                data_offset: pending.data_offset,
                data_length: pending.data_length,
                meta_offset: blob_offset,
                meta_length: pending.meta.len() as u32,
                flags: pending.flags,
            });
        }
        file.write_all(&meta_region).await?;
        let meta_length = meta_region.len() as u64;
        let index_start = meta_start + meta_length;

        let mut index_region = BytesMut::new();
        for entry in &index_entries {
            format::encode_entry(entry, &mut index_region)?;
        }
        file.write_all(&index_region).await?;
        let index_length = index_region.len() as u64;

        let footer = Footer {
            data_start: HEADER_SIZE as u64,
            data_length,
            meta_start,
            meta_length,
            index_start,
            index_length,
            file_count: index_entries.len() as u64,
            version: VERSION,
        };
        let mut footer_bytes = BytesMut::with_capacity(FOOTER_SIZE);
        footer.encode(&mut footer_bytes);
        file.write_all(&footer_bytes).await?;

        file.flush().await?;
        file.sync_all().await?;

        let external_files = self.external_files.len() as u64;
        let stats = ContainerStats {
            file_count: index_entries.len() as u64,
            internal_files: index_entries.len() as u64 - external_files,
            external_files,
            data_length,
            meta_length,
            index_length,
            byte_size: footer.footer_start() + FOOTER_SIZE as u64,
        };

        tracing::debug!(
            path = %self.path.display(),
            file_count = stats.file_count,
            byte_size = stats.byte_size,
            external_files = stats.external_files,
            "container finalized"
        );

        Ok(stats)
    }

    /// Discard the in-progress container file.
    pub async fn abort(mut self) -> Result<()> {
        self.file.take();
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Run `f` against a fresh writer; finalize on success, abort on any error.
pub async fn with_container<T, F>(
    path: impl AsRef<Path>,
    options: WriterOptions,
    f: F,
) -> Result<(T, ContainerStats)>
where
    F: for<'a> FnOnce(&'a mut ContainerWriter) -> BoxFuture<'a, Result<T>>,
{
    let mut writer = ContainerWriter::open(path, options).await?;
    match f(&mut writer).await {
        Ok(value) => {
            let stats = writer.finalize().await?;
            Ok((value, stats))
        }
        Err(e) => {
            if let Err(abort_err) = writer.abort().await {
                tracing::warn!(error = %abort_err, "failed to discard aborted container");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn scratch() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.des");
        (dir, path)
    }

    #[tokio::test]
    async fn test_open_writes_header() {
        let (_dir, path) = scratch();
        let writer = ContainerWriter::open(&path, WriterOptions::default())
            .await
            .unwrap();
        drop(writer);

        let raw = std::fs::read(&path).unwrap();
        assert_eq!(raw.len(), HEADER_SIZE);
        assert_eq!(&raw[..8], b"DESHEAD1");
    }

    #[tokio::test]
    async fn test_open_refuses_existing_file() {
        let (_dir, path) = scratch();
        std::fs::write(&path, b"already here").unwrap();
        let result = ContainerWriter::open(&path, WriterOptions::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_finalize_layout() {
        let (_dir, path) = scratch();
        let mut writer = ContainerWriter::open(&path, WriterOptions::default())
            .await
            .unwrap();
        writer.add("a", b"hello", json!({})).await.unwrap();
        writer.add("b", b"world!", json!({})).await.unwrap();
        let stats = writer.finalize().await.unwrap();

        assert_eq!(stats.file_count, 2);
        assert_eq!(stats.internal_files, 2);
        assert_eq!(stats.external_files, 0);
        assert_eq!(stats.data_length, 11);

        let raw = std::fs::read(&path).unwrap();
        assert_eq!(raw.len() as u64, stats.byte_size);
        assert_eq!(&raw[raw.len() - 8..], b"DESFOOT1");
        assert_eq!(&raw[16..21], b"hello");
        assert_eq!(&raw[21..27], b"world!");
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let (_dir, path) = scratch();
        let mut writer = ContainerWriter::open(&path, WriterOptions::default())
            .await
            .unwrap();
        writer.add("same", b"1", json!({})).await.unwrap();
        let err = writer.add("same", b"2", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::NameConflict { .. }));
        assert_eq!(writer.file_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_names_rejected() {
        let (_dir, path) = scratch();
        let mut writer = ContainerWriter::open(&path, WriterOptions::default())
            .await
            .unwrap();
        for name in ["", "../up", "a/b", " lead", "trail ", "nul\0"] {
            assert!(
                writer.add(name, b"x", json!({})).await.is_err(),
                "{name:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_non_object_meta_rejected() {
        let (_dir, path) = scratch();
        let mut writer = ContainerWriter::open(&path, WriterOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            writer.add("f", b"x", json!(42)).await,
            Err(Error::InvalidMeta(_))
        ));
        // Null is treated as an empty object
        writer.add("f", b"x", Value::Null).await.unwrap();
    }

    #[tokio::test]
    async fn test_add_after_finalize_fails() {
        let (_dir, path) = scratch();
        let mut writer = ContainerWriter::open(&path, WriterOptions::default())
            .await
            .unwrap();
        writer.add("a", b"x", json!({})).await.unwrap();

        // finalize consumes the writer; re-opening the same path must fail
        // rather than silently truncate.
        writer.finalize().await.unwrap();
        assert!(ContainerWriter::open(&path, WriterOptions::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_abort_removes_file() {
        let (_dir, path) = scratch();
        let mut writer = ContainerWriter::open(&path, WriterOptions::default())
            .await
            .unwrap();
        writer.add("a", b"x", json!({})).await.unwrap();
        writer.abort().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_empty_container_finalizes() {
        let (_dir, path) = scratch();
        let writer = ContainerWriter::open(&path, WriterOptions::default())
            .await
            .unwrap();
        let stats = writer.finalize().await.unwrap();
        assert_eq!(stats.file_count, 0);
        assert_eq!(stats.byte_size, (HEADER_SIZE + FOOTER_SIZE) as u64);
    }

    #[tokio::test]
    async fn test_with_container_aborts_on_error() {
        let (_dir, path) = scratch();
        let result: Result<((), ContainerStats)> =
            with_container(&path, WriterOptions::default(), |w| {
                Box::pin(async move {
                    w.add("a", b"x", json!({})).await?;
                    Err(Error::InvalidMeta("boom".to_string()))
                })
            })
            .await;

        assert!(result.is_err());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_with_container_finalizes_on_success() {
        let (_dir, path) = scratch();
        let (count, stats) = with_container(&path, WriterOptions::default(), |w| {
            Box::pin(async move {
                w.add("a", b"x", json!({})).await?;
                w.add("b", b"y", json!({})).await?;
                Ok(w.file_count())
            })
        })
        .await
        .unwrap();

        assert_eq!(count, 2);
        assert_eq!(stats.file_count, 2);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_approximate_size_tracks_growth() {
        let (_dir, path) = scratch();
        let mut writer = ContainerWriter::open(&path, WriterOptions::default())
            .await
            .unwrap();
        let empty = writer.approximate_size();
        writer.add("a", &[0u8; 1000], json!({})).await.unwrap();
        assert!(writer.approximate_size() > empty + 1000);
    }
}

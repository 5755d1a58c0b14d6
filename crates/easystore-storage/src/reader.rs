//! Local Container Reader
//!
//! [`ContainerReader`] serves point and batch reads from a container file on
//! local disk.
//!
//! ## Bootstrap
//!
//! `open` reads the 16-byte header and the trailing 80-byte footer, verifies
//! both magics, the version, and the region-chaining invariants — nothing
//! else. The index is loaded lazily on the first lookup (one read of
//! `[index_start, footer_start)`), or taken from the configured
//! [`IndexCache`] when a copy is present under this container's identity
//! key.
//!
//! ## Batch reads
//!
//! `get_many` merges adjacent entries (sorted by data offset) into one read
//! per group whenever the gap fits the caller's budget. Results preserve
//! the input name order and report per-name failures without
//! short-circuiting the batch.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use bytes::Bytes;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::OnceCell;

use easystore_core::format::{self, ContainerStats, Footer, FOOTER_SIZE, HEADER_SIZE, MIN_CONTAINER_SIZE};
use easystore_core::meta::parse_meta_bytes;
use easystore_core::{ContainerIndex, CoreError};

use crate::batch::{group_span, plan_groups, BatchItem};
use crate::cache::{IndexCache, NullCache};
use crate::error::{Error, Result};
use crate::external::ExternalFileStore;

/// Per-name outcome list of a batch read, in input order.
pub type BatchOutcome = Vec<(String, Result<Bytes>)>;

/// Reader construction options.
#[derive(Default)]
pub struct ReaderOptions {
    /// Index cache; defaults to [`NullCache`].
    pub cache: Option<Arc<dyn IndexCache>>,

    /// Cache key override. Defaults to `<path>/<mtime_ms>` so a rewritten
    /// file never reuses a stale cached index.
    pub cache_key: Option<String>,

    /// Handle for external (sidecar) entries.
    pub external: Option<ExternalFileStore>,
}

/// Read handle for one local container file.
impl std::fmt::Debug for ContainerReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerReader")
            .field("path", &self.path)
            .field("label", &self.label)
            .field("file_size", &self.file_size)
            .field("footer", &self.footer)
            .field("cache_key", &self.cache_key)
            .finish()
    }
}

pub struct ContainerReader {
    path: PathBuf,
    label: String,
    file_size: u64,
    footer: Footer,
    index: OnceCell<Arc<ContainerIndex>>,
    cache: Arc<dyn IndexCache>,
    cache_key: String,
    external: Option<ExternalFileStore>,
}

impl ContainerReader {
    /// Open with default options (no cache, no external handle).
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, ReaderOptions::default()).await
    }

    pub async fn open_with(path: impl AsRef<Path>, options: ReaderOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let label = path.display().to_string();

        let meta = tokio::fs::metadata(&path).await?;
        let file_size = meta.len();
        if file_size < MIN_CONTAINER_SIZE {
            return Err(CoreError::CorruptContainer(format!(
                "file is {file_size} bytes, smaller than the smallest container ({MIN_CONTAINER_SIZE})"
            ))
            .into());
        }

        let header = read_file_range(&path, 0, HEADER_SIZE as u64).await?;
        format::decode_header(&header)?;

        let footer_bytes = read_file_range(&path, file_size - FOOTER_SIZE as u64, FOOTER_SIZE as u64).await?;
        let footer = Footer::decode(&footer_bytes)?;
        footer.validate(file_size)?;

        let cache_key = match options.cache_key {
            Some(key) => key,
            None => {
                let mtime_ms = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_millis())
                    .unwrap_or(0);
                format!("{label}/{mtime_ms}")
            }
        };

        Ok(Self {
            path,
            label,
            file_size,
            footer,
            index: OnceCell::new(),
            cache: options.cache.unwrap_or_else(|| Arc::new(NullCache)),
            cache_key,
            external: options.external,
        })
    }

    /// All file names, in insertion order.
    pub async fn list(&self) -> Result<Vec<String>> {
        Ok(self.ensure_index().await?.names())
    }

    /// Names of entries whose bytes live in DATA (externals excluded).
    pub async fn list_internal(&self) -> Result<Vec<String>> {
        Ok(self
            .ensure_index()
            .await?
            .entries()
            .iter()
            .filter(|e| !e.is_external())
            .map(|e| e.name.clone())
            .collect())
    }

    pub async fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.ensure_index().await?.contains(name))
    }

    /// Read one file's bytes.
    pub async fn get(&self, name: &str) -> Result<Bytes> {
        let index = self.ensure_index().await?;
        let entry = index.get(name).ok_or_else(|| self.not_found(name))?;

        if entry.is_external() {
            let external = self.external.as_ref().ok_or(Error::ExternalNotConfigured)?;
            return external.get(name).await;
        }
        self.read_range(entry.data_offset, entry.data_length).await
    }

    /// Read one file's metadata.
    pub async fn get_meta(&self, name: &str) -> Result<Value> {
        let index = self.ensure_index().await?;
        let entry = index.get(name).ok_or_else(|| self.not_found(name))?;
        let raw = self
            .read_range(entry.meta_offset, u64::from(entry.meta_length))
            .await?;
        Ok(parse_meta_bytes(&raw)?)
    }

    /// Batch read with gap merging. The outcome preserves the input name
    /// order; a missing or failing name yields its error without aborting
    /// the rest of the batch.
    pub async fn get_many(&self, names: &[String], max_gap: u64) -> Result<BatchOutcome> {
        let index = self.ensure_index().await?;

        let mut outcomes: Vec<Option<Result<Bytes>>> = Vec::new();
        outcomes.resize_with(names.len(), || None);
        let mut internal = Vec::new();

        for (pos, name) in names.iter().enumerate() {
            match index.get(name) {
                None => outcomes[pos] = Some(Err(self.not_found(name))),
                Some(entry) if entry.is_external() => {
                    let result = match self.external.as_ref() {
                        Some(external) => external.get(name).await,
                        None => Err(Error::ExternalNotConfigured),
                    };
                    outcomes[pos] = Some(result);
                }
                Some(entry) => internal.push(BatchItem {
                    input_pos: pos,
                    offset: entry.data_offset,
                    length: entry.data_length,
                }),
            }
        }

        for group in plan_groups(internal, max_gap) {
            let (start, end) = group_span(&group);
            match self.read_range(start, end - start).await {
                Ok(buf) => {
                    for item in group {
                        let from = (item.offset - start) as usize;
                        let to = from + item.length as usize;
                        outcomes[item.input_pos] = Some(Ok(buf.slice(from..to)));
                    }
                }
                Err(e) => {
                    let detail = e.to_string();
                    for item in group {
                        outcomes[item.input_pos] = Some(Err(Error::RangeRead {
                            container: self.label.clone(),
                            detail: detail.clone(),
                        }));
                    }
                }
            }
        }

        Ok(names
            .iter()
            .zip(outcomes)
            .map(|(name, outcome)| {
                (
                    name.clone(),
                    outcome.unwrap_or_else(|| Err(self.not_found(name))),
                )
            })
            .collect())
    }

    /// Container statistics derived from the footer and index.
    pub async fn stats(&self) -> Result<ContainerStats> {
        let index = self.ensure_index().await?;
        let external_files = index.entries().iter().filter(|e| e.is_external()).count() as u64;
        Ok(ContainerStats {
            file_count: index.len() as u64,
            internal_files: index.len() as u64 - external_files,
            external_files,
            data_length: self.footer.data_length,
            meta_length: self.footer.meta_length,
            index_length: self.footer.index_length,
            byte_size: self.file_size,
        })
    }

    /// The parsed footer (offsets are validated at open).
    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    // ---- Internal helpers ----

    fn not_found(&self, name: &str) -> Error {
        Error::NotFound {
            container: self.label.clone(),
            name: name.to_string(),
        }
    }

    async fn ensure_index(&self) -> Result<&Arc<ContainerIndex>> {
        self.index
            .get_or_try_init(|| async {
                if let Some(entries) = self.cache.get(&self.cache_key).await {
                    match ContainerIndex::from_entries(entries) {
                        Ok(index) => return Ok(Arc::new(index)),
                        // A bad cached copy must not fail the read.
                        Err(_) => self.cache.delete(&self.cache_key).await,
                    }
                }

                let raw = self
                    .read_range(self.footer.index_start, self.footer.index_length)
                    .await?;
                let entries = format::decode_entries(&raw, self.footer.file_count)?;
                let index = ContainerIndex::from_entries(entries)?;
                self.cache
                    .put(&self.cache_key, index.entries().to_vec(), None)
                    .await;
                Ok(Arc::new(index))
            })
            .await
    }

    async fn read_range(&self, offset: u64, length: u64) -> Result<Bytes> {
        read_file_range(&self.path, offset, length).await
    }
}

async fn read_file_range(path: &Path, offset: u64, length: u64) -> Result<Bytes> {
    if length == 0 {
        return Ok(Bytes::new());
    }
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; length as usize];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

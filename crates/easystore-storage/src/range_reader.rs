//! Range-Aware Object Store Reader
//!
//! [`RangeContainerReader`] mirrors the local reader's surface against an
//! object store (S3, HCP, Ceph RGW, or the in-memory store in tests). Point
//! reads are served with one or two HTTP Range requests and no external
//! catalog lookup.
//!
//! ## Bootstrap
//!
//! ```text
//! HEAD   object                      -> size + version/etag
//! RANGE  [0, 16)                     -> header magic + version
//! RANGE  [size - 80, size)           -> footer -> region offsets
//! RANGE  [index_start, footer_start) -> index   (skipped on cache hit)
//! ```
//!
//! Every parsed footer must pass magic, version, and self-consistency
//! checks (`footer_start + 80 == object_size`); anything else is
//! `CorruptContainer` and nothing is read from DATA.
//!
//! ## Index caching
//!
//! The cache key is `{bucket}/{key}/{version}`: a changed object version or
//! etag can never serve a stale index. Corrupt containers are never cached.
//!
//! ## Batch coalescing
//!
//! Identical to the local reader, but the default 1 MiB gap budget is priced
//! against request-count and egress economics rather than disk seeks: a
//! sub-megabyte hole is cheaper to read through than to split into another
//! GET.
//!
//! External entries translate to a Range-free GET against the sidecar
//! location recorded in the file's metadata.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use object_store::{path::Path as ObjectPath, ObjectStore};
use serde_json::Value;
use tokio::sync::OnceCell;

use easystore_core::format::{
    self, ContainerStats, Footer, IndexEntry, FOOTER_SIZE, HEADER_SIZE, MIN_CONTAINER_SIZE,
};
use easystore_core::meta::parse_meta_bytes;
use easystore_core::{ContainerIndex, CoreError};

use crate::batch::{group_span, plan_groups, BatchItem};
use crate::cache::{IndexCache, NullCache};
use crate::error::{Error, Result};
use crate::external::ExternalFileStore;
use crate::reader::BatchOutcome;

/// Range reader construction options.
#[derive(Default)]
pub struct RangeReaderOptions {
    /// Bucket label used in error messages and the cache key.
    pub bucket: Option<String>,

    /// Index cache; defaults to [`NullCache`].
    pub cache: Option<Arc<dyn IndexCache>>,

    /// Cache key override. Defaults to `{bucket}/{key}/{version}`.
    pub cache_key: Option<String>,

    /// Sidecar handle override. By default the sidecar base is derived from
    /// the object key (`[prefix/]_bigFiles/<container-stem>`) and used as a
    /// fallback when a file's metadata carries no `external_key`.
    pub external: Option<ExternalFileStore>,
}

/// Requests issued by a reader since `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestStats {
    pub head_requests: u64,
    pub range_requests: u64,
}

/// Read handle for one container object in a bucket.
impl std::fmt::Debug for RangeContainerReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeContainerReader")
            .field("location", &self.location)
            .field("label", &self.label)
            .field("object_size", &self.object_size)
            .field("footer", &self.footer)
            .field("cache_key", &self.cache_key)
            .finish()
    }
}

pub struct RangeContainerReader {
    store: Arc<dyn ObjectStore>,
    location: ObjectPath,
    label: String,
    object_size: u64,
    footer: Footer,
    index: OnceCell<Arc<ContainerIndex>>,
    cache: Arc<dyn IndexCache>,
    cache_key: String,
    external: ExternalFileStore,
    head_requests: AtomicU64,
    range_requests: AtomicU64,
}

impl RangeContainerReader {
    /// Open with default options.
    pub async fn open(store: Arc<dyn ObjectStore>, key: &str) -> Result<Self> {
        Self::open_with(store, key, RangeReaderOptions::default()).await
    }

    pub async fn open_with(
        store: Arc<dyn ObjectStore>,
        key: &str,
        options: RangeReaderOptions,
    ) -> Result<Self> {
        let location = ObjectPath::from(key);
        let label = match &options.bucket {
            Some(bucket) => format!("{bucket}/{key}"),
            None => key.to_string(),
        };

        let head_requests = AtomicU64::new(1);
        let head = store.head(&location).await?;
        let object_size = head.size as u64;
        if object_size < MIN_CONTAINER_SIZE {
            return Err(CoreError::CorruptContainer(format!(
                "object is {object_size} bytes, smaller than the smallest container ({MIN_CONTAINER_SIZE})"
            ))
            .into());
        }

        let version = head
            .e_tag
            .or(head.version)
            .unwrap_or_else(|| head.last_modified.timestamp_millis().to_string());

        let spans = [
            0..HEADER_SIZE,
            (object_size as usize - FOOTER_SIZE)..object_size as usize,
        ];
        let range_requests = AtomicU64::new(spans.len() as u64);
        let bounds = store.get_ranges(&location, &spans).await?;

        format::decode_header(&bounds[0])?;
        let footer = Footer::decode(&bounds[1])?;
        footer.validate(object_size)?;

        let cache_key = options
            .cache_key
            .unwrap_or_else(|| format!("{label}/{version}"));

        let external = options
            .external
            .unwrap_or_else(|| ExternalFileStore::new(store.clone(), derive_sidecar_base(key)));

        Ok(Self {
            store,
            location,
            label,
            object_size,
            footer,
            index: OnceCell::new(),
            cache: options.cache.unwrap_or_else(|| Arc::new(NullCache)),
            cache_key,
            external,
            head_requests,
            range_requests,
        })
    }

    /// All file names, in insertion order.
    pub async fn list(&self) -> Result<Vec<String>> {
        Ok(self.ensure_index().await?.names())
    }

    /// Names of entries stored inside the container (externals excluded).
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

    /// Read one file's bytes: a single Range request for internal entries, a
    /// sidecar GET for external ones.
    pub async fn get(&self, name: &str) -> Result<Bytes> {
        let index = self.ensure_index().await?;
        let entry = index.get(name).ok_or_else(|| self.not_found(name))?.clone();

        if entry.is_external() {
            return self.get_external(&entry).await;
        }
        self.get_range(entry.data_offset, entry.data_length).await
    }

    /// Read one file's metadata.
    pub async fn get_meta(&self, name: &str) -> Result<Value> {
        let index = self.ensure_index().await?;
        let entry = index.get(name).ok_or_else(|| self.not_found(name))?.clone();
        self.read_meta(&entry).await
    }

    /// Batch read with gap coalescing; one Range request per merged group.
    /// The outcome preserves input name order and never short-circuits.
    pub async fn get_many(&self, names: &[String], max_gap: u64) -> Result<BatchOutcome> {
        let index = self.ensure_index().await?;

        let mut outcomes: Vec<Option<Result<Bytes>>> = Vec::new();
        outcomes.resize_with(names.len(), || None);
        let mut internal = Vec::new();

        for (pos, name) in names.iter().enumerate() {
            match index.get(name) {
                None => outcomes[pos] = Some(Err(self.not_found(name))),
                Some(entry) if entry.is_external() => {
                    let entry = entry.clone();
                    outcomes[pos] = Some(self.get_external(&entry).await);
                }
                Some(entry) => internal.push(BatchItem {
                    input_pos: pos,
                    offset: entry.data_offset,
                    length: entry.data_length,
                }),
            }
        }

        let groups = plan_groups(internal, max_gap);
        if !groups.is_empty() {
            let spans: Vec<Range<usize>> = groups
                .iter()
                .map(|group| {
                    let (start, end) = group_span(group);
                    start as usize..end as usize
                })
                .collect();
            self.range_requests
                .fetch_add(spans.len() as u64, Ordering::Relaxed);

            match self.store.get_ranges(&self.location, &spans).await {
                Ok(buffers) => {
                    for (group, buf) in groups.into_iter().zip(buffers) {
                        let (start, _) = group_span(&group);
                        for item in group {
                            let from = (item.offset - start) as usize;
                            let to = from + item.length as usize;
                            outcomes[item.input_pos] = Some(Ok(buf.slice(from..to)));
                        }
                    }
                }
                Err(e) => {
                    let detail = e.to_string();
                    for group in groups {
                        for item in group {
                            outcomes[item.input_pos] = Some(Err(Error::RangeRead {
                                container: self.label.clone(),
                                detail: detail.clone(),
                            }));
                        }
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
            byte_size: self.object_size,
        })
    }

    /// The parsed footer (validated at open).
    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    /// Requests issued since `open` (HEAD and Range counted separately).
    pub fn request_stats(&self) -> RequestStats {
        RequestStats {
            head_requests: self.head_requests.load(Ordering::Relaxed),
            range_requests: self.range_requests.load(Ordering::Relaxed),
        }
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
                        Err(_) => self.cache.delete(&self.cache_key).await,
                    }
                }

                let raw = self
                    .get_range(self.footer.index_start, self.footer.index_length)
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

    async fn get_range(&self, offset: u64, length: u64) -> Result<Bytes> {
        if length == 0 {
            return Ok(Bytes::new());
        }
        self.range_requests.fetch_add(1, Ordering::Relaxed);
        let range = offset as usize..(offset + length) as usize;
        Ok(self.store.get_range(&self.location, range).await?)
    }

    async fn read_meta(&self, entry: &IndexEntry) -> Result<Value> {
        let raw = self
            .get_range(entry.meta_offset, u64::from(entry.meta_length))
            .await?;
        Ok(parse_meta_bytes(&raw)?)
    }

    /// Fetch an external entry via the sidecar key recorded in its metadata,
    /// falling back to the conventional sidecar layout.
    async fn get_external(&self, entry: &IndexEntry) -> Result<Bytes> {
        let meta = self.read_meta(entry).await?;
        if let Some(key) = meta.get("external_key").and_then(Value::as_str) {
            let path = ObjectPath::from(key);
            let result = self
                .store
                .get(&path)
                .await
                .map_err(|source| Error::ExternalFetch {
                    key: key.to_string(),
                    source,
                })?;
            return result.bytes().await.map_err(|source| Error::ExternalFetch {
                key: key.to_string(),
                source,
            });
        }
        self.external.get(&entry.name).await
    }
}

/// Conventional sidecar base for a container object key:
/// `[prefix/]<day>/<shard>/<id>.des` maps to `[prefix/]_bigFiles/<id>`.
fn derive_sidecar_base(key: &str) -> String {
    let parts: Vec<&str> = key.split('/').filter(|p| !p.is_empty()).collect();
    let file = parts.last().copied().unwrap_or(key);
    let stem = file.strip_suffix(".des").unwrap_or(file);
    let prefix = &parts[..parts.len().saturating_sub(3)];
    if prefix.is_empty() {
        format!("_bigFiles/{stem}")
    } else {
        format!("{}/_bigFiles/{}", prefix.join("/"), stem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_sidecar_base() {
        assert_eq!(
            derive_sidecar_base("2025-01-15/0a/c123.des"),
            "_bigFiles/c123"
        );
        assert_eq!(
            derive_sidecar_base("des/2025-01-15/0a/c123.des"),
            "des/_bigFiles/c123"
        );
        assert_eq!(derive_sidecar_base("c123.des"), "_bigFiles/c123");
    }
}

//! Index Cache
//!
//! Parsing a container's index costs one Range request. Reads are heavily
//! skewed toward a warm set of containers, so both readers consult an
//! [`IndexCache`] keyed by container identity (`bucket/key/version` for the
//! range reader, `path/mtime` for the local one).
//!
//! The cache is strictly advisory: a miss — or a backend failure — never
//! fails a read, it only costs the one extra Range. Backend errors are
//! logged and treated as misses.
//!
//! Two implementations share the contract:
//!
//! - [`InMemoryIndexCache`]: bounded LRU with optional per-entry TTL,
//!   thread-safe, for single-process deployments.
//! - [`KvIndexCache`]: JSON-serialized entries (optionally gzip-compressed)
//!   in an external key-value store behind the [`KvBackend`] capability, for
//!   fleets that share an index cache.
//!
//! [`NullCache`] disables caching without changing call sites.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::Mutex;
use tokio::time::Instant;

use easystore_core::IndexEntry;

/// Gzip stream magic; used to detect compressed cache payloads.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Advisory cache of parsed index entries.
#[async_trait]
pub trait IndexCache: Send + Sync {
    /// Look up cached entries. `None` on miss, expiry, or backend failure.
    async fn get(&self, key: &str) -> Option<Vec<IndexEntry>>;

    /// Store entries under `key`. `ttl = None` uses the implementation's
    /// default (which may be "no expiry").
    async fn put(&self, key: &str, entries: Vec<IndexEntry>, ttl: Option<Duration>);

    /// Drop one entry.
    async fn delete(&self, key: &str);
}

/// No-op cache: every lookup misses.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCache;

#[async_trait]
impl IndexCache for NullCache {
    async fn get(&self, _key: &str) -> Option<Vec<IndexEntry>> {
        None
    }

    async fn put(&self, _key: &str, _entries: Vec<IndexEntry>, _ttl: Option<Duration>) {}

    async fn delete(&self, _key: &str) {}
}

struct CachedEntries {
    entries: Vec<IndexEntry>,
    expires_at: Option<Instant>,
}

/// In-process LRU + TTL cache.
pub struct InMemoryIndexCache {
    inner: Mutex<LruCache<String, CachedEntries>>,
    default_ttl: Option<Duration>,
}

impl InMemoryIndexCache {
    /// `capacity` bounds the number of cached containers; `default_ttl`
    /// applies to entries stored without an explicit TTL.
    pub fn new(capacity: usize, default_ttl: Option<Duration>) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            default_ttl,
        }
    }

    /// Number of currently cached containers (expired entries included until
    /// their next lookup).
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl IndexCache for InMemoryIndexCache {
    async fn get(&self, key: &str) -> Option<Vec<IndexEntry>> {
        let mut inner = self.inner.lock().await;
        if let Some(cached) = inner.get(key) {
            if let Some(expires_at) = cached.expires_at {
                if Instant::now() > expires_at {
                    inner.pop(key);
                    return None;
                }
            }
            return Some(cached.entries.clone());
        }
        None
    }

    async fn put(&self, key: &str, entries: Vec<IndexEntry>, ttl: Option<Duration>) {
        let expires_at = ttl
            .or(self.default_ttl)
            .map(|ttl| Instant::now() + ttl);
        let mut inner = self.inner.lock().await;
        inner.put(key.to_string(), CachedEntries { entries, expires_at });
    }

    async fn delete(&self, key: &str) {
        self.inner.lock().await.pop(key);
    }
}

/// Errors a [`KvBackend`] may surface; the cache logs and absorbs them.
pub type KvError = Box<dyn std::error::Error + Send + Sync>;

/// Minimal key-value capability an external cache backend must provide.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, KvError>;

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> std::result::Result<(), KvError>;

    async fn delete(&self, key: &str) -> std::result::Result<(), KvError>;
}

/// External KV index cache: JSON entries, optional gzip, optional TTL.
pub struct KvIndexCache<B> {
    backend: B,
    key_prefix: String,
    gzip: bool,
    default_ttl: Option<Duration>,
}

impl<B: KvBackend> KvIndexCache<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            key_prefix: "des:index:".to_string(),
            gzip: false,
            default_ttl: None,
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_gzip(mut self, gzip: bool) -> Self {
        self.gzip = gzip;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    fn backend_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn encode(&self, entries: &[IndexEntry]) -> std::result::Result<Vec<u8>, KvError> {
        let json = serde_json::to_vec(entries)?;
        if !self.gzip {
            return Ok(json);
        }
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(&json)?;
        Ok(encoder.finish()?)
    }

    fn decode(raw: &[u8]) -> std::result::Result<Vec<IndexEntry>, KvError> {
        if raw.starts_with(&GZIP_MAGIC) {
            let mut decoder = flate2::read::GzDecoder::new(raw);
            let mut json = Vec::new();
            decoder.read_to_end(&mut json)?;
            Ok(serde_json::from_slice(&json)?)
        } else {
            Ok(serde_json::from_slice(raw)?)
        }
    }
}

#[async_trait]
impl<B: KvBackend> IndexCache for KvIndexCache<B> {
    async fn get(&self, key: &str) -> Option<Vec<IndexEntry>> {
        let backend_key = self.backend_key(key);
        let raw = match self.backend.get(&backend_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key = %backend_key, error = %e, "index cache backend get failed");
                return None;
            }
        };

        match Self::decode(&raw) {
            Ok(entries) => Some(entries),
            Err(e) => {
                // Corrupted cache payload: drop it and fall back to a Range.
                tracing::warn!(key = %backend_key, error = %e, "dropping undecodable cache entry");
                let _ = self.backend.delete(&backend_key).await;
                None
            }
        }
    }

    async fn put(&self, key: &str, entries: Vec<IndexEntry>, ttl: Option<Duration>) {
        let backend_key = self.backend_key(key);
        let payload = match self.encode(&entries) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(key = %backend_key, error = %e, "index cache encode failed");
                return;
            }
        };
        if let Err(e) = self
            .backend
            .set(&backend_key, payload, ttl.or(self.default_ttl))
            .await
        {
            tracing::warn!(key = %backend_key, error = %e, "index cache backend set failed");
        }
    }

    async fn delete(&self, key: &str) {
        let backend_key = self.backend_key(key);
        if let Err(e) = self.backend.delete(&backend_key).await {
            tracing::warn!(key = %backend_key, error = %e, "index cache backend delete failed");
        }
    }
}

/// In-memory [`KvBackend`] for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryKv {
    map: Mutex<HashMap<String, (Vec<u8>, Option<Instant>)>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for InMemoryKv {
    async fn get(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, KvError> {
        let mut map = self.map.lock().await;
        match map.get(key) {
            Some((_, Some(expires_at))) if Instant::now() > *expires_at => {
                map.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> std::result::Result<(), KvError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.map
            .lock()
            .await
            .insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> std::result::Result<(), KvError> {
        self.map.lock().await.remove(key);
        Ok(())
    }
}

//! External big-file sidecar
//!
//! Files at or above the writer's threshold do not land in the container's
//! DATA region. Their bytes go to a sidecar location in the archive bucket:
//!
//! ```text
//! [<archive-prefix>/]_bigFiles/<container-stem>/<percent-encoded-name>
//! ```
//!
//! The container keeps a stub index entry (`flags.external = 1`,
//! `data_length = 0`) and the file's metadata, which records the sidecar key
//! under `external_key`. Readers holding an [`ExternalFileStore`] resolve
//! such entries with a plain GET.

use std::sync::Arc;

use bytes::Bytes;
use object_store::{path::Path, ObjectStore};

use easystore_core::encoding::percent_encode_name;

use crate::error::{Error, Result};

/// Put/get handle for one container's external files.
///
/// Received by value at construction (writer and readers alike); it holds no
/// back-pointer to either.
#[derive(Clone)]
pub struct ExternalFileStore {
    store: Arc<dyn ObjectStore>,
    base: String,
}

impl ExternalFileStore {
    /// Wrap a store with an explicit base prefix (already including the
    /// `_bigFiles/<container-stem>` segment).
    pub fn new(store: Arc<dyn ObjectStore>, base: impl Into<String>) -> Self {
        Self {
            store,
            base: base.into().trim_matches('/').to_string(),
        }
    }

    /// The conventional sidecar base for a container id.
    pub fn for_container(
        store: Arc<dyn ObjectStore>,
        archive_prefix: Option<&str>,
        container_id: &str,
    ) -> Self {
        let base = match archive_prefix {
            Some(prefix) if !prefix.is_empty() => {
                format!("{}/_bigFiles/{}", prefix.trim_matches('/'), container_id)
            }
            _ => format!("_bigFiles/{container_id}"),
        };
        Self::new(store, base)
    }

    /// Object key for a file name.
    pub fn key_for(&self, name: &str) -> String {
        format!("{}/{}", self.base, percent_encode_name(name))
    }

    /// Upload one external file; returns the sidecar key.
    pub async fn put(&self, name: &str, data: Bytes) -> Result<String> {
        let key = self.key_for(name);
        let path = Path::from(key.as_str());
        self.store.put(&path, data).await?;
        Ok(key)
    }

    /// Fetch one external file in full.
    pub async fn get(&self, name: &str) -> Result<Bytes> {
        let key = self.key_for(name);
        let path = Path::from(key.as_str());
        let result = self
            .store
            .get(&path)
            .await
            .map_err(|source| Error::ExternalFetch {
                key: key.clone(),
                source,
            })?;
        result
            .bytes()
            .await
            .map_err(|source| Error::ExternalFetch { key, source })
    }

    /// Delete one external file (used by recovery when discarding a partial
    /// container).
    pub async fn delete(&self, name: &str) -> Result<()> {
        let path = Path::from(self.key_for(name).as_str());
        match self.store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for ExternalFileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalFileStore")
            .field("base", &self.base)
            .finish()
    }
}

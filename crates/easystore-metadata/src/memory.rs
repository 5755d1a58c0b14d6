//! In-memory Metadata Store
//!
//! Mirrors the PostgreSQL backend's semantics exactly — CAS acquisition,
//! generation fencing, state-guarded container transitions — behind a
//! process-local mutex. Used by tests and single-process deployments.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ContainerRecord, ContainerState, ShardLease};
use crate::{now_ms, MetadataStore};

#[derive(Default)]
struct Inner {
    leases: HashMap<u32, ShardLease>,
    containers: HashMap<String, ContainerRecord>,
}

/// Process-local [`MetadataStore`].
#[derive(Default)]
pub struct MemoryMetadataStore {
    inner: Mutex<Inner>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn try_acquire(
        &self,
        shard_id: u32,
        owner_id: &str,
        ttl_seconds: u32,
    ) -> Result<Option<ShardLease>> {
        let now = now_ms();
        let mut inner = self.lock();

        let generation = match inner.leases.get(&shard_id) {
            Some(current) if !current.is_expired(now) => return Ok(None),
            Some(current) => current.generation + 1,
            None => 1,
        };

        let lease = ShardLease {
            shard_id,
            owner_id: owner_id.to_string(),
            acquired_at: now,
            heartbeat_at: now,
            ttl_seconds,
            generation,
        };
        inner.leases.insert(shard_id, lease.clone());
        Ok(Some(lease))
    }

    async fn renew(&self, shard_id: u32, owner_id: &str, generation: u64) -> Result<bool> {
        let mut inner = self.lock();
        match inner.leases.get_mut(&shard_id) {
            Some(lease) if lease.owner_id == owner_id && lease.generation == generation => {
                lease.heartbeat_at = now_ms();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, shard_id: u32, owner_id: &str, generation: u64) -> Result<()> {
        let mut inner = self.lock();
        let held = inner
            .leases
            .get(&shard_id)
            .map(|l| l.owner_id == owner_id && l.generation == generation)
            .unwrap_or(false);
        if held {
            inner.leases.remove(&shard_id);
        }
        Ok(())
    }

    async fn get_lease(&self, shard_id: u32) -> Result<Option<ShardLease>> {
        Ok(self.lock().leases.get(&shard_id).cloned())
    }

    async fn list_expired_leases(&self, now_ms: i64) -> Result<Vec<ShardLease>> {
        let mut expired: Vec<ShardLease> = self
            .lock()
            .leases
            .values()
            .filter(|l| l.is_expired(now_ms))
            .cloned()
            .collect();
        expired.sort_by_key(|l| l.shard_id);
        Ok(expired)
    }

    async fn release_expired_leases(&self, now_ms: i64) -> Result<u64> {
        let mut inner = self.lock();
        let before = inner.leases.len();
        inner.leases.retain(|_, l| !l.is_expired(now_ms));
        Ok((before - inner.leases.len()) as u64)
    }

    async fn create_container(&self, record: &ContainerRecord) -> Result<()> {
        self.lock()
            .containers
            .insert(record.container_id.clone(), record.clone());
        Ok(())
    }

    async fn get_container(&self, container_id: &str) -> Result<Option<ContainerRecord>> {
        Ok(self.lock().containers.get(container_id).cloned())
    }

    async fn update_container_progress(
        &self,
        container_id: &str,
        file_count: u64,
        byte_size: u64,
    ) -> Result<()> {
        if let Some(record) = self.lock().containers.get_mut(container_id) {
            record.file_count = file_count;
            record.byte_size = byte_size;
        }
        Ok(())
    }

    async fn mark_uploading(&self, container_id: &str) -> Result<bool> {
        let mut inner = self.lock();
        match inner.containers.get_mut(container_id) {
            Some(record) if record.state == ContainerState::Open => {
                record.state = ContainerState::Uploading;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_committed(&self, container_id: &str) -> Result<bool> {
        let mut inner = self.lock();
        match inner.containers.get_mut(container_id) {
            Some(record)
                if matches!(
                    record.state,
                    ContainerState::Open | ContainerState::Uploading
                ) =>
            {
                record.state = ContainerState::Committed;
                record.committed_at = Some(now_ms());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn abandon(&self, container_id: &str) -> Result<bool> {
        let mut inner = self.lock();
        match inner.containers.get_mut(container_id) {
            Some(record) if record.state != ContainerState::Committed => {
                record.state = ContainerState::Abandoned;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_stale_containers(&self, cutoff_ms: i64) -> Result<Vec<ContainerRecord>> {
        let mut stale: Vec<ContainerRecord> = self
            .lock()
            .containers
            .values()
            .filter(|r| {
                matches!(r.state, ContainerState::Open | ContainerState::Uploading)
                    && r.created_at < cutoff_ms
            })
            .cloned()
            .collect();
        stale.sort_by_key(|r| r.created_at);
        Ok(stale)
    }
}

//! PostgreSQL Metadata Store
//!
//! Production backend over sqlx. Runtime queries are used instead of the
//! compile-time macros so the crate builds without a DATABASE_URL; rows are
//! decoded by column name.
//!
//! ## Lease CAS
//!
//! `try_acquire` is a single upsert whose update arms only fire when the
//! existing lease is expired:
//!
//! ```sql
//! INSERT INTO shard_leases (...) VALUES (...)
//! ON CONFLICT (shard_id) DO UPDATE SET
//!     owner_id = CASE WHEN <expired> THEN EXCLUDED.owner_id ELSE shard_leases.owner_id END,
//!     ...
//!     generation = CASE WHEN <expired> THEN shard_leases.generation + 1
//!                                      ELSE shard_leases.generation END
//! ```
//!
//! The caller then reads the row back and checks it actually won: the row
//! carries our `owner_id` and the `heartbeat_at` we just wrote. Concurrent
//! acquirers race on the upsert's row lock, so exactly one wins per
//! generation.
//!
//! `renew` and `release` are fenced on `(shard_id, owner_id, generation)`:
//! a worker whose lease was taken over cannot touch the successor's row.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use crate::error::{MetadataError, Result};
use crate::types::{ContainerRecord, ContainerState, ShardLease};
use crate::{now_ms, MetadataStore};

/// PostgreSQL-backed [`MetadataStore`].
pub struct PostgresMetadataStore {
    pool: PgPool,
}

impl PostgresMetadataStore {
    /// Connect with the default pool (20 connections) and run migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await?;
        Self::with_pool(pool).await
    }

    /// Use an existing pool; runs migrations.
    pub async fn with_pool(pool: PgPool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!("metadata schema is up to date");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Cheap liveness probe (`SELECT 1`).
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn lease_from_row(row: &PgRow) -> ShardLease {
        ShardLease {
            shard_id: row.get::<i32, _>("shard_id") as u32,
            owner_id: row.get("owner_id"),
            acquired_at: row.get("acquired_at"),
            heartbeat_at: row.get("heartbeat_at"),
            ttl_seconds: row.get::<i32, _>("ttl_seconds") as u32,
            generation: row.get::<i64, _>("generation") as u64,
        }
    }

    fn container_from_row(row: &PgRow) -> Result<ContainerRecord> {
        let state: String = row.get("state");
        let state = ContainerState::parse(&state)
            .ok_or_else(|| MetadataError::InvalidRow(format!("unknown container state {state:?}")))?;
        Ok(ContainerRecord {
            container_id: row.get("container_id"),
            shard_id: row.get::<i32, _>("shard_id") as u32,
            day: row.get("day"),
            bucket: row.get("bucket"),
            key: row.get("object_key"),
            state,
            file_count: row.get::<i64, _>("file_count") as u64,
            byte_size: row.get::<i64, _>("byte_size") as u64,
            created_at: row.get("created_at"),
            committed_at: row.get("committed_at"),
            owner_id: row.get("owner_id"),
            generation: row.get::<i64, _>("generation") as u64,
        })
    }
}

#[async_trait]
impl MetadataStore for PostgresMetadataStore {
    async fn try_acquire(
        &self,
        shard_id: u32,
        owner_id: &str,
        ttl_seconds: u32,
    ) -> Result<Option<ShardLease>> {
        let now = now_ms();

        sqlx::query(
            "INSERT INTO shard_leases (shard_id, owner_id, acquired_at, heartbeat_at, ttl_seconds, generation)
             VALUES ($1, $2, $3, $3, $4, 1)
             ON CONFLICT (shard_id) DO UPDATE SET
                 owner_id = CASE
                     WHEN shard_leases.heartbeat_at + shard_leases.ttl_seconds::bigint * 1000 < $3
                     THEN EXCLUDED.owner_id ELSE shard_leases.owner_id
                 END,
                 acquired_at = CASE
                     WHEN shard_leases.heartbeat_at + shard_leases.ttl_seconds::bigint * 1000 < $3
                     THEN EXCLUDED.acquired_at ELSE shard_leases.acquired_at
                 END,
                 heartbeat_at = CASE
                     WHEN shard_leases.heartbeat_at + shard_leases.ttl_seconds::bigint * 1000 < $3
                     THEN EXCLUDED.heartbeat_at ELSE shard_leases.heartbeat_at
                 END,
                 ttl_seconds = CASE
                     WHEN shard_leases.heartbeat_at + shard_leases.ttl_seconds::bigint * 1000 < $3
                     THEN EXCLUDED.ttl_seconds ELSE shard_leases.ttl_seconds
                 END,
                 generation = CASE
                     WHEN shard_leases.heartbeat_at + shard_leases.ttl_seconds::bigint * 1000 < $3
                     THEN shard_leases.generation + 1 ELSE shard_leases.generation
                 END",
        )
        .bind(shard_id as i32)
        .bind(owner_id)
        .bind(now)
        .bind(ttl_seconds as i32)
        .execute(&self.pool)
        .await?;

        let lease = self.get_lease(shard_id).await?;
        Ok(lease.filter(|l| l.owner_id == owner_id && l.heartbeat_at == now))
    }

    async fn renew(&self, shard_id: u32, owner_id: &str, generation: u64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE shard_leases SET heartbeat_at = $4
             WHERE shard_id = $1 AND owner_id = $2 AND generation = $3",
        )
        .bind(shard_id as i32)
        .bind(owner_id)
        .bind(generation as i64)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, shard_id: u32, owner_id: &str, generation: u64) -> Result<()> {
        sqlx::query(
            "DELETE FROM shard_leases
             WHERE shard_id = $1 AND owner_id = $2 AND generation = $3",
        )
        .bind(shard_id as i32)
        .bind(owner_id)
        .bind(generation as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_lease(&self, shard_id: u32) -> Result<Option<ShardLease>> {
        let row = sqlx::query(
            "SELECT shard_id, owner_id, acquired_at, heartbeat_at, ttl_seconds, generation
             FROM shard_leases WHERE shard_id = $1",
        )
        .bind(shard_id as i32)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(Self::lease_from_row))
    }

    async fn list_expired_leases(&self, now_ms: i64) -> Result<Vec<ShardLease>> {
        let rows = sqlx::query(
            "SELECT shard_id, owner_id, acquired_at, heartbeat_at, ttl_seconds, generation
             FROM shard_leases
             WHERE heartbeat_at + ttl_seconds::bigint * 1000 < $1
             ORDER BY shard_id",
        )
        .bind(now_ms)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(Self::lease_from_row).collect())
    }

    async fn release_expired_leases(&self, now_ms: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM shard_leases WHERE heartbeat_at + ttl_seconds::bigint * 1000 < $1",
        )
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn create_container(&self, record: &ContainerRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO containers
                 (container_id, shard_id, day, bucket, object_key, state,
                  file_count, byte_size, created_at, committed_at, owner_id, generation)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(&record.container_id)
        .bind(record.shard_id as i32)
        .bind(record.day)
        .bind(&record.bucket)
        .bind(&record.key)
        .bind(record.state.as_str())
        .bind(record.file_count as i64)
        .bind(record.byte_size as i64)
        .bind(record.created_at)
        .bind(record.committed_at)
        .bind(&record.owner_id)
        .bind(record.generation as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_container(&self, container_id: &str) -> Result<Option<ContainerRecord>> {
        let row = sqlx::query("SELECT * FROM containers WHERE container_id = $1")
            .bind(container_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::container_from_row).transpose()
    }

    async fn update_container_progress(
        &self,
        container_id: &str,
        file_count: u64,
        byte_size: u64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE containers SET file_count = $2, byte_size = $3 WHERE container_id = $1",
        )
        .bind(container_id)
        .bind(file_count as i64)
        .bind(byte_size as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_uploading(&self, container_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE containers SET state = 'UPLOADING'
             WHERE container_id = $1 AND state = 'OPEN'",
        )
        .bind(container_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_committed(&self, container_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE containers SET state = 'COMMITTED', committed_at = $2
             WHERE container_id = $1 AND state IN ('OPEN', 'UPLOADING')",
        )
        .bind(container_id)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn abandon(&self, container_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE containers SET state = 'ABANDONED'
             WHERE container_id = $1 AND state <> 'COMMITTED'",
        )
        .bind(container_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_stale_containers(&self, cutoff_ms: i64) -> Result<Vec<ContainerRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM containers
             WHERE state IN ('OPEN', 'UPLOADING') AND created_at < $1
             ORDER BY created_at",
        )
        .bind(cutoff_ms)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::container_from_row).collect()
    }
}

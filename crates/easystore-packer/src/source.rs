//! Source Provider
//!
//! Claims pending rows from heterogeneous upstream databases, fetches their
//! bodies from the source object store, and reports outcomes back.
//!
//! ## Capability surface
//!
//! The packer only sees the narrow [`FileSource`] capability — `claim`,
//! `fetch`, `mark_packed`, `mark_failed`, `reset_stale_claims` — so tests
//! and single-tenant deployments can substitute an in-process source.
//!
//! ## Dialects
//!
//! Dialect specifics live inside [`SourceDialect`]-driven SQL builders:
//!
//! | Dialect  | Claim locking                        | Limit            |
//! |----------|--------------------------------------|------------------|
//! | Postgres | `FOR UPDATE SKIP LOCKED`             | `LIMIT`          |
//! | MySQL    | `FOR UPDATE SKIP LOCKED` (8.0+)      | `LIMIT`          |
//! | MSSQL    | `WITH (ROWLOCK, UPDLOCK, READPAST)`  | `TOP (n)`        |
//! | Oracle   | `FOR UPDATE SKIP LOCKED`             | `ROWNUM <= n`    |
//!
//! Postgres and MySQL execute over sqlx; the MSSQL and Oracle variants
//! build their dialect-correct SQL (kept under test) but refuse to connect,
//! since the stack ships no driver for them.
//!
//! ## Claiming
//!
//! Shard ids cannot be computed inside SQL (the hash is SHA-256 based), so
//! a claim transaction selects a locked batch of pending rows, filters them
//! to the requested shards, and flips only the kept rows to the claimed
//! status with an owner stamp. Unkept rows are released at commit and stay
//! pending.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::{path::Path as ObjectPath, ObjectStore};
use serde_json::{Map, Value};
use sqlx::mysql::{MySqlPoolOptions, MySqlRow};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::Row;

use easystore_core::consistent_hash;

use crate::config::{SourceConfig, SourceDialect};
use crate::error::{PackerError, Result};

/// A claimed source row, ready for fetch and packing.
#[derive(Debug, Clone)]
pub struct PendingFile {
    /// Name of the source this row was claimed from.
    pub source: String,
    pub id: i64,
    pub bucket: String,
    pub key: String,
    pub size_bytes: u64,
    pub shard_id: u32,
    /// Marker-stamped target name, when the source carries one.
    pub name: Option<String>,
    /// Result metadata (provenance plus configured metadata columns).
    pub meta: Value,
}

/// Terminal bookkeeping for a successfully packed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedFile {
    pub source: String,
    pub id: i64,
    pub name: String,
}

/// The claim/fetch/mark capability the packer consumes.
#[async_trait]
pub trait FileSource: Send + Sync {
    /// Claim up to `limit` pending rows belonging to the given shards.
    async fn claim(&self, shard_ids: &[u32], limit: u32) -> Result<Vec<PendingFile>>;

    /// Download a claimed file's body from the source object store.
    async fn fetch(&self, file: &PendingFile) -> Result<Bytes>;

    /// Mark rows packed into `container_id`. Called only after the
    /// container record is COMMITTED.
    async fn mark_packed(&self, container_id: &str, files: &[PackedFile]) -> Result<()>;

    /// Mark one row failed with a reason.
    async fn mark_failed(&self, file: &PendingFile, reason: &str) -> Result<()>;

    /// Reset rows claimed longer than the configured timeout back to
    /// pending. Returns how many rows were reset.
    async fn reset_stale_claims(&self) -> Result<u64>;
}

// ------------------------------------------------------------------
// SQL builders (pure; unit-tested for every dialect)
// ------------------------------------------------------------------

fn marker(dialect: SourceDialect, n: usize) -> String {
    match dialect {
        SourceDialect::Postgres => format!("${n}"),
        SourceDialect::MySql => "?".to_string(),
        SourceDialect::Mssql => format!("@p{n}"),
        SourceDialect::Oracle => format!(":{n}"),
    }
}

/// Distinct mapped columns, in a stable order.
fn select_columns(cfg: &SourceConfig) -> Vec<String> {
    let cols = &cfg.columns;
    let mut out: Vec<String> = Vec::new();
    let mut push = |col: &str| {
        if !out.iter().any(|c| c == col) {
            out.push(col.to_string());
        }
    };
    push(&cols.id);
    push(&cols.bucket);
    push(&cols.key);
    push(&cols.size_bytes);
    push(&cols.status);
    if let Some(col) = &cols.created_at {
        push(col);
    }
    if let Some(col) = &cols.shard_key {
        push(col);
    }
    if let Some(col) = &cols.des_name {
        push(col);
    }
    for col in cfg.metadata_columns.values() {
        push(col);
    }
    out
}

/// The claim SELECT: pending rows, dialect-appropriate locking and limit.
/// Binds: 1 = pending status value, 2 = batch limit.
pub(crate) fn build_claim_select(cfg: &SourceConfig) -> String {
    let table = cfg.qualified_table();
    let columns = select_columns(cfg).join(", ");
    let status = &cfg.columns.status;
    let p1 = marker(cfg.dialect, 1);
    let p2 = marker(cfg.dialect, 2);
    let extra = cfg
        .where_clause
        .as_deref()
        .map(|w| format!(" AND ({w})"))
        .unwrap_or_default();

    match cfg.dialect {
        SourceDialect::Postgres | SourceDialect::MySql => format!(
            "SELECT {columns} FROM {table} \
             WHERE {status} = {p1}{extra} \
             LIMIT {p2} FOR UPDATE SKIP LOCKED"
        ),
        SourceDialect::Mssql => format!(
            "SELECT TOP ({p2}) {columns} FROM {table} WITH (ROWLOCK, UPDLOCK, READPAST) \
             WHERE {status} = {p1}{extra}"
        ),
        SourceDialect::Oracle => format!(
            "SELECT {columns} FROM {table} \
             WHERE {status} = {p1}{extra} AND ROWNUM <= {p2} \
             FOR UPDATE SKIP LOCKED"
        ),
    }
}

/// The claim UPDATE: flip kept rows to claimed with an owner stamp.
/// Binds, in order: claimed status, [claimed_by], [claimed_at], ids.
pub(crate) fn build_claim_update(cfg: &SourceConfig, id_count: usize) -> String {
    let table = cfg.qualified_table();
    let cols = &cfg.columns;
    let mut n = 0;
    let mut next = || {
        n += 1;
        marker(cfg.dialect, n)
    };

    let mut sets = vec![format!("{} = {}", cols.status, next())];
    if let Some(col) = &cols.claimed_by {
        sets.push(format!("{col} = {}", next()));
    }
    if let Some(col) = &cols.claimed_at {
        sets.push(format!("{col} = {}", next()));
    }

    let ids = match cfg.dialect {
        SourceDialect::Postgres => format!("{} = ANY({})", cols.id, next()),
        _ => {
            let markers: Vec<String> = (0..id_count).map(|_| next()).collect();
            format!("{} IN ({})", cols.id, markers.join(", "))
        }
    };

    format!("UPDATE {table} SET {} WHERE {ids}", sets.join(", "))
}

/// The packed UPDATE for one row.
/// Binds, in order: packed status, [des_name], [container_id], id.
pub(crate) fn build_mark_packed(cfg: &SourceConfig) -> String {
    let table = cfg.qualified_table();
    let cols = &cfg.columns;
    let mut n = 0;
    let mut next = || {
        n += 1;
        marker(cfg.dialect, n)
    };

    let mut sets = vec![format!("{} = {}", cols.status, next())];
    if let Some(col) = &cols.des_name {
        sets.push(format!("{col} = {}", next()));
    }
    if let Some(col) = &cols.container_id {
        sets.push(format!("{col} = {}", next()));
    }
    format!(
        "UPDATE {table} SET {} WHERE {} = {}",
        sets.join(", "),
        cols.id,
        next()
    )
}

/// The failed UPDATE for one row.
/// Binds, in order: failed status, [error_message], id.
pub(crate) fn build_mark_failed(cfg: &SourceConfig) -> String {
    let table = cfg.qualified_table();
    let cols = &cfg.columns;
    let mut n = 0;
    let mut next = || {
        n += 1;
        marker(cfg.dialect, n)
    };

    let mut sets = vec![format!("{} = {}", cols.status, next())];
    if let Some(col) = &cols.error_message {
        sets.push(format!("{col} = {}", next()));
    }
    format!(
        "UPDATE {table} SET {} WHERE {} = {}",
        sets.join(", "),
        cols.id,
        next()
    )
}

/// The stale-claim reset. Requires a mapped `claimed_at` column.
/// Binds, in order: pending status, claimed status, cutoff timestamp.
pub(crate) fn build_reset_stale(cfg: &SourceConfig) -> Option<String> {
    let table = cfg.qualified_table();
    let cols = &cfg.columns;
    let claimed_at = cols.claimed_at.as_deref()?;
    let mut n = 0;
    let mut next = || {
        n += 1;
        marker(cfg.dialect, n)
    };

    let mut sets = vec![format!("{} = {}", cols.status, next())];
    if let Some(col) = &cols.claimed_by {
        sets.push(format!("{col} = NULL"));
    }
    let status_claimed = next();
    let cutoff = next();
    sets.push(format!("{claimed_at} = NULL"));

    Some(format!(
        "UPDATE {table} SET {} WHERE {} = {status_claimed} \
         AND ({claimed_at} IS NULL OR {claimed_at} < {cutoff})",
        sets.join(", "),
        cols.status,
    ))
}

// ------------------------------------------------------------------
// SQL execution (Postgres and MySQL)
// ------------------------------------------------------------------

enum SourcePool {
    Postgres(sqlx::PgPool),
    MySql(sqlx::MySqlPool),
}

/// One configured source database.
pub struct SqlSourceProvider {
    config: SourceConfig,
    owner_id: String,
    pool: SourcePool,
}

impl SqlSourceProvider {
    /// Connect to the source. MSSQL and Oracle configurations are rejected
    /// at startup: their SQL builders exist, but no driver does.
    pub async fn connect(config: SourceConfig, owner_id: impl Into<String>) -> Result<Self> {
        let pool = match config.dialect {
            SourceDialect::Postgres => SourcePool::Postgres(
                PgPoolOptions::new()
                    .max_connections(5)
                    .connect(&config.url)
                    .await?,
            ),
            SourceDialect::MySql => SourcePool::MySql(
                MySqlPoolOptions::new()
                    .max_connections(5)
                    .connect(&config.url)
                    .await?,
            ),
            SourceDialect::Mssql | SourceDialect::Oracle => {
                return Err(PackerError::Config(format!(
                    "source {:?}: no driver available for dialect {:?}",
                    config.name, config.dialect
                )))
            }
        };
        tracing::info!(source = %config.name, dialect = ?config.dialect, "connected to source database");
        Ok(Self {
            config,
            owner_id: owner_id.into(),
            pool,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    async fn claim_rows(&self, shard_ids: &[u32], limit: u32) -> Result<Vec<PendingFile>> {
        let select = build_claim_select(&self.config);
        let keep = match &self.pool {
            SourcePool::Postgres(pool) => {
                let mut tx = pool.begin().await?;
                let rows = sqlx::query(&select)
                    .bind(&self.config.status_pending_value)
                    .bind(i64::from(limit))
                    .fetch_all(&mut *tx)
                    .await?;

                let mut keep = Vec::new();
                for row in &rows {
                    let file = self.pending_from_pg(row)?;
                    if shard_ids.contains(&file.shard_id) {
                        keep.push(file);
                    }
                    if keep.len() >= limit as usize {
                        break;
                    }
                }

                if !keep.is_empty() {
                    let ids: Vec<i64> = keep.iter().map(|f| f.id).collect();
                    let update = build_claim_update(&self.config, ids.len());
                    let mut query =
                        sqlx::query(&update).bind(&self.config.status_claimed_value);
                    if self.config.columns.claimed_by.is_some() {
                        query = query.bind(&self.owner_id);
                    }
                    if self.config.columns.claimed_at.is_some() {
                        query = query.bind(chrono::Utc::now());
                    }
                    query.bind(ids).execute(&mut *tx).await?;
                }
                tx.commit().await?;
                keep
            }
            SourcePool::MySql(pool) => {
                let mut tx = pool.begin().await?;
                let rows = sqlx::query(&select)
                    .bind(&self.config.status_pending_value)
                    .bind(i64::from(limit))
                    .fetch_all(&mut *tx)
                    .await?;

                let mut keep = Vec::new();
                for row in &rows {
                    let file = self.pending_from_mysql(row)?;
                    if shard_ids.contains(&file.shard_id) {
                        keep.push(file);
                    }
                    if keep.len() >= limit as usize {
                        break;
                    }
                }

                if !keep.is_empty() {
                    let update = build_claim_update(&self.config, keep.len());
                    let mut query =
                        sqlx::query(&update).bind(&self.config.status_claimed_value);
                    if self.config.columns.claimed_by.is_some() {
                        query = query.bind(&self.owner_id);
                    }
                    if self.config.columns.claimed_at.is_some() {
                        query = query.bind(chrono::Utc::now());
                    }
                    for file in &keep {
                        query = query.bind(file.id);
                    }
                    query.execute(&mut *tx).await?;
                }
                tx.commit().await?;
                keep
            }
        };

        if !keep.is_empty() {
            tracing::info!(
                source = %self.config.name,
                claimed = keep.len(),
                owner = %self.owner_id,
                "claimed pending files"
            );
        }
        Ok(keep)
    }

    async fn mark_packed_rows(&self, container_id: &str, files: &[PackedFile]) -> Result<()> {
        let sql = build_mark_packed(&self.config);
        for file in files {
            match &self.pool {
                SourcePool::Postgres(pool) => {
                    let mut query = sqlx::query(&sql).bind(&self.config.status_packed_value);
                    if self.config.columns.des_name.is_some() {
                        query = query.bind(&file.name);
                    }
                    if self.config.columns.container_id.is_some() {
                        query = query.bind(container_id);
                    }
                    query.bind(file.id).execute(pool).await?;
                }
                SourcePool::MySql(pool) => {
                    let mut query = sqlx::query(&sql).bind(&self.config.status_packed_value);
                    if self.config.columns.des_name.is_some() {
                        query = query.bind(&file.name);
                    }
                    if self.config.columns.container_id.is_some() {
                        query = query.bind(container_id);
                    }
                    query.bind(file.id).execute(pool).await?;
                }
            }
        }
        Ok(())
    }

    async fn mark_failed_row(&self, file: &PendingFile, reason: &str) -> Result<()> {
        let sql = build_mark_failed(&self.config);
        let reason: String = reason.chars().take(500).collect();
        match &self.pool {
            SourcePool::Postgres(pool) => {
                let mut query = sqlx::query(&sql).bind(&self.config.status_failed_value);
                if self.config.columns.error_message.is_some() {
                    query = query.bind(&reason);
                }
                query.bind(file.id).execute(pool).await?;
            }
            SourcePool::MySql(pool) => {
                let mut query = sqlx::query(&sql).bind(&self.config.status_failed_value);
                if self.config.columns.error_message.is_some() {
                    query = query.bind(&reason);
                }
                query.bind(file.id).execute(pool).await?;
            }
        }
        tracing::warn!(
            source = %self.config.name,
            id = file.id,
            reason = %reason,
            "marked source row failed"
        );
        Ok(())
    }

    async fn reset_stale(&self) -> Result<u64> {
        let Some(sql) = build_reset_stale(&self.config) else {
            tracing::warn!(
                source = %self.config.name,
                "no claimed_at column mapped; skipping stale-claim reset"
            );
            return Ok(0);
        };
        let cutoff = chrono::Utc::now()
            - chrono::Duration::seconds(self.config.claim_timeout_seconds as i64);

        let affected = match &self.pool {
            SourcePool::Postgres(pool) => {
                sqlx::query(&sql)
                    .bind(&self.config.status_pending_value)
                    .bind(&self.config.status_claimed_value)
                    .bind(cutoff)
                    .execute(pool)
                    .await?
                    .rows_affected()
            }
            SourcePool::MySql(pool) => {
                sqlx::query(&sql)
                    .bind(&self.config.status_pending_value)
                    .bind(&self.config.status_claimed_value)
                    .bind(cutoff)
                    .execute(pool)
                    .await?
                    .rows_affected()
            }
        };
        if affected > 0 {
            tracing::info!(source = %self.config.name, reset = affected, "reset stale claims");
        }
        Ok(affected)
    }

    fn pending_from_pg(&self, row: &PgRow) -> Result<PendingFile> {
        let cols = &self.config.columns;
        let id: i64 = row
            .try_get::<i64, _>(cols.id.as_str())
            .or_else(|_| row.try_get::<i32, _>(cols.id.as_str()).map(i64::from))?;
        let bucket: String = row.try_get(cols.bucket.as_str())?;
        let key: String = row.try_get(cols.key.as_str())?;
        let size: i64 = row
            .try_get::<i64, _>(cols.size_bytes.as_str())
            .or_else(|_| row.try_get::<i32, _>(cols.size_bytes.as_str()).map(i64::from))?;
        let name = match &cols.des_name {
            Some(col) => row.try_get::<Option<String>, _>(col.as_str()).unwrap_or(None),
            None => None,
        };
        let dynamic = |col: &str| pg_dynamic(row, col);
        self.assemble(id, bucket, key, size, name, dynamic)
    }

    fn pending_from_mysql(&self, row: &MySqlRow) -> Result<PendingFile> {
        let cols = &self.config.columns;
        let id: i64 = row
            .try_get::<i64, _>(cols.id.as_str())
            .or_else(|_| row.try_get::<i32, _>(cols.id.as_str()).map(i64::from))?;
        let bucket: String = row.try_get(cols.bucket.as_str())?;
        let key: String = row.try_get(cols.key.as_str())?;
        let size: i64 = row
            .try_get::<i64, _>(cols.size_bytes.as_str())
            .or_else(|_| row.try_get::<i32, _>(cols.size_bytes.as_str()).map(i64::from))?;
        let name = match &cols.des_name {
            Some(col) => row.try_get::<Option<String>, _>(col.as_str()).unwrap_or(None),
            None => None,
        };
        let dynamic = |col: &str| mysql_dynamic(row, col);
        self.assemble(id, bucket, key, size, name, dynamic)
    }

    fn assemble(
        &self,
        id: i64,
        bucket: String,
        key: String,
        size: i64,
        name: Option<String>,
        dynamic: impl Fn(&str) -> Option<Value>,
    ) -> Result<PendingFile> {
        let cols = &self.config.columns;

        let shard_value = match &cols.shard_key {
            Some(col) => match dynamic(col) {
                Some(Value::String(s)) => s,
                Some(other) => other.to_string(),
                None => key.clone(),
            },
            None => key.clone(),
        };
        let shard_id = consistent_hash(&shard_value, self.config.shard_bits)?;

        let mut meta = Map::new();
        meta.insert("source_db".to_string(), Value::from(self.config.name.clone()));
        meta.insert("source_file_id".to_string(), Value::from(id));
        meta.insert("source_bucket".to_string(), Value::from(bucket.clone()));
        meta.insert("source_key".to_string(), Value::from(key.clone()));
        if let Some(col) = &cols.created_at {
            if let Some(value) = dynamic(col) {
                meta.insert("created_at".to_string(), value);
            }
        }
        for (meta_key, col) in &self.config.metadata_columns {
            if let Some(value) = dynamic(col) {
                meta.insert(meta_key.clone(), value);
            }
        }

        Ok(PendingFile {
            source: self.config.name.clone(),
            id,
            bucket,
            key,
            size_bytes: size.max(0) as u64,
            shard_id,
            name,
            meta: Value::Object(meta),
        })
    }
}

fn pg_dynamic(row: &PgRow, col: &str) -> Option<Value> {
    if let Ok(v) = row.try_get::<Option<String>, _>(col) {
        return v.map(Value::from);
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(col) {
        return v.map(Value::from);
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(col) {
        return v.map(Value::from);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(col) {
        return v.map(Value::from);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(col) {
        return v.map(Value::from);
    }
    if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(col) {
        return v.map(|d| Value::from(d.to_rfc3339()));
    }
    None
}

fn mysql_dynamic(row: &MySqlRow, col: &str) -> Option<Value> {
    if let Ok(v) = row.try_get::<Option<String>, _>(col) {
        return v.map(Value::from);
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(col) {
        return v.map(Value::from);
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(col) {
        return v.map(Value::from);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(col) {
        return v.map(Value::from);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(col) {
        return v.map(Value::from);
    }
    if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(col) {
        return v.map(|d| Value::from(d.to_rfc3339()));
    }
    None
}

// ------------------------------------------------------------------
// Source object stores
// ------------------------------------------------------------------

/// Object-store handles for the source buckets rows point into.
#[derive(Clone, Default)]
pub struct SourceStores {
    default: Option<Arc<dyn ObjectStore>>,
    by_bucket: HashMap<String, Arc<dyn ObjectStore>>,
}

impl SourceStores {
    /// One store serving every bucket (the common single-endpoint case).
    pub fn single(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            default: Some(store),
            by_bucket: HashMap::new(),
        }
    }

    /// Add a bucket-specific store.
    pub fn with_bucket(mut self, bucket: impl Into<String>, store: Arc<dyn ObjectStore>) -> Self {
        self.by_bucket.insert(bucket.into(), store);
        self
    }

    fn resolve(&self, bucket: &str) -> Result<&Arc<dyn ObjectStore>> {
        self.by_bucket
            .get(bucket)
            .or(self.default.as_ref())
            .ok_or_else(|| {
                PackerError::Config(format!("no object store configured for bucket {bucket:?}"))
            })
    }
}

/// [`FileSource`] over one or more SQL source databases.
pub struct MultiSourceProvider {
    providers: Vec<SqlSourceProvider>,
    stores: SourceStores,
}

impl MultiSourceProvider {
    /// Connect every enabled source.
    pub async fn connect(
        sources: Vec<SourceConfig>,
        stores: SourceStores,
        owner_id: &str,
    ) -> Result<Self> {
        let mut providers = Vec::with_capacity(sources.len());
        for config in sources {
            providers.push(SqlSourceProvider::connect(config, owner_id).await?);
        }
        tracing::info!(sources = providers.len(), "source provider initialized");
        Ok(Self { providers, stores })
    }

    fn provider(&self, source: &str) -> Result<&SqlSourceProvider> {
        self.providers
            .iter()
            .find(|p| p.name() == source)
            .ok_or_else(|| PackerError::Config(format!("unknown source database {source:?}")))
    }
}

#[async_trait]
impl FileSource for MultiSourceProvider {
    async fn claim(&self, shard_ids: &[u32], limit: u32) -> Result<Vec<PendingFile>> {
        let mut claimed = Vec::new();
        for provider in &self.providers {
            let remaining = limit as usize - claimed.len();
            if remaining == 0 {
                break;
            }
            match provider.claim_rows(shard_ids, remaining as u32).await {
                Ok(files) => claimed.extend(files),
                Err(e) => {
                    // One broken source must not starve the others.
                    tracing::error!(source = %provider.name(), error = %e, "claim failed");
                }
            }
        }
        Ok(claimed)
    }

    async fn fetch(&self, file: &PendingFile) -> Result<Bytes> {
        let store = self.stores.resolve(&file.bucket)?;
        let result = store.get(&ObjectPath::from(file.key.as_str())).await?;
        Ok(result.bytes().await?)
    }

    async fn mark_packed(&self, container_id: &str, files: &[PackedFile]) -> Result<()> {
        let mut by_source: HashMap<&str, Vec<&PackedFile>> = HashMap::new();
        for file in files {
            by_source.entry(file.source.as_str()).or_default().push(file);
        }
        for (source, group) in by_source {
            let owned: Vec<PackedFile> = group.into_iter().cloned().collect();
            self.provider(source)?
                .mark_packed_rows(container_id, &owned)
                .await?;
        }
        Ok(())
    }

    async fn mark_failed(&self, file: &PendingFile, reason: &str) -> Result<()> {
        self.provider(&file.source)?.mark_failed_row(file, reason).await
    }

    async fn reset_stale_claims(&self) -> Result<u64> {
        let mut total = 0;
        for provider in &self.providers {
            total += provider.reset_stale().await?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ColumnMapping;

    fn mapping() -> ColumnMapping {
        ColumnMapping {
            id: "file_id".to_string(),
            bucket: "bucket_name".to_string(),
            key: "s3_path".to_string(),
            size_bytes: "file_size".to_string(),
            status: "des_status".to_string(),
            created_at: Some("created_at".to_string()),
            shard_key: None,
            des_name: Some("des_name".to_string()),
            claimed_by: Some("claimed_by".to_string()),
            claimed_at: Some("claimed_at".to_string()),
            error_message: Some("error_message".to_string()),
            container_id: Some("des_container_id".to_string()),
        }
    }

    fn config(dialect: SourceDialect) -> SourceConfig {
        SourceConfig {
            name: "catalog".to_string(),
            dialect,
            url: "unused://".to_string(),
            table: "source_files".to_string(),
            schema: None,
            columns: mapping(),
            status_pending_value: "pending".to_string(),
            status_claimed_value: "claimed".to_string(),
            status_packed_value: "packed".to_string(),
            status_failed_value: "failed".to_string(),
            where_clause: None,
            shard_bits: 8,
            batch_size: 100,
            claim_timeout_seconds: 300,
            metadata_columns: Default::default(),
        }
    }

    #[test]
    fn test_claim_select_postgres() {
        let sql = build_claim_select(&config(SourceDialect::Postgres));
        assert_eq!(
            sql,
            "SELECT file_id, bucket_name, s3_path, file_size, des_status, created_at, des_name \
             FROM source_files WHERE des_status = $1 LIMIT $2 FOR UPDATE SKIP LOCKED"
        );
    }

    #[test]
    fn test_claim_select_mysql() {
        let sql = build_claim_select(&config(SourceDialect::MySql));
        assert!(sql.contains("WHERE des_status = ?"));
        assert!(sql.ends_with("LIMIT ? FOR UPDATE SKIP LOCKED"));
    }

    #[test]
    fn test_claim_select_mssql_uses_hints_and_top() {
        let sql = build_claim_select(&config(SourceDialect::Mssql));
        assert!(sql.starts_with("SELECT TOP (@p2)"));
        assert!(sql.contains("WITH (ROWLOCK, UPDLOCK, READPAST)"));
        assert!(!sql.contains("FOR UPDATE"));
    }

    #[test]
    fn test_claim_select_oracle_uses_rownum() {
        let sql = build_claim_select(&config(SourceDialect::Oracle));
        assert!(sql.contains("ROWNUM <= :2"));
        assert!(sql.ends_with("FOR UPDATE SKIP LOCKED"));
    }

    #[test]
    fn test_claim_select_with_schema_and_where() {
        let mut cfg = config(SourceDialect::Postgres);
        cfg.schema = Some("des".to_string());
        cfg.where_clause = Some("file_size > 0".to_string());
        let sql = build_claim_select(&cfg);
        assert!(sql.contains("FROM des.source_files"));
        assert!(sql.contains("AND (file_size > 0)"));
    }

    #[test]
    fn test_claim_update_postgres_uses_any() {
        let sql = build_claim_update(&config(SourceDialect::Postgres), 3);
        assert_eq!(
            sql,
            "UPDATE source_files SET des_status = $1, claimed_by = $2, claimed_at = $3 \
             WHERE file_id = ANY($4)"
        );
    }

    #[test]
    fn test_claim_update_mysql_expands_in_list() {
        let sql = build_claim_update(&config(SourceDialect::MySql), 3);
        assert!(sql.ends_with("WHERE file_id IN (?, ?, ?)"));
    }

    #[test]
    fn test_claim_update_without_stamp_columns() {
        let mut cfg = config(SourceDialect::Postgres);
        cfg.columns.claimed_by = None;
        cfg.columns.claimed_at = None;
        let sql = build_claim_update(&cfg, 1);
        assert_eq!(
            sql,
            "UPDATE source_files SET des_status = $1 WHERE file_id = ANY($2)"
        );
    }

    #[test]
    fn test_mark_packed_sql() {
        let sql = build_mark_packed(&config(SourceDialect::Postgres));
        assert_eq!(
            sql,
            "UPDATE source_files SET des_status = $1, des_name = $2, des_container_id = $3 \
             WHERE file_id = $4"
        );

        let mut cfg = config(SourceDialect::Postgres);
        cfg.columns.des_name = None;
        cfg.columns.container_id = None;
        assert_eq!(
            build_mark_packed(&cfg),
            "UPDATE source_files SET des_status = $1 WHERE file_id = $2"
        );
    }

    #[test]
    fn test_mark_failed_sql() {
        let sql = build_mark_failed(&config(SourceDialect::MySql));
        assert_eq!(
            sql,
            "UPDATE source_files SET des_status = ?, error_message = ? WHERE file_id = ?"
        );
    }

    #[test]
    fn test_reset_stale_sql() {
        let sql = build_reset_stale(&config(SourceDialect::Postgres)).unwrap();
        assert_eq!(
            sql,
            "UPDATE source_files SET des_status = $1, claimed_by = NULL, claimed_at = NULL \
             WHERE des_status = $2 AND (claimed_at IS NULL OR claimed_at < $3)"
        );
    }

    #[test]
    fn test_reset_stale_requires_claimed_at() {
        let mut cfg = config(SourceDialect::Postgres);
        cfg.columns.claimed_at = None;
        assert!(build_reset_stale(&cfg).is_none());
    }

    #[test]
    fn test_select_columns_dedup() {
        let mut cfg = config(SourceDialect::Postgres);
        cfg.columns.shard_key = Some("s3_path".to_string()); // duplicate of key
        cfg.metadata_columns
            .insert("mime".to_string(), "mime_type".to_string());
        let cols = select_columns(&cfg);
        assert_eq!(cols.iter().filter(|c| *c == "s3_path").count(), 1);
        assert!(cols.contains(&"mime_type".to_string()));
    }
}

//! src/services/metadata_store.rs
//!
//! MetadataStore: the persisted index of object fingerprints. The SQLite
//! implementation keeps one row per (bucket, key) and enforces that with the
//! primary key plus an upsert, so concurrent writers for the same key cannot
//! create duplicates.

use async_trait::async_trait;
use sqlx::SqlitePool;
use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};
use thiserror::Error;
use tracing::debug;

use crate::errors::ProcessError;
use crate::models::record::{MetadataRecord, NaturalKey};

const SCHEMA_SQL: &str = include_str!("../../migrations/0001_init.sql");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("metadata store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// Pool exhaustion, I/O trouble and SQLite lock contention are transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Sqlx(sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)) => true,
            StoreError::Sqlx(sqlx::Error::Database(db_err)) => {
                let msg = db_err.message().to_ascii_lowercase();
                msg.contains("locked") || msg.contains("busy")
            }
            StoreError::Sqlx(_) => false,
            StoreError::Unavailable(_) => true,
        }
    }

    pub fn into_process(self, operation: &str) -> ProcessError {
        let retryable = self.is_retryable();
        ProcessError::backend(operation, self, retryable)
    }
}

/// Keyed record store backing the index.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Look up the record for (bucket, key), if any.
    async fn find_by_key(&self, bucket: &str, key: &str) -> StoreResult<Option<MetadataRecord>>;

    /// Insert the record, or replace fingerprint and `last_seen` of the
    /// existing record with the same natural key.
    async fn upsert(&self, record: &MetadataRecord) -> StoreResult<()>;

    /// Remove the record. Returns whether one existed; a missing record is not
    /// an error.
    async fn delete(&self, bucket: &str, key: &str) -> StoreResult<bool>;

    async fn health_check(&self) -> StoreResult<()>;
}

/// SQLite-backed store sharing one long-lived pool across invocations.
#[derive(Clone)]
pub struct SqliteMetadataStore {
    pub db: Arc<SqlitePool>,
}

impl SqliteMetadataStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply the embedded schema. Every statement is idempotent.
    pub async fn migrate(&self) -> StoreResult<usize> {
        let statements = SCHEMA_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        for stmt in &statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }

        Ok(statements.len())
    }

    /// Number of indexed records.
    pub async fn count(&self) -> StoreResult<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM file_records")
            .fetch_one(&*self.db)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn find_by_key(&self, bucket: &str, key: &str) -> StoreResult<Option<MetadataRecord>> {
        let record = sqlx::query_as::<_, MetadataRecord>(
            "SELECT bucket, key, content_fingerprint, last_seen
             FROM file_records
             WHERE bucket = ? AND key = ?",
        )
        .bind(bucket)
        .bind(key)
        .fetch_optional(&*self.db)
        .await?;

        Ok(record)
    }

    async fn upsert(&self, record: &MetadataRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO file_records (bucket, key, content_fingerprint, last_seen)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(bucket, key) DO UPDATE SET
                content_fingerprint = excluded.content_fingerprint,
                last_seen = excluded.last_seen
            "#,
        )
        .bind(&record.bucket)
        .bind(&record.key)
        .bind(&record.content_fingerprint)
        .bind(record.last_seen)
        .execute(&*self.db)
        .await?;

        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM file_records WHERE bucket = ? AND key = ?")
            .bind(bucket)
            .bind(key)
            .execute(&*self.db)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn health_check(&self) -> StoreResult<()> {
        match sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?
        {
            1 => Ok(()),
            other => Err(StoreError::Unavailable(format!(
                "unexpected result: {}",
                other
            ))),
        }
    }
}

/// In-process store with the same semantics as the SQLite one.
///
/// Writes for keys registered with [`MemoryMetadataStore::fail_writes_for`]
/// fail with a retryable error, which lets callers exercise partial failure.
#[derive(Default)]
pub struct MemoryMetadataStore {
    records: RwLock<BTreeMap<NaturalKey, MetadataRecord>>,
    failing_keys: RwLock<HashSet<NaturalKey>>,
    unavailable: AtomicBool,
}

impl MemoryMetadataStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.read_records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_records().is_empty()
    }

    /// Snapshot of all records ordered by natural key.
    pub fn records(&self) -> Vec<MetadataRecord> {
        self.read_records().values().cloned().collect()
    }

    pub fn fail_writes_for(&self, bucket: &str, key: &str) {
        self.failing_keys
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(NaturalKey::new(bucket, key));
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn read_records(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<NaturalKey, MetadataRecord>> {
        self.records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store marked unavailable".into()));
        }
        Ok(())
    }

    fn check_writable(&self, natural_key: &NaturalKey) -> StoreResult<()> {
        self.check_available()?;
        let failing = self
            .failing_keys
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if failing.contains(natural_key) {
            return Err(StoreError::Unavailable(format!(
                "writes to `{}` are failing",
                natural_key
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn find_by_key(&self, bucket: &str, key: &str) -> StoreResult<Option<MetadataRecord>> {
        self.check_available()?;
        Ok(self
            .read_records()
            .get(&NaturalKey::new(bucket, key))
            .cloned())
    }

    async fn upsert(&self, record: &MetadataRecord) -> StoreResult<()> {
        let natural_key = record.natural_key();
        self.check_writable(&natural_key)?;
        self.records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(natural_key, record.clone());
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> StoreResult<bool> {
        let natural_key = NaturalKey::new(bucket, key);
        self.check_writable(&natural_key)?;
        Ok(self
            .records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&natural_key)
            .is_some())
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn sqlite_store() -> SqliteMetadataStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteMetadataStore::new(Arc::new(pool));
        store.migrate().await.unwrap();
        store
    }

    fn record(key: &str, fingerprint: &str, secs: i64) -> MetadataRecord {
        MetadataRecord::new(
            "docs",
            key,
            fingerprint,
            Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn sqlite_upsert_keeps_one_row_per_key() {
        let store = sqlite_store().await;

        store.upsert(&record("a/readme.md", "v1", 0)).await.unwrap();
        store.upsert(&record("a/readme.md", "v2", 60)).await.unwrap();
        store.upsert(&record("b/notes.txt", "n1", 0)).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 2);
        let found = store
            .find_by_key("docs", "a/readme.md")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, record("a/readme.md", "v2", 60));
    }

    #[tokio::test]
    async fn sqlite_find_missing_returns_none() {
        let store = sqlite_store().await;
        assert!(store.find_by_key("docs", "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sqlite_delete_reports_existence_and_tolerates_missing() {
        let store = sqlite_store().await;
        store.upsert(&record("x.bin", "f", 0)).await.unwrap();

        assert!(store.delete("docs", "x.bin").await.unwrap());
        assert!(!store.delete("docs", "x.bin").await.unwrap());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sqlite_migrate_is_idempotent() {
        let store = sqlite_store().await;
        store.migrate().await.unwrap();
        store.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn memory_store_failures_are_retryable() {
        let store = MemoryMetadataStore::new();
        store.fail_writes_for("docs", "locked.txt");

        let err = store
            .upsert(&record("locked.txt", "f", 0))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(store.is_empty());

        store.upsert(&record("open.txt", "f", 0)).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn memory_store_unavailable_fails_health_check() {
        let store = MemoryMetadataStore::new();
        store.health_check().await.unwrap();
        store.set_unavailable(true);
        assert!(store.health_check().await.is_err());
        assert!(store.find_by_key("docs", "a").await.is_err());
    }
}

//! Record-at-a-time publishing to the remote document store.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use estate_core::ListingRecord;
use estate_storage::{retry_with_backoff, BackoffPolicy, RetryDisposition};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDocument {
    pub fingerprint: String,
    pub site_key: String,
    pub body: serde_json::Value,
}

impl RemoteDocument {
    pub fn from_record(record: &ListingRecord) -> Result<Self, RemoteWriteError> {
        let body = serde_json::to_value(record)
            .map_err(|e| RemoteWriteError::Rejected(format!("serializing {}: {e}", record.fingerprint)))?;
        Ok(Self {
            fingerprint: record.fingerprint.clone(),
            site_key: record.site_key.clone(),
            body,
        })
    }
}

#[derive(Debug, Error)]
pub enum RemoteWriteError {
    #[error("remote store unavailable: {0}")]
    Unavailable(String),
    #[error("remote store rejected document: {0}")]
    Rejected(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl RemoteWriteError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Unavailable(_) => RetryDisposition::Retryable,
            Self::Rejected(_) => RetryDisposition::NonRetryable,
            Self::Database(err) => match err {
                sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::Tls(_)
                | sqlx::Error::Protocol(_) => RetryDisposition::Retryable,
                _ => RetryDisposition::NonRetryable,
            },
        }
    }
}

/// Single-document idempotent upsert keyed by fingerprint.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn name(&self) -> &str;

    async fn upsert(&self, doc: &RemoteDocument) -> Result<(), RemoteWriteError>;
}

/// Process-local store used for dry runs and tests.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    docs: Mutex<BTreeMap<String, RemoteDocument>>,
    calls: AtomicUsize,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, fingerprint: &str) -> Option<RemoteDocument> {
        self.docs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(fingerprint)
            .cloned()
    }

    pub fn fingerprints(&self) -> Vec<String> {
        self.docs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn upsert_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upsert(&self, doc: &RemoteDocument) -> Result<(), RemoteWriteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.docs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(doc.fingerprint.clone(), doc.clone());
        Ok(())
    }
}

const CREATE_LISTINGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS listing_documents (
    fingerprint TEXT PRIMARY KEY,
    site_key    TEXT NOT NULL,
    body        JSONB NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
)"#;

const UPSERT_LISTING: &str = r#"
INSERT INTO listing_documents (fingerprint, site_key, body, updated_at)
VALUES ($1, $2, $3, now())
ON CONFLICT (fingerprint) DO UPDATE
SET site_key = EXCLUDED.site_key, body = EXCLUDED.body, updated_at = now()"#;

/// Postgres-backed store; the table is created on first use.
pub struct PgDocumentStore {
    pool: PgPool,
    table_ready: OnceCell<()>,
}

impl PgDocumentStore {
    pub async fn connect(database_url: &str) -> Result<Self, RemoteWriteError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            table_ready: OnceCell::new(),
        }
    }

    async fn ensure_table(&self) -> Result<(), RemoteWriteError> {
        self.table_ready
            .get_or_try_init(|| async {
                sqlx::query(CREATE_LISTINGS_TABLE).execute(&self.pool).await?;
                Ok::<(), RemoteWriteError>(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn upsert(&self, doc: &RemoteDocument) -> Result<(), RemoteWriteError> {
        self.ensure_table().await?;
        sqlx::query(UPSERT_LISTING)
            .bind(&doc.fingerprint)
            .bind(&doc.site_key)
            .bind(&doc.body)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteSyncConfig {
    pub backoff: BackoffPolicy,
    /// Log running counts every this many records.
    pub progress_interval: usize,
}

impl Default for RemoteSyncConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::remote_write(),
            progress_interval: 10,
        }
    }
}

/// Upload lifecycle of one record that ran out of retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteWriteAttempt {
    pub fingerprint: String,
    pub attempts: usize,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemoteSyncReport {
    pub uploaded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub failures: Vec<RemoteWriteAttempt>,
}

pub struct RemoteSync {
    store: Arc<dyn DocumentStore>,
    config: RemoteSyncConfig,
    synced: Mutex<HashSet<String>>,
}

impl RemoteSync {
    pub fn new(store: Arc<dyn DocumentStore>, config: RemoteSyncConfig) -> Self {
        Self {
            store,
            config,
            synced: Mutex::new(HashSet::new()),
        }
    }

    /// Upload `records` one at a time. A record that exhausts its retries is counted
    /// and the stream moves on. Records not yet started when `cancel` fires, or already
    /// uploaded by this instance, count as skipped.
    pub async fn sync(&self, records: &[ListingRecord], cancel: &CancellationToken) -> RemoteSyncReport {
        let mut report = RemoteSyncReport::default();
        let interval = self.config.progress_interval.max(1);

        for (i, record) in records.iter().enumerate() {
            if cancel.is_cancelled() {
                report.skipped += (records.len() - i) as u64;
                info!(
                    store = self.store.name(),
                    remaining = records.len() - i,
                    "remote sync interrupted by stop; remaining records skipped"
                );
                break;
            }
            if self.already_synced(&record.fingerprint) {
                report.skipped += 1;
            } else {
                match self.upload(record).await {
                    Ok(attempts) => {
                        self.mark_synced(&record.fingerprint);
                        report.uploaded += 1;
                        if attempts > 1 {
                            debug!(fingerprint = %record.fingerprint, attempts, "remote write succeeded after retry");
                        }
                    }
                    Err(attempt) => {
                        warn!(
                            store = self.store.name(),
                            fingerprint = %attempt.fingerprint,
                            attempts = attempt.attempts,
                            error = attempt.last_error.as_deref().unwrap_or_default(),
                            "remote write failed; continuing with next record"
                        );
                        report.failed += 1;
                        report.failures.push(attempt);
                    }
                }
            }

            let processed = i + 1;
            if processed % interval == 0 {
                info!(
                    store = self.store.name(),
                    processed,
                    total = records.len(),
                    uploaded = report.uploaded,
                    failed = report.failed,
                    skipped = report.skipped,
                    "remote sync progress"
                );
            }
        }
        report
    }

    async fn upload(&self, record: &ListingRecord) -> Result<usize, RemoteWriteAttempt> {
        let doc = RemoteDocument::from_record(record).map_err(|err| RemoteWriteAttempt {
            fingerprint: record.fingerprint.clone(),
            attempts: 0,
            last_error: Some(err.to_string()),
            next_retry_at: None,
        })?;
        retry_with_backoff(&self.config.backoff, RemoteWriteError::disposition, |_| {
            self.store.upsert(&doc)
        })
        .await
        .map(|done| done.attempts)
        .map_err(|exhausted| RemoteWriteAttempt {
            fingerprint: doc.fingerprint.clone(),
            attempts: exhausted.attempts,
            last_error: Some(exhausted.last_error.to_string()),
            next_retry_at: None,
        })
    }

    fn already_synced(&self, fingerprint: &str) -> bool {
        self.synced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(fingerprint)
    }

    fn mark_synced(&self, fingerprint: &str) {
        self.synced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fingerprint.to_string());
    }
}

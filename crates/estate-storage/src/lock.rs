//! Sidecar lock file shared by every process that mutates the workbook.
//!
//! The lock file holds a JSON [`LockRecord`]. Creation uses `create_new`, so only one
//! holder can win; a record older than [`LockConfig::stale_after`] is treated as
//! abandoned and reclaimed by the next contender.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::{parent_dir, retry_with_backoff, BackoffPolicy, RetryDisposition};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub lock_id: Uuid,
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub pid: u32,
}

impl LockRecord {
    pub fn new(holder_id: &str) -> Self {
        Self {
            lock_id: Uuid::new_v4(),
            holder_id: holder_id.to_string(),
            acquired_at: Utc::now(),
            pid: std::process::id(),
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.acquired_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_stale(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        self.age(now) > threshold
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockConfig {
    pub stale_after: Duration,
    pub acquire: BackoffPolicy,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(10 * 60),
            acquire: BackoffPolicy {
                max_retries: 8,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(2),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock {path} is held by {holder_id} since {acquired_at}")]
    Held {
        path: PathBuf,
        holder_id: String,
        acquired_at: DateTime<Utc>,
    },
    #[error("lock {path} still unavailable after {attempts} attempt(s): {last}")]
    Unavailable {
        path: PathBuf,
        attempts: usize,
        last: String,
    },
    #[error("lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LockError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Held { .. } => RetryDisposition::Retryable,
            Self::Unavailable { .. } | Self::Io { .. } => RetryDisposition::NonRetryable,
        }
    }
}

enum LockState {
    Free,
    Held(LockRecord),
    Unreadable { modified: Option<SystemTime> },
}

#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    config: LockConfig,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>, config: LockConfig) -> Self {
        Self {
            path: path.into(),
            config,
        }
    }

    /// Lock guarding `artifact`, stored next to it as `<name>.lock`.
    pub fn beside(artifact: &Path, config: LockConfig) -> Self {
        let mut name = artifact
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        Self::new(parent_dir(artifact).join(name), config)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub async fn read_record(&self) -> Result<Option<LockRecord>, LockError> {
        match self.inspect().await? {
            LockState::Held(record) => Ok(Some(record)),
            LockState::Free | LockState::Unreadable { .. } => Ok(None),
        }
    }

    /// Acquire with the configured backoff; contention past the budget is `Unavailable`.
    pub async fn acquire(&self, holder_id: &str) -> Result<LockGuard, LockError> {
        let outcome = retry_with_backoff(&self.config.acquire, LockError::disposition, |attempt| {
            if attempt > 0 {
                debug!(path = %self.path.display(), attempt, holder_id, "lock contended, retrying");
            }
            self.try_acquire(holder_id)
        })
        .await;

        match outcome {
            Ok(done) => Ok(done.value),
            Err(exhausted) => match exhausted.last_error {
                held @ LockError::Held { .. } => Err(LockError::Unavailable {
                    path: self.path.clone(),
                    attempts: exhausted.attempts,
                    last: held.to_string(),
                }),
                other => Err(other),
            },
        }
    }

    /// Single acquisition attempt, reclaiming the lock if it is stale.
    pub async fn try_acquire(&self, holder_id: &str) -> Result<LockGuard, LockError> {
        if let Some(guard) = self.try_create(holder_id).await? {
            return Ok(guard);
        }

        let now = Utc::now();
        match self.inspect().await? {
            LockState::Held(record) if record.is_stale(self.config.stale_after, now) => {
                warn!(
                    path = %self.path.display(),
                    stale_holder = %record.holder_id,
                    age_secs = record.age(now).as_secs(),
                    "reclaiming stale lock"
                );
                self.reclaim(&record).await?;
                self.try_create(holder_id)
                    .await?
                    .ok_or_else(|| self.held_by("<reclaimed-by-other>", now))
            }
            LockState::Held(record) => Err(LockError::Held {
                path: self.path.clone(),
                holder_id: record.holder_id,
                acquired_at: record.acquired_at,
            }),
            LockState::Unreadable { modified } => {
                let age = modified
                    .and_then(|m| SystemTime::now().duration_since(m).ok())
                    .unwrap_or(Duration::ZERO);
                if age <= self.config.stale_after {
                    // A holder may still be writing its record.
                    return Err(self.held_by("<unreadable>", now));
                }
                warn!(path = %self.path.display(), age_secs = age.as_secs(), "removing unreadable stale lock");
                remove_if_exists(&self.path).map_err(|source| self.io(source))?;
                self.try_create(holder_id)
                    .await?
                    .ok_or_else(|| self.held_by("<unknown>", now))
            }
            LockState::Free => self
                .try_create(holder_id)
                .await?
                .ok_or_else(|| self.held_by("<unknown>", now)),
        }
    }

    async fn try_create(&self, holder_id: &str) -> Result<Option<LockGuard>, LockError> {
        fs::create_dir_all(parent_dir(&self.path))
            .await
            .map_err(|source| self.io(source))?;

        let record = LockRecord::new(holder_id);
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(source) => return Err(self.io(source)),
        };

        let bytes = serde_json::to_vec_pretty(&record)
            .map_err(|e| self.io(std::io::Error::new(ErrorKind::InvalidData, e)))?;
        let written = async {
            file.write_all(&bytes).await?;
            file.sync_all().await
        }
        .await;
        if let Err(source) = written {
            drop(file);
            let _ = fs::remove_file(&self.path).await;
            return Err(self.io(source));
        }

        debug!(path = %self.path.display(), holder_id, lock_id = %record.lock_id, "lock acquired");
        Ok(Some(LockGuard {
            path: self.path.clone(),
            record,
            released: false,
        }))
    }

    async fn inspect(&self) -> Result<LockState, LockError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(LockState::Free),
            Err(source) => return Err(self.io(source)),
        };
        match serde_json::from_str::<LockRecord>(&text) {
            Ok(record) => Ok(LockState::Held(record)),
            Err(_) => {
                let modified = fs::metadata(&self.path)
                    .await
                    .ok()
                    .and_then(|m| m.modified().ok());
                Ok(LockState::Unreadable { modified })
            }
        }
    }

    /// Move the stale lock aside and confirm it was the one we judged stale. If a
    /// fresh holder slipped in first, hand its file back with a no-clobber link.
    ///
    /// Between the rename and the link a third contender can `create_new` the lock.
    /// The link then fails and two holders believe they own it; this is the same
    /// narrow read-then-delete window as in [`remove_if_owned`], and is only logged.
    async fn reclaim(&self, stale: &LockRecord) -> Result<(), LockError> {
        let mut tombstone_name = self.path.as_os_str().to_os_string();
        tombstone_name.push(format!(".stale-{}", Uuid::new_v4()));
        let tombstone = PathBuf::from(tombstone_name);

        match fs::rename(&self.path, &tombstone).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(source) => return Err(self.io(source)),
        }

        let moved = fs::read_to_string(&tombstone)
            .await
            .ok()
            .and_then(|t| serde_json::from_str::<LockRecord>(&t).ok());
        if moved.as_ref().map(|r| r.lock_id) != Some(stale.lock_id) {
            if let Err(err) = fs::hard_link(&tombstone, &self.path).await {
                error!(
                    path = %self.path.display(),
                    displaced_holder = moved.as_ref().map_or("<unknown>", |r| r.holder_id.as_str()),
                    error = %err,
                    "could not restore lock taken during reclaim; two holders may now own it"
                );
            }
        }
        let _ = fs::remove_file(&tombstone).await;
        Ok(())
    }

    fn held_by(&self, holder: &str, now: DateTime<Utc>) -> LockError {
        LockError::Held {
            path: self.path.clone(),
            holder_id: holder.to_string(),
            acquired_at: now,
        }
    }

    fn io(&self, source: std::io::Error) -> LockError {
        LockError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Held lock. Released explicitly with [`LockGuard::release`], or on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    record: LockRecord,
    released: bool,
}

impl LockGuard {
    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        remove_if_owned(&self.path, &self.record).map_err(|source| LockError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = remove_if_owned(&self.path, &self.record) {
            warn!(path = %self.path.display(), error = %err, "failed to release lock on drop");
        }
    }
}

/// Delete the lock file only while it still carries our lock id. A reclaim landing
/// between the read and the delete loses its fresh lock.
fn remove_if_owned(path: &Path, record: &LockRecord) -> std::io::Result<()> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    match serde_json::from_str::<LockRecord>(&text) {
        Ok(current) if current.lock_id == record.lock_id => remove_if_exists(path),
        Ok(current) => {
            warn!(
                path = %path.display(),
                holder_id = %current.holder_id,
                "lock was reclaimed by another holder; leaving it in place"
            );
            Ok(())
        }
        Err(_) => Ok(()),
    }
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

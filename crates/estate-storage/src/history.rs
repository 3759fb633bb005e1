//! Cross-run fingerprint history consulted by duplicate detection.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use estate_core::ListingRecord;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::lock::{FileLock, LockConfig};
use crate::workbook::WriteError;
use crate::write_atomic;

pub const DEFAULT_RETENTION_DAYS: i64 = 90;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub fingerprint: String,
    pub site_key: String,
    pub title: Option<String>,
    pub location: Option<String>,
    pub price: Option<f64>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn from_record(record: &ListingRecord) -> Self {
        Self {
            fingerprint: record.fingerprint.clone(),
            site_key: record.site_key.clone(),
            title: record.title.clone(),
            location: record.location.clone(),
            price: record.price,
            first_seen_at: record.scraped_at,
            last_seen_at: record.last_seen_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupHistory {
    #[serde(default = "DedupHistory::current_version")]
    pub version: u32,
    #[serde(default)]
    pub entries: BTreeMap<String, HistoryEntry>,
}

impl Default for DedupHistory {
    fn default() -> Self {
        Self {
            version: Self::current_version(),
            entries: BTreeMap::new(),
        }
    }
}

impl DedupHistory {
    fn current_version() -> u32 {
        1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, fingerprint: &str) -> Option<&HistoryEntry> {
        self.entries.get(fingerprint)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.values()
    }

    /// Record a sighting. Returns `true` when the fingerprint was not known before.
    pub fn observe(&mut self, entry: HistoryEntry) -> bool {
        match self.entries.get_mut(&entry.fingerprint) {
            Some(existing) => {
                existing.first_seen_at = existing.first_seen_at.min(entry.first_seen_at);
                existing.last_seen_at = existing.last_seen_at.max(entry.last_seen_at);
                false
            }
            None => {
                self.entries.insert(entry.fingerprint.clone(), entry);
                true
            }
        }
    }

    pub fn touch(&mut self, fingerprint: &str, seen_at: DateTime<Utc>) {
        if let Some(entry) = self.entries.get_mut(fingerprint) {
            entry.last_seen_at = entry.last_seen_at.max(seen_at);
        }
    }

    pub fn remove(&mut self, fingerprint: &str) -> Option<HistoryEntry> {
        self.entries.remove(fingerprint)
    }

    pub fn merge(&mut self, other: DedupHistory) {
        for entry in other.entries.into_values() {
            self.observe(entry);
        }
    }

    /// Drop entries not seen since `cutoff`. Returns how many were removed.
    pub fn prune_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.last_seen_at >= cutoff);
        before - self.entries.len()
    }
}

#[derive(Debug, Clone)]
pub struct DedupHistoryStore {
    path: PathBuf,
    lock: FileLock,
    holder_id: String,
    retention: Duration,
}

impl DedupHistoryStore {
    pub fn new(path: impl Into<PathBuf>, lock_config: LockConfig, holder_id: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            lock: FileLock::beside(&path, lock_config),
            path,
            holder_id: holder_id.into(),
            retention: Duration::days(DEFAULT_RETENTION_DAYS),
        }
    }

    pub fn with_retention_days(mut self, days: i64) -> Self {
        self.retention = Duration::days(days.max(1));
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> anyhow::Result<DedupHistory> {
        read_history(&self.path).await
    }

    /// Merge `history` into whatever is on disk, prune expired entries and replace the
    /// file. Returns the persisted view.
    pub async fn save(&self, history: &DedupHistory) -> Result<DedupHistory, WriteError> {
        let guard = self.lock.acquire(&self.holder_id).await?;
        let persisted = self.merge_and_write(history).await;
        let released = guard.release();

        let persisted = persisted.map_err(|cause| WriteError::Io {
            path: self.path.clone(),
            cause,
        })?;
        if let Err(err) = released {
            warn!(path = %self.path.display(), error = %err, "history lock release failed");
        }
        Ok(persisted)
    }

    async fn merge_and_write(&self, history: &DedupHistory) -> anyhow::Result<DedupHistory> {
        let mut merged = read_history(&self.path).await?;
        merged.merge(history.clone());
        let pruned = merged.prune_older_than(Utc::now() - self.retention);
        if pruned > 0 {
            debug!(path = %self.path.display(), pruned, "pruned expired history entries");
        }

        let bytes = serde_json::to_vec_pretty(&merged).context("serializing dedup history")?;
        write_atomic(&self.path, &bytes).await?;
        Ok(merged)
    }
}

async fn read_history(path: &Path) -> anyhow::Result<DedupHistory> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(DedupHistory::default()),
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };
    serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
}

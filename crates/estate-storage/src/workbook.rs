//! Shared listings workbook: one parquet file, one row per retained fingerprint.
//!
//! Every mutation runs under the sidecar [`FileLock`]: read the current file, merge rows
//! by fingerprint, write a temp sibling, rename it over the original, release.

use std::collections::HashMap;
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use arrow_array::{Array, Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use estate_core::ListingRecord;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::lock::{FileLock, LockConfig, LockError};
use crate::{parent_dir, temp_sibling};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkbookRow {
    pub fingerprint: String,
    pub site_key: String,
    pub title: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub location: Option<String>,
    pub bedrooms: Option<u32>,
    pub bathrooms: Option<u32>,
    pub property_type: Option<String>,
    pub listing_url: Option<String>,
    pub quality_score: f64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub extra_json: Option<String>,
}

impl From<&ListingRecord> for WorkbookRow {
    fn from(record: &ListingRecord) -> Self {
        Self {
            fingerprint: record.fingerprint.clone(),
            site_key: record.site_key.clone(),
            title: record.title.clone(),
            price: record.price,
            currency: record.currency.clone(),
            location: record.location.clone(),
            bedrooms: record.bedrooms,
            bathrooms: record.bathrooms,
            property_type: record.property_type.clone(),
            listing_url: record.listing_url.clone(),
            quality_score: record.quality_score,
            first_seen_at: record.scraped_at,
            last_seen_at: record.last_seen_at,
            extra_json: if record.extra.is_empty() {
                None
            } else {
                serde_json::to_string(&record.extra).ok()
            },
        }
    }
}

impl WorkbookRow {
    /// Overwrite content from a newer observation, keeping the original first-seen time.
    fn refresh_from(&mut self, newer: WorkbookRow) {
        let first_seen_at = self.first_seen_at.min(newer.first_seen_at);
        let last_seen_at = self.last_seen_at.max(newer.last_seen_at);
        *self = newer;
        self.first_seen_at = first_seen_at;
        self.last_seen_at = last_seen_at;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteReport {
    pub inserted: usize,
    pub updated: usize,
    pub total_rows: usize,
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("workbook {path}: {cause:#}")]
    Io { path: PathBuf, cause: anyhow::Error },
}

impl WriteError {
    /// Lock contention, as opposed to a failure to persist.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            Self::Lock(LockError::Held { .. } | LockError::Unavailable { .. })
        )
    }
}

#[derive(Debug, Clone)]
pub struct DurableWriter {
    path: PathBuf,
    lock: FileLock,
    holder_id: String,
}

impl DurableWriter {
    pub fn new(path: impl Into<PathBuf>, lock_config: LockConfig, holder_id: impl Into<String>) -> Self {
        let path = path.into();
        let lock = FileLock::beside(&path, lock_config);
        Self {
            path,
            lock,
            holder_id: holder_id.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock(&self) -> &FileLock {
        &self.lock
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Insert new fingerprints and refresh existing ones. The lock is released on
    /// every path out of this function.
    pub async fn upsert(&self, records: &[ListingRecord]) -> Result<WriteReport, WriteError> {
        if records.is_empty() {
            return Ok(WriteReport::default());
        }
        let rows = records.iter().map(WorkbookRow::from).collect::<Vec<_>>();

        let guard = self.lock.acquire(&self.holder_id).await?;
        let path = self.path.clone();
        let merged = tokio::task::spawn_blocking(move || merge_into_workbook(&path, rows))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|r| r);
        let released = guard.release();

        let report = merged.map_err(|cause| WriteError::Io {
            path: self.path.clone(),
            cause,
        })?;
        if let Err(err) = released {
            warn!(path = %self.path.display(), error = %err, "workbook lock release failed");
        }
        debug!(
            path = %self.path.display(),
            inserted = report.inserted,
            updated = report.updated,
            total_rows = report.total_rows,
            "workbook updated"
        );
        Ok(report)
    }

    /// Snapshot read. Safe without the lock because replacement is an atomic rename.
    pub fn read_all(&self) -> Result<Vec<WorkbookRow>, WriteError> {
        read_rows(&self.path).map_err(|cause| WriteError::Io {
            path: self.path.clone(),
            cause,
        })
    }
}

fn merge_into_workbook(path: &Path, incoming: Vec<WorkbookRow>) -> anyhow::Result<WriteReport> {
    let mut rows = read_rows(path)?;
    let mut index: HashMap<String, usize> = rows
        .iter()
        .enumerate()
        .map(|(i, row)| (row.fingerprint.clone(), i))
        .collect();

    let mut report = WriteReport::default();
    for row in incoming {
        match index.get(&row.fingerprint) {
            Some(&i) => {
                rows[i].refresh_from(row);
                report.updated += 1;
            }
            None => {
                index.insert(row.fingerprint.clone(), rows.len());
                rows.push(row);
                report.inserted += 1;
            }
        }
    }
    report.total_rows = rows.len();

    write_rows(path, &rows)?;
    Ok(report)
}

fn workbook_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        ArrowField::new("fingerprint", DataType::Utf8, false),
        ArrowField::new("site_key", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, true),
        ArrowField::new("price", DataType::Float64, true),
        ArrowField::new("currency", DataType::Utf8, true),
        ArrowField::new("location", DataType::Utf8, true),
        ArrowField::new("bedrooms", DataType::UInt32, true),
        ArrowField::new("bathrooms", DataType::UInt32, true),
        ArrowField::new("property_type", DataType::Utf8, true),
        ArrowField::new("listing_url", DataType::Utf8, true),
        ArrowField::new("quality_score", DataType::Float64, false),
        ArrowField::new("first_seen_at", DataType::Utf8, false),
        ArrowField::new("last_seen_at", DataType::Utf8, false),
        ArrowField::new("extra_json", DataType::Utf8, true),
    ]))
}

fn rows_to_batch(rows: &[WorkbookRow]) -> anyhow::Result<RecordBatch> {
    let text = |f: fn(&WorkbookRow) -> Option<&str>| {
        StringArray::from(rows.iter().map(f).collect::<Vec<_>>())
    };
    let first_seen = rows
        .iter()
        .map(|r| r.first_seen_at.to_rfc3339())
        .collect::<Vec<_>>();
    let last_seen = rows
        .iter()
        .map(|r| r.last_seen_at.to_rfc3339())
        .collect::<Vec<_>>();

    RecordBatch::try_new(
        workbook_schema(),
        vec![
            Arc::new(text(|r| Some(r.fingerprint.as_str()))),
            Arc::new(text(|r| Some(r.site_key.as_str()))),
            Arc::new(text(|r| r.title.as_deref())),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.price).collect::<Vec<_>>())),
            Arc::new(text(|r| r.currency.as_deref())),
            Arc::new(text(|r| r.location.as_deref())),
            Arc::new(UInt32Array::from(rows.iter().map(|r| r.bedrooms).collect::<Vec<_>>())),
            Arc::new(UInt32Array::from(rows.iter().map(|r| r.bathrooms).collect::<Vec<_>>())),
            Arc::new(text(|r| r.property_type.as_deref())),
            Arc::new(text(|r| r.listing_url.as_deref())),
            Arc::new(Float64Array::from(
                rows.iter().map(|r| r.quality_score).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(first_seen)),
            Arc::new(StringArray::from(last_seen)),
            Arc::new(text(|r| r.extra_json.as_deref())),
        ],
    )
    .context("building workbook record batch")
}

fn write_rows(path: &Path, rows: &[WorkbookRow]) -> anyhow::Result<()> {
    let batch = rows_to_batch(rows)?;
    let parent = parent_dir(path);
    std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;

    let temp_path = temp_sibling(path);
    if let Err(err) = write_parquet(&temp_path, &batch) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(err);
    }
    if let Err(err) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

fn write_parquet(path: &Path, batch: &RecordBatch) -> anyhow::Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let sink = file
        .try_clone()
        .with_context(|| format!("cloning handle for {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(sink, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("syncing {}", path.display()))?;
    Ok(())
}

fn read_rows(path: &Path) -> anyhow::Result<Vec<WorkbookRow>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("opening {}", path.display())),
    };
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("reading parquet metadata {}", path.display()))?
        .build()
        .with_context(|| format!("opening parquet reader {}", path.display()))?;

    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch.with_context(|| format!("decoding record batch {}", path.display()))?;
        rows.extend(batch_to_rows(&batch)?);
    }
    Ok(rows)
}

fn batch_to_rows(batch: &RecordBatch) -> anyhow::Result<Vec<WorkbookRow>> {
    let fingerprint = string_column(batch, "fingerprint")?;
    let site_key = string_column(batch, "site_key")?;
    let title = string_column(batch, "title")?;
    let price = column::<Float64Array>(batch, "price")?;
    let currency = string_column(batch, "currency")?;
    let location = string_column(batch, "location")?;
    let bedrooms = column::<UInt32Array>(batch, "bedrooms")?;
    let bathrooms = column::<UInt32Array>(batch, "bathrooms")?;
    let property_type = string_column(batch, "property_type")?;
    let listing_url = string_column(batch, "listing_url")?;
    let quality_score = column::<Float64Array>(batch, "quality_score")?;
    let first_seen_at = string_column(batch, "first_seen_at")?;
    let last_seen_at = string_column(batch, "last_seen_at")?;
    let extra_json = string_column(batch, "extra_json")?;

    (0..batch.num_rows())
        .map(|i| {
            Ok(WorkbookRow {
                fingerprint: fingerprint.value(i).to_string(),
                site_key: site_key.value(i).to_string(),
                title: opt_string(title, i),
                price: (!price.is_null(i)).then(|| price.value(i)),
                currency: opt_string(currency, i),
                location: opt_string(location, i),
                bedrooms: (!bedrooms.is_null(i)).then(|| bedrooms.value(i)),
                bathrooms: (!bathrooms.is_null(i)).then(|| bathrooms.value(i)),
                property_type: opt_string(property_type, i),
                listing_url: opt_string(listing_url, i),
                quality_score: quality_score.value(i),
                first_seen_at: parse_timestamp(first_seen_at.value(i))?,
                last_seen_at: parse_timestamp(last_seen_at.value(i))?,
                extra_json: opt_string(extra_json, i),
            })
        })
        .collect()
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> anyhow::Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .with_context(|| format!("workbook column `{name}` missing or mistyped"))
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> anyhow::Result<&'a StringArray> {
    column::<StringArray>(batch, name)
}

fn opt_string(array: &StringArray, i: usize) -> Option<String> {
    (!array.is_null(i)).then(|| array.value(i).to_string())
}

fn parse_timestamp(text: &str) -> anyhow::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.with_timezone(&Utc))
        .with_context(|| format!("invalid workbook timestamp `{text}`"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BackoffPolicy;
    use chrono::TimeZone;
    use estate_core::RawListing;
    use std::time::Duration;
    use tempfile::tempdir;

    fn quick_lock() -> LockConfig {
        LockConfig {
            stale_after: Duration::from_secs(600),
            acquire: BackoffPolicy::fixed(1, Duration::from_millis(5)),
        }
    }

    fn record(title: &str, price: &str, hour: u32) -> ListingRecord {
        let at = Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).single().unwrap();
        let raw = RawListing::new()
            .with_field("title", title)
            .with_field("price", price)
            .with_field("location", "Lekki, Lagos")
            .with_field("bedrooms", "3")
            .with_field("agent", "Acme");
        let mut record = ListingRecord::from_raw("propertyhub", &raw, at);
        record.quality_score = 0.9;
        record
    }

    #[tokio::test]
    async fn upsert_inserts_then_refreshes_by_fingerprint() {
        let dir = tempdir().expect("tempdir");
        let writer = DurableWriter::new(dir.path().join("listings.parquet"), quick_lock(), "test");

        let first = record("Three bedroom flat with BQ", "₦ 5,000,000", 9);
        let other = record("Two bedroom terrace duplex", "₦ 3,000,000", 9);
        let report = writer.upsert(&[first.clone(), other]).await.expect("first upsert");
        assert_eq!(report, WriteReport { inserted: 2, updated: 0, total_rows: 2 });

        let mut later = record("Three bedroom flat with BQ", "₦ 5,000,000", 15);
        later.quality_score = 0.95;
        let report = writer.upsert(&[later]).await.expect("second upsert");
        assert_eq!(report, WriteReport { inserted: 0, updated: 1, total_rows: 2 });

        let rows = writer.read_all().expect("read back");
        let row = rows.iter().find(|r| r.fingerprint == first.fingerprint).unwrap();
        assert_eq!(row.first_seen_at, first.scraped_at);
        assert_eq!(row.last_seen_at.format("%H").to_string(), "15");
        assert_eq!(row.quality_score, 0.95);
        assert_eq!(row.bedrooms, Some(3));
        assert_eq!(row.bathrooms, None);
        assert_eq!(row.extra_json.as_deref(), Some("{\"agent\":\"Acme\"}"));
        assert!(!writer.lock().path().exists());
    }

    #[tokio::test]
    async fn missing_workbook_reads_as_empty() {
        let dir = tempdir().expect("tempdir");
        let writer = DurableWriter::new(dir.path().join("absent.parquet"), quick_lock(), "test");
        assert!(writer.read_all().expect("read").is_empty());
    }

    #[tokio::test]
    async fn held_lock_fails_write_without_touching_workbook() {
        let dir = tempdir().expect("tempdir");
        let writer = DurableWriter::new(dir.path().join("listings.parquet"), quick_lock(), "mine");
        let _other = writer.lock().try_acquire("other-process").await.expect("foreign lock");

        let err = writer
            .upsert(&[record("Three bedroom flat with BQ", "5000000", 9)])
            .await
            .unwrap_err();
        assert!(err.is_contention());
        assert!(!writer.path().exists());
    }

    #[tokio::test]
    async fn lock_is_released_when_persisting_fails() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("listings.parquet");
        std::fs::create_dir_all(&path).unwrap();
        let writer = DurableWriter::new(&path, quick_lock(), "test");

        let err = writer
            .upsert(&[record("Three bedroom flat with BQ", "5000000", 9)])
            .await
            .unwrap_err();
        assert!(matches!(err, WriteError::Io { .. }));
        assert!(!writer.lock().path().exists());
    }
}

//! Core domain model for the listing harvester: records, site tasks, batches and run state.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const CRATE_NAME: &str = "estate-core";

const TITLE_KEYS: &[&str] = &["title", "name", "headline"];
const PRICE_KEYS: &[&str] = &["price", "amount", "price_text"];
const CURRENCY_KEYS: &[&str] = &["currency"];
const LOCATION_KEYS: &[&str] = &["location", "address", "area"];
const BEDROOM_KEYS: &[&str] = &["bedrooms", "beds", "bedroom"];
const BATHROOM_KEYS: &[&str] = &["bathrooms", "baths", "bathroom"];
const PROPERTY_TYPE_KEYS: &[&str] = &["property_type", "type", "category"];
const URL_KEYS: &[&str] = &["listing_url", "url", "link"];

/// Untyped field map produced by a page fetcher for one listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawListing {
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub detail_url: Option<String>,
}

impl RawListing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_detail_url(mut self, url: impl Into<String>) -> Self {
        self.detail_url = Some(url.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Overlay fields from a detail page. Non-empty detail values win.
    pub fn merge_detail(&mut self, detail: RawListing) {
        for (key, value) in detail.fields {
            if !value.trim().is_empty() {
                self.fields.insert(key, value);
            }
        }
        if self.detail_url.is_none() {
            self.detail_url = detail.detail_url;
        }
    }

    fn first_of(&self, keys: &[&str]) -> Option<String> {
        keys.iter()
            .filter_map(|k| self.fields.get(*k))
            .map(|v| v.trim())
            .find(|v| !v.is_empty())
            .map(ToString::to_string)
    }
}

/// Normalized listing with its content fingerprint and quality score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
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
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
    pub quality_score: f64,
    pub scraped_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl ListingRecord {
    pub fn from_raw(site_key: &str, raw: &RawListing, observed_at: DateTime<Utc>) -> Self {
        let title = raw.first_of(TITLE_KEYS);
        let price = raw.first_of(PRICE_KEYS).as_deref().and_then(parse_price);
        let location = raw.first_of(LOCATION_KEYS);
        let listing_url = raw.first_of(URL_KEYS).or_else(|| raw.detail_url.clone());

        let consumed = [
            TITLE_KEYS,
            PRICE_KEYS,
            CURRENCY_KEYS,
            LOCATION_KEYS,
            BEDROOM_KEYS,
            BATHROOM_KEYS,
            PROPERTY_TYPE_KEYS,
            URL_KEYS,
        ];
        let extra = raw
            .fields
            .iter()
            .filter(|(k, _)| !consumed.iter().any(|keys| keys.contains(&k.as_str())))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Self {
            fingerprint: listing_fingerprint(title.as_deref(), location.as_deref(), price),
            site_key: site_key.to_string(),
            currency: raw.first_of(CURRENCY_KEYS),
            bedrooms: raw.first_of(BEDROOM_KEYS).as_deref().and_then(parse_count),
            bathrooms: raw.first_of(BATHROOM_KEYS).as_deref().and_then(parse_count),
            property_type: raw.first_of(PROPERTY_TYPE_KEYS),
            title,
            price,
            location,
            listing_url,
            extra,
            quality_score: 0.0,
            scraped_at: observed_at,
            last_seen_at: observed_at,
        }
    }

    pub fn is_land(&self) -> bool {
        self.property_type
            .as_deref()
            .map(|t| {
                let t = t.to_lowercase();
                t.contains("land") || t.contains("plot")
            })
            .unwrap_or(false)
    }
}

pub fn normalize_text(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse display prices such as `₦ 5,000,000`, `NGN 2.5M` or `850k`.
pub fn parse_price(text: &str) -> Option<f64> {
    let lower = text.trim().to_lowercase();
    let mut digits = String::new();
    let mut seen_dot = false;
    let mut rest_start = lower.len();
    for (idx, ch) in lower.char_indices() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        if digits.is_empty() {
            continue;
        }
        if ch == ',' {
            continue;
        }
        if ch == '.' && !seen_dot {
            digits.push('.');
            seen_dot = true;
            continue;
        }
        rest_start = idx;
        break;
    }
    let value: f64 = digits.trim_end_matches('.').parse().ok()?;
    let unit: String = lower[rest_start..]
        .trim_start()
        .chars()
        .take_while(|c| c.is_alphabetic())
        .collect();
    let multiplier = match unit.as_str() {
        "k" | "thousand" => 1_000.0,
        "m" | "mn" | "million" => 1_000_000.0,
        "b" | "bn" | "billion" => 1_000_000_000.0,
        _ => 1.0,
    };
    let price = value * multiplier;
    price.is_finite().then_some(price)
}

/// First integer in the text, e.g. `"3 beds"` -> 3.
pub fn parse_count(text: &str) -> Option<u32> {
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Coarse price bucket (two significant digits) so cosmetic price edits share a fingerprint.
pub fn price_bucket(price: Option<f64>) -> String {
    match price {
        Some(p) if p.is_finite() && p >= 1.0 => {
            let magnitude = p.log10().floor() as i32;
            let step = 10f64.powi(magnitude - 1);
            format!("{}", ((p / step).round() * step) as u64)
        }
        _ => "na".to_string(),
    }
}

pub fn listing_fingerprint(title: Option<&str>, location: Option<&str>, price: Option<f64>) -> String {
    let key = format!(
        "{}|{}|{}",
        normalize_text(title.unwrap_or_default()),
        normalize_text(location.unwrap_or_default()),
        price_bucket(price)
    );
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Paused,
    Stopped,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Completed | Self::Failed)
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteTaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl SiteTaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Ordered group of sites processed before the coordinator checks pause/stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub index: usize,
    pub site_keys: Vec<String>,
    pub status: BatchStatus,
    pub attempts: u32,
}

impl Batch {
    pub fn new(index: usize, site_keys: Vec<String>) -> Self {
        Self {
            index,
            site_keys,
            status: BatchStatus::Pending,
            attempts: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteTask {
    pub site_key: String,
    pub status: SiteTaskStatus,
    pub raw_records: u64,
    pub records_emitted: u64,
    pub rejected: u64,
    pub duplicates: u64,
    pub error_count: u32,
    pub failure_reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SiteTask {
    pub fn new(site_key: impl Into<String>) -> Self {
        Self {
            site_key: site_key.into(),
            status: SiteTaskStatus::Pending,
            raw_records: 0,
            records_emitted: 0,
            rejected: 0,
            duplicates: 0,
            error_count: 0,
            failure_reason: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn start(&mut self, now: DateTime<Utc>) {
        self.status = SiteTaskStatus::InProgress;
        self.failure_reason = None;
        self.started_at = Some(now);
        self.finished_at = None;
    }

    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = SiteTaskStatus::Completed;
        self.finished_at = Some(now);
    }

    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.status = SiteTaskStatus::Failed;
        self.failure_reason = Some(reason.into());
        self.finished_at = Some(now);
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn duration_secs(&self) -> Option<f64> {
        let started = self.started_at?;
        let finished = self.finished_at?;
        Some((finished - started).num_milliseconds().max(0) as f64 / 1000.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatistics {
    pub completed_sites: usize,
    pub failed_sites: usize,
    pub pending_sites: usize,
    pub raw_records: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub duplicates: u64,
    pub task_errors: u64,
    pub local_rows_written: u64,
    pub remote_uploaded: u64,
    pub remote_failed: u64,
    pub remote_skipped: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeRun {
    pub id: Uuid,
    pub requested_sites: Vec<String>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
    pub resumed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub batches: Vec<Batch>,
    pub tasks: Vec<SiteTask>,
    pub stats: RunStatistics,
    pub failure: Option<String>,
}

impl ScrapeRun {
    pub fn new(requested_sites: Vec<String>, batches: Vec<Batch>, now: DateTime<Utc>) -> Self {
        let tasks = batches
            .iter()
            .flat_map(|b| b.site_keys.iter().map(SiteTask::new))
            .collect::<Vec<_>>();
        let mut run = Self {
            id: Uuid::new_v4(),
            requested_sites,
            status: RunStatus::Running,
            started_at: now,
            paused_at: None,
            resumed_at: None,
            finished_at: None,
            batches,
            tasks,
            stats: RunStatistics::default(),
            failure: None,
        };
        run.recompute_stats();
        run
    }

    pub fn task(&self, site_key: &str) -> Option<&SiteTask> {
        self.tasks.iter().find(|t| t.site_key == site_key)
    }

    pub fn task_mut(&mut self, site_key: &str) -> Option<&mut SiteTask> {
        self.tasks.iter_mut().find(|t| t.site_key == site_key)
    }

    /// Re-derive site and record counters from the task table. Local/remote write
    /// counters are owned by the persistence stages and left untouched.
    pub fn recompute_stats(&mut self) {
        let stats = &mut self.stats;
        stats.completed_sites = 0;
        stats.failed_sites = 0;
        stats.pending_sites = 0;
        stats.raw_records = 0;
        stats.accepted = 0;
        stats.rejected = 0;
        stats.duplicates = 0;
        stats.task_errors = 0;
        for task in &self.tasks {
            match task.status {
                SiteTaskStatus::Completed => stats.completed_sites += 1,
                SiteTaskStatus::Failed => stats.failed_sites += 1,
                SiteTaskStatus::Pending | SiteTaskStatus::InProgress => stats.pending_sites += 1,
            }
            stats.raw_records += task.raw_records;
            stats.accepted += task.records_emitted;
            stats.rejected += task.rejected;
            stats.duplicates += task.duplicates;
            stats.task_errors += u64::from(task.error_count);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub index: usize,
    pub status: BatchStatus,
    pub attempts: u32,
    pub total_sites: usize,
    pub completed_sites: usize,
    pub failed_sites: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub active_site_tasks: usize,
    pub in_flight_detail_fetches: usize,
    pub resident_memory_bytes: Option<u64>,
}

/// Point-in-time view of a run, safe to hand to any caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub run_id: Option<Uuid>,
    pub status: RunStatus,
    pub pause_requested: bool,
    pub stop_requested: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub resumed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub current_batch: Option<usize>,
    pub batches: Vec<BatchProgress>,
    pub sites: Vec<SiteTask>,
    pub stats: RunStatistics,
    pub elapsed_secs: f64,
    pub estimated_remaining_secs: Option<f64>,
    pub resources: ResourceSample,
    pub failure: Option<String>,
}

impl ProgressSnapshot {
    pub fn idle() -> Self {
        Self {
            run_id: None,
            status: RunStatus::Idle,
            pause_requested: false,
            stop_requested: false,
            started_at: None,
            paused_at: None,
            resumed_at: None,
            finished_at: None,
            current_batch: None,
            batches: Vec::new(),
            sites: Vec::new(),
            stats: RunStatistics::default(),
            elapsed_secs: 0.0,
            estimated_remaining_secs: None,
            resources: ResourceSample::default(),
            failure: None,
        }
    }
}

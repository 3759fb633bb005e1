//! One site's collection: paced page fetches, optional detail enrichment, then quality
//! filtering and deduplication of every raw item.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use estate_adapters::{PageFetcher, SiteConfig};
use estate_core::{ListingRecord, RawListing, SiteTask};
use estate_storage::{RateLimitConfig, SiteRateLimiter};
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::dedup::{DedupEngine, DedupVerdict};
use crate::quality::QualityFilter;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutorConfig {
    pub max_pages: u32,
    pub enrich_details: bool,
    pub detail_workers: usize,
    /// A task fails once its error count goes above this.
    pub error_threshold: u32,
    pub task_timeout: Duration,
    pub rate_limit: RateLimitConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_pages: 5,
            enrich_details: false,
            detail_workers: 4,
            error_threshold: 5,
            task_timeout: Duration::from_secs(600),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Terminal task plus the records it retained, in processing order.
#[derive(Debug, Clone)]
pub struct SiteTaskOutcome {
    pub task: SiteTask,
    pub accepted: Vec<ListingRecord>,
}

#[derive(Debug)]
struct TaskState {
    task: SiteTask,
    accepted: Vec<ListingRecord>,
    pages_fetched: u32,
}

enum Collected {
    Finished,
    ErrorThreshold,
    Cancelled,
}

pub struct SiteTaskExecutor {
    fetcher: Arc<dyn PageFetcher>,
    quality: QualityFilter,
    dedup: Arc<Mutex<DedupEngine>>,
    config: ExecutorConfig,
    in_flight_details: Arc<AtomicUsize>,
}

impl SiteTaskExecutor {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        quality: QualityFilter,
        dedup: Arc<Mutex<DedupEngine>>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            fetcher,
            quality,
            dedup,
            config,
            in_flight_details: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_detail_gauge(mut self, gauge: Arc<AtomicUsize>) -> Self {
        self.in_flight_details = gauge;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Always returns a terminal task: completion, error threshold, timeout or cancellation.
    pub async fn run(&self, site: &SiteConfig, cancel: &CancellationToken) -> SiteTaskOutcome {
        let mut task = SiteTask::new(site.site_key.clone());
        task.start(Utc::now());
        let state = Mutex::new(TaskState {
            task,
            accepted: Vec::new(),
            pages_fetched: 0,
        });

        let span = info_span!("site_task", site_key = %site.site_key);
        let collected = tokio::time::timeout(self.config.task_timeout, self.collect(site, &state, cancel))
            .instrument(span)
            .await;

        let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();
        let failure = match collected {
            Err(_) => Some(format!(
                "timed out after {}s",
                self.config.task_timeout.as_secs_f64()
            )),
            Ok(Collected::ErrorThreshold) => Some(format!(
                "error threshold exceeded ({} errors)",
                guard.task.error_count
            )),
            Ok(Collected::Cancelled) => Some("cancelled".to_string()),
            Ok(Collected::Finished) if guard.pages_fetched == 0 && guard.task.error_count > 0 => {
                Some("no listing page could be fetched".to_string())
            }
            Ok(Collected::Finished) => None,
        };
        match failure {
            Some(reason) => {
                warn!(
                    site_key = %site.site_key,
                    reason = %reason,
                    errors = guard.task.error_count,
                    retained = guard.accepted.len(),
                    "site task failed"
                );
                guard.task.fail(reason, now);
            }
            None => {
                guard.task.complete(now);
                info!(
                    site_key = %site.site_key,
                    raw = guard.task.raw_records,
                    retained = guard.task.records_emitted,
                    rejected = guard.task.rejected,
                    duplicates = guard.task.duplicates,
                    errors = guard.task.error_count,
                    "site task completed"
                );
            }
        }

        SiteTaskOutcome {
            task: guard.task.clone(),
            accepted: std::mem::take(&mut guard.accepted),
        }
    }

    async fn collect(&self, site: &SiteConfig, state: &Mutex<TaskState>, cancel: &CancellationToken) -> Collected {
        let limiter = SiteRateLimiter::new(self.rate_limit_for(site));
        let max_pages = site
            .rate_limit
            .max_pages
            .map_or(self.config.max_pages, |cap| cap.min(self.config.max_pages));

        for page in 1..=max_pages {
            if cancel.is_cancelled() {
                return Collected::Cancelled;
            }
            limiter.acquire().await;
            let items = match self.fetcher.fetch_page(site, page).await {
                Ok(items) => {
                    limiter.record_success().await;
                    lock(state).pages_fetched += 1;
                    items
                }
                Err(err) => {
                    let streak = limiter.record_error().await;
                    if self.record_error(state) {
                        return Collected::ErrorThreshold;
                    }
                    debug!(site_key = %site.site_key, page, streak, error = %err, "page fetch failed; skipping");
                    continue;
                }
            };
            if items.is_empty() {
                debug!(site_key = %site.site_key, page, "empty page; no more listings");
                break;
            }

            let items = if self.config.enrich_details {
                match self.enrich(site, items, &limiter, state, cancel).await {
                    Some(items) => items,
                    None => return Collected::Cancelled,
                }
            } else {
                items
            };
            if lock(state).task.error_count > self.config.error_threshold {
                return Collected::ErrorThreshold;
            }

            for raw in items {
                self.process(site, raw, state);
            }
        }
        Collected::Finished
    }

    /// Detail fetches run `detail_workers` at a time and keep page order. Returns `None`
    /// if cancellation arrived before every detail fetch had started.
    async fn enrich(
        &self,
        site: &SiteConfig,
        items: Vec<RawListing>,
        limiter: &SiteRateLimiter,
        state: &Mutex<TaskState>,
        cancel: &CancellationToken,
    ) -> Option<Vec<RawListing>> {
        let workers = self.config.detail_workers.max(1);
        let enriched = stream::iter(items)
            .map(|mut item| async move {
                if cancel.is_cancelled() {
                    return None;
                }
                if item.detail_url.is_none() {
                    return Some(item);
                }
                limiter.acquire().await;
                self.in_flight_details.fetch_add(1, Ordering::SeqCst);
                let fetched = self.fetcher.fetch_detail(site, &item).await;
                self.in_flight_details.fetch_sub(1, Ordering::SeqCst);
                match fetched {
                    Ok(detail) => {
                        limiter.record_success().await;
                        item.merge_detail(detail);
                    }
                    Err(err) => {
                        limiter.record_error().await;
                        self.record_error(state);
                        debug!(
                            site_key = %site.site_key,
                            detail_url = item.detail_url.as_deref().unwrap_or_default(),
                            error = %err,
                            "detail fetch failed; keeping listing fields"
                        );
                    }
                }
                Some(item)
            })
            .buffered(workers)
            .collect::<Vec<_>>()
            .await;
        enriched.into_iter().collect()
    }

    fn process(&self, site: &SiteConfig, raw: RawListing, state: &Mutex<TaskState>) {
        let record = ListingRecord::from_raw(&site.site_key, &raw, Utc::now());
        let score = self.quality.score(&record);
        let mut state = lock(state);
        state.task.raw_records += 1;

        if !self.quality.accepts(score) {
            state.task.rejected += 1;
            debug!(
                site_key = %site.site_key,
                score,
                threshold = self.quality.threshold(),
                title = record.title.as_deref().unwrap_or_default(),
                "listing rejected by quality filter"
            );
            return;
        }

        let mut record = record;
        record.quality_score = score;
        let verdict = self.dedup.lock().unwrap_or_else(PoisonError::into_inner).check(&record);
        match verdict {
            DedupVerdict::Unique => {
                state.task.records_emitted += 1;
                state.accepted.push(record);
            }
            DedupVerdict::Duplicate {
                retained_fingerprint,
                similarity,
                exact,
            } => {
                state.task.duplicates += 1;
                debug!(
                    site_key = %site.site_key,
                    fingerprint = %record.fingerprint,
                    retained = %retained_fingerprint,
                    similarity,
                    exact,
                    "duplicate listing"
                );
            }
        }
    }

    /// Count an error; returns `true` once the threshold is exceeded.
    fn record_error(&self, state: &Mutex<TaskState>) -> bool {
        let mut state = lock(state);
        state.task.error_count = state.task.error_count.saturating_add(1);
        state.task.error_count > self.config.error_threshold
    }

    fn rate_limit_for(&self, site: &SiteConfig) -> RateLimitConfig {
        let mut config = self.config.rate_limit;
        if let Some(ms) = site.rate_limit.min_delay_ms {
            config.min_delay = Duration::from_millis(ms);
        }
        config
    }
}

fn lock(state: &Mutex<TaskState>) -> std::sync::MutexGuard<'_, TaskState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

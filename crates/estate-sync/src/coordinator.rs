//! Run state machine. One coordinator owns at most one active run; batches execute in
//! plan order and pause/stop are honoured between batches.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use estate_adapters::{PageFetcher, SiteConfig, SiteRegistry};
use estate_core::{
    BatchProgress, BatchStatus, ListingRecord, ProgressSnapshot, ResourceSample, RunStatus, ScrapeRun,
    SiteTask, SiteTaskStatus,
};
use estate_storage::{
    retry_with_backoff, BackoffPolicy, DedupHistoryStore, DurableWriter, RetryDisposition, WriteError,
};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::dedup::DedupEngine;
use crate::executor::{ExecutorConfig, SiteTaskExecutor};
use crate::planner::BatchPlanner;
use crate::quality::QualityFilter;
use crate::remote::{DocumentStore, RemoteSync, RemoteWriteAttempt};
use crate::report::{write_run_reports, RunSummary};
use crate::{PipelineError, PipelineSettings};

/// Parameters accepted by `start`, whether they come from the CLI or a trigger payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartRequest {
    pub site_keys: Option<Vec<String>>,
    pub max_pages: Option<u32>,
    pub enrich_details: bool,
    pub quality_threshold: Option<f64>,
}

impl StartRequest {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if let Some(threshold) = self.quality_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(PipelineError::Validation(format!(
                    "quality_threshold {threshold} is outside [0, 1]"
                )));
            }
        }
        if self.max_pages == Some(0) {
            return Err(PipelineError::Validation("max_pages must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    pub site_workers: usize,
    pub batch_retry_backoff: Duration,
    /// Tries at one batch's workbook write while the lock is contended.
    pub write_attempts: usize,
    pub write_retry_delay: Duration,
    /// Root for `<run_id>/run_summary.json`; `None` skips reports.
    pub reports_dir: Option<PathBuf>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            site_workers: 4,
            batch_retry_backoff: Duration::from_secs(30),
            write_attempts: 3,
            write_retry_delay: Duration::from_secs(2),
            reports_dir: None,
        }
    }
}

/// External collaborators and stores a coordinator drives.
pub struct PipelineComponents {
    pub registry: Arc<SiteRegistry>,
    pub fetcher: Arc<dyn PageFetcher>,
    pub writer: DurableWriter,
    pub history: DedupHistoryStore,
    pub store: Arc<dyn DocumentStore>,
}

#[derive(Default)]
struct ControlState {
    run: Option<ScrapeRun>,
    pause_requested: bool,
    stop_requested: bool,
    current_batch: Option<usize>,
    cancel: CancellationToken,
    remote_failures: Vec<RemoteWriteAttempt>,
}

impl ControlState {
    fn status(&self) -> RunStatus {
        self.run.as_ref().map_or(RunStatus::Idle, |run| run.status)
    }
}

struct Inner {
    components: PipelineComponents,
    settings: PipelineSettings,
    control: Mutex<ControlState>,
    status_tx: watch::Sender<RunStatus>,
    wake: Notify,
    active_tasks: AtomicUsize,
    detail_gauge: Arc<AtomicUsize>,
}

#[derive(Clone)]
pub struct ExecutionCoordinator {
    inner: Arc<Inner>,
}

impl ExecutionCoordinator {
    pub fn new(components: PipelineComponents, settings: PipelineSettings) -> Self {
        let (status_tx, _) = watch::channel(RunStatus::Idle);
        Self {
            inner: Arc::new(Inner {
                components,
                settings,
                control: Mutex::new(ControlState::default()),
                status_tx,
                wake: Notify::new(),
                active_tasks: AtomicUsize::new(0),
                detail_gauge: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.inner.settings
    }

    pub fn registry(&self) -> &SiteRegistry {
        &self.inner.components.registry
    }

    /// Receiver that observes every status transition.
    pub fn subscribe(&self) -> watch::Receiver<RunStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Plan and launch a run. Must be called from within a tokio runtime.
    pub fn start(&self, request: StartRequest) -> Result<Uuid, PipelineError> {
        request.validate()?;
        let mut control = self.control();
        if let Some(run) = control.run.as_ref().filter(|run| run.status.is_active()) {
            return Err(PipelineError::Concurrency(format!(
                "run {} is already {}",
                run.id, run.status
            )));
        }

        let plan = BatchPlanner::plan(&self.inner.components.registry, request.site_keys.as_deref())?;
        let requested = request.site_keys.clone().unwrap_or_else(|| plan.site_keys());
        let run = ScrapeRun::new(requested, plan.batches, Utc::now());
        let run_id = run.id;
        info!(
            %run_id,
            batches = run.batches.len(),
            sites = run.tasks.len(),
            dropped = plan.dropped.len(),
            fell_back_to_enabled = plan.fell_back_to_enabled,
            "run planned"
        );

        let cancel = CancellationToken::new();
        *control = ControlState {
            run: Some(run),
            cancel: cancel.clone(),
            ..ControlState::default()
        };
        self.inner.status_tx.send_replace(RunStatus::Running);
        drop(control);

        let mut executor = self.inner.settings.executor;
        if let Some(max_pages) = request.max_pages {
            executor.max_pages = max_pages;
        }
        executor.enrich_details |= request.enrich_details;
        let threshold = request
            .quality_threshold
            .unwrap_or(self.inner.settings.quality_threshold);

        tokio::spawn(
            self.clone()
                .drive(executor, threshold, cancel)
                .instrument(info_span!("scrape_run", %run_id)),
        );
        Ok(run_id)
    }

    /// Ask the run to halt once the in-progress batch has drained.
    pub fn pause(&self) -> Result<(), PipelineError> {
        let mut control = self.control();
        let status = control.status();
        if status != RunStatus::Running || control.stop_requested {
            return Err(PipelineError::InvalidTransition { action: "pause", status });
        }
        if !control.pause_requested {
            control.pause_requested = true;
            if let Some(run) = control.run.as_mut() {
                run.paused_at = Some(Utc::now());
            }
            info!("pause requested; run halts after the current batch");
        }
        Ok(())
    }

    /// Valid while paused, or while a pause is still pending.
    pub fn resume(&self) -> Result<(), PipelineError> {
        let mut control = self.control();
        let status = control.status();
        let resumable = match status {
            RunStatus::Paused => true,
            RunStatus::Running => control.pause_requested,
            _ => false,
        };
        if !resumable || control.stop_requested {
            return Err(PipelineError::InvalidTransition { action: "resume", status });
        }

        control.pause_requested = false;
        if let Some(run) = control.run.as_mut() {
            run.status = RunStatus::Running;
            run.resumed_at = Some(Utc::now());
        }
        if status == RunStatus::Paused {
            self.inner.status_tx.send_replace(RunStatus::Running);
        }
        drop(control);
        self.inner.wake.notify_one();
        info!("run resumed");
        Ok(())
    }

    /// Cooperative: in-flight fetches and writes finish, nothing new starts.
    pub fn stop(&self) -> Result<(), PipelineError> {
        let mut control = self.control();
        let status = control.status();
        if !status.is_active() {
            return Err(PipelineError::InvalidTransition { action: "stop", status });
        }
        if !control.stop_requested {
            control.stop_requested = true;
            control.cancel.cancel();
            info!("stop requested");
        }
        drop(control);
        self.inner.wake.notify_one();
        Ok(())
    }

    pub fn status(&self) -> ProgressSnapshot {
        let resources = ResourceSample {
            active_site_tasks: self.inner.active_tasks.load(Ordering::SeqCst),
            in_flight_detail_fetches: self.inner.detail_gauge.load(Ordering::SeqCst),
            resident_memory_bytes: resident_memory_bytes(),
        };
        let control = self.control();
        let Some(run) = control.run.as_ref() else {
            return ProgressSnapshot {
                resources,
                ..ProgressSnapshot::idle()
            };
        };

        let batches = run
            .batches
            .iter()
            .map(|batch| {
                let tasks = batch.site_keys.iter().filter_map(|key| run.task(key));
                let (completed, failed) = tasks.fold((0, 0), |(c, f), task| match task.status {
                    SiteTaskStatus::Completed => (c + 1, f),
                    SiteTaskStatus::Failed => (c, f + 1),
                    _ => (c, f),
                });
                BatchProgress {
                    index: batch.index,
                    status: batch.status,
                    attempts: batch.attempts,
                    total_sites: batch.site_keys.len(),
                    completed_sites: completed,
                    failed_sites: failed,
                }
            })
            .collect();
        let end = run.finished_at.unwrap_or_else(Utc::now);

        ProgressSnapshot {
            run_id: Some(run.id),
            status: run.status,
            pause_requested: control.pause_requested,
            stop_requested: control.stop_requested,
            started_at: Some(run.started_at),
            paused_at: run.paused_at,
            resumed_at: run.resumed_at,
            finished_at: run.finished_at,
            current_batch: control.current_batch,
            batches,
            sites: run.tasks.clone(),
            stats: run.stats.clone(),
            elapsed_secs: (end - run.started_at).num_milliseconds().max(0) as f64 / 1000.0,
            estimated_remaining_secs: estimate_remaining(run),
            resources,
            failure: run.failure.clone(),
        }
    }

    /// Resolve once no run is active and return the final snapshot.
    pub async fn wait(&self) -> ProgressSnapshot {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|status| !status.is_active()).await;
        self.status()
    }

    fn control(&self) -> MutexGuard<'_, ControlState> {
        self.inner.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_run<T>(&self, f: impl FnOnce(&mut ScrapeRun) -> T) -> Option<T> {
        self.control().run.as_mut().map(f)
    }

    async fn drive(self, executor: ExecutorConfig, quality_threshold: f64, cancel: CancellationToken) {
        let outcome = self.execute(executor, quality_threshold, &cancel).await;
        if let Err(err) = &outcome {
            error!(error = %err, "run aborted");
        }
        self.finish(outcome).await;
    }

    async fn execute(
        &self,
        executor_config: ExecutorConfig,
        quality_threshold: f64,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let components = &self.inner.components;
        let settings = &self.inner.settings;
        let history = components
            .history
            .load()
            .await
            .map_err(|err| PipelineError::FatalLocalIo(format!("{err:#}")))?;
        debug!(known_fingerprints = history.len(), "dedup history loaded");

        let dedup = Arc::new(Mutex::new(DedupEngine::new(settings.dedup, history)));
        let executor = SiteTaskExecutor::new(
            components.fetcher.clone(),
            QualityFilter::new(settings.quality_weights, quality_threshold),
            dedup.clone(),
            executor_config,
        )
        .with_detail_gauge(self.inner.detail_gauge.clone());
        let remote = RemoteSync::new(components.store.clone(), settings.remote);

        let batch_count = self.with_run(|run| run.batches.len()).unwrap_or(0);
        for index in 0..batch_count {
            if !self.checkpoint().await {
                info!(next_batch = index, "stop requested; remaining batches abandoned");
                break;
            }
            self.run_batch(index, &executor, &remote, &dedup, cancel)
                .instrument(info_span!("batch", index))
                .await?;
        }
        Ok(())
    }

    /// Batch boundary. Parks while paused; returns `false` once a stop is requested.
    async fn checkpoint(&self) -> bool {
        loop {
            let woken = self.inner.wake.notified();
            {
                let mut control = self.control();
                if control.stop_requested {
                    return false;
                }
                if !control.pause_requested {
                    return true;
                }
                control.current_batch = None;
                if let Some(run) = control.run.as_mut().filter(|run| run.status != RunStatus::Paused) {
                    run.status = RunStatus::Paused;
                    self.inner.status_tx.send_replace(RunStatus::Paused);
                    info!("run paused between batches");
                }
            }
            woken.await;
        }
    }

    async fn run_batch(
        &self,
        index: usize,
        executor: &SiteTaskExecutor,
        remote: &RemoteSync,
        dedup: &Mutex<DedupEngine>,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let site_keys = {
            let mut control = self.control();
            control.current_batch = Some(index);
            control.run.as_mut().map(|run| {
                let batch = &mut run.batches[index];
                batch.status = BatchStatus::Running;
                batch.site_keys.clone()
            })
        }
        .unwrap_or_default();
        let sites = site_keys
            .iter()
            .filter_map(|key| self.inner.components.registry.get(key).cloned())
            .collect::<Vec<_>>();
        info!(sites = sites.len(), "batch started");

        let mut accepted = self.run_sites(&sites, executor, cancel).await;

        if self.batch_all_failed(&site_keys) && !cancel.is_cancelled() {
            let backoff = self.inner.settings.coordinator.batch_retry_backoff;
            warn!(
                backoff_secs = backoff.as_secs_f64(),
                "every site in the batch failed; retrying the batch once"
            );
            self.with_run(|run| run.batches[index].attempts += 1);
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(backoff) => {}
            }
            if !cancel.is_cancelled() {
                let forgotten = dedup
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .forget(accepted.iter().map(|r| r.fingerprint.as_str()));
                debug!(forgotten, "discarding the failed attempt's records before the retry");
                self.reset_for_retry(&site_keys);
                accepted = self.run_sites(&sites, executor, cancel).await;
            }
        }

        let written = match self.write_local(&accepted).await {
            Ok(written) => written,
            Err(err) => {
                self.with_run(|run| run.batches[index].status = BatchStatus::Failed);
                return Err(err);
            }
        };

        let synced = remote.sync(&accepted, cancel).await;
        {
            let mut control = self.control();
            control.remote_failures.extend(synced.failures.iter().cloned());
            if let Some(run) = control.run.as_mut() {
                run.stats.local_rows_written += written;
                run.stats.remote_uploaded += synced.uploaded;
                run.stats.remote_failed += synced.failed;
                run.stats.remote_skipped += synced.skipped;
            }
        }

        let history = dedup.lock().unwrap_or_else(PoisonError::into_inner).history().clone();
        if let Err(err) = self.inner.components.history.save(&history).await {
            warn!(error = %err, "saving dedup history failed; the next batch retries it");
        }

        let status = self
            .with_run(|run| {
                let any_completed = site_keys
                    .iter()
                    .any(|key| run.task(key).is_some_and(|t| t.status == SiteTaskStatus::Completed));
                let status = if any_completed {
                    BatchStatus::Completed
                } else {
                    BatchStatus::Failed
                };
                run.batches[index].status = status;
                status
            })
            .unwrap_or(BatchStatus::Failed);
        info!(
            status = ?status,
            accepted = accepted.len(),
            rows_written = written,
            uploaded = synced.uploaded,
            remote_failed = synced.failed,
            remote_skipped = synced.skipped,
            "batch finished"
        );
        Ok(())
    }

    async fn run_sites(
        &self,
        sites: &[SiteConfig],
        executor: &SiteTaskExecutor,
        cancel: &CancellationToken,
    ) -> Vec<ListingRecord> {
        let workers = self.inner.settings.coordinator.site_workers.max(1);
        stream::iter(sites.to_vec())
            .map(|site| async move {
                if cancel.is_cancelled() {
                    self.abandon(&site.site_key);
                    return Vec::new();
                }
                self.with_run(|run| {
                    if let Some(task) = run.task_mut(&site.site_key) {
                        task.start(Utc::now());
                    }
                    run.recompute_stats();
                });
                self.inner.active_tasks.fetch_add(1, Ordering::SeqCst);
                let outcome = executor.run(&site, cancel).await;
                self.inner.active_tasks.fetch_sub(1, Ordering::SeqCst);
                self.record_outcome(outcome.task);
                outcome.accepted
            })
            .buffer_unordered(workers)
            .concat()
            .await
    }

    /// Errors accumulate across the attempts of a retried batch; record counters
    /// describe the last attempt only.
    fn record_outcome(&self, mut task: SiteTask) {
        self.with_run(|run| {
            if let Some(slot) = run.task_mut(&task.site_key) {
                task.error_count = task.error_count.saturating_add(slot.error_count);
                *slot = task;
            }
            run.recompute_stats();
        });
    }

    fn reset_for_retry(&self, site_keys: &[String]) {
        self.with_run(|run| {
            for key in site_keys {
                if let Some(slot) = run.task_mut(key) {
                    let mut fresh = SiteTask::new(key.as_str());
                    fresh.error_count = slot.error_count;
                    *slot = fresh;
                }
            }
            run.recompute_stats();
        });
    }

    fn abandon(&self, site_key: &str) {
        self.with_run(|run| {
            if let Some(task) = run.task_mut(site_key) {
                task.fail("cancelled", Utc::now());
            }
            run.recompute_stats();
        });
    }

    fn batch_all_failed(&self, site_keys: &[String]) -> bool {
        self.with_run(|run| {
            !site_keys.is_empty()
                && site_keys
                    .iter()
                    .all(|key| run.task(key).is_some_and(|t| t.status == SiteTaskStatus::Failed))
        })
        .unwrap_or(false)
    }

    async fn write_local(&self, records: &[ListingRecord]) -> Result<u64, PipelineError> {
        if records.is_empty() {
            return Ok(0);
        }
        let config = &self.inner.settings.coordinator;
        let policy = BackoffPolicy::fixed(config.write_attempts.saturating_sub(1), config.write_retry_delay);
        let writer = &self.inner.components.writer;
        let classify = |err: &WriteError| {
            if err.is_contention() {
                RetryDisposition::Retryable
            } else {
                RetryDisposition::NonRetryable
            }
        };

        let done = retry_with_backoff(&policy, classify, |_| writer.upsert(records))
            .await
            .map_err(|exhausted| {
                warn!(
                    attempts = exhausted.attempts,
                    error = %exhausted.last_error,
                    path = %writer.path().display(),
                    "workbook write failed"
                );
                PipelineError::from(exhausted.last_error)
            })?;
        Ok((done.value.inserted + done.value.updated) as u64)
    }

    async fn finish(&self, outcome: Result<(), PipelineError>) {
        let summary = {
            let mut control = self.control();
            let stop_requested = control.stop_requested;
            control.current_batch = None;
            control.pause_requested = false;
            let failures = control.remote_failures.clone();
            let Some(run) = control.run.as_mut() else {
                return;
            };

            let now = Utc::now();
            let status = match &outcome {
                Err(err) => {
                    run.failure = Some(err.to_string());
                    RunStatus::Failed
                }
                Ok(()) if stop_requested => RunStatus::Stopped,
                Ok(()) => RunStatus::Completed,
            };
            let reason = if status == RunStatus::Failed {
                "run aborted"
            } else {
                "cancelled"
            };
            for task in run.tasks.iter_mut().filter(|t| !t.is_terminal()) {
                task.fail(reason, now);
            }
            run.finished_at = Some(now);
            run.recompute_stats();

            let mut summary = RunSummary::from_run(run, &failures);
            summary.status = status;
            summary
        };

        let stats = &summary.stats;
        info!(
            status = %summary.status,
            completed_sites = stats.completed_sites,
            failed_sites = stats.failed_sites,
            accepted = stats.accepted,
            rejected = stats.rejected,
            duplicates = stats.duplicates,
            rows_written = stats.local_rows_written,
            remote_failed = stats.remote_failed,
            elapsed_secs = summary.elapsed_secs,
            "run finished"
        );
        if let Some(root) = &self.inner.settings.coordinator.reports_dir {
            match write_run_reports(root, &summary).await {
                Ok(dir) => debug!(path = %dir.display(), "run report written"),
                Err(err) => warn!(error = %format!("{err:#}"), "writing run report failed"),
            }
        }

        // A new run may start only once the status below is terminal.
        let mut control = self.control();
        if let Some(run) = control.run.as_mut() {
            run.status = summary.status;
        }
        self.inner.status_tx.send_replace(summary.status);
    }
}

/// Mean duration of completed sites times the number still pending.
fn estimate_remaining(run: &ScrapeRun) -> Option<f64> {
    let pending = run.tasks.iter().filter(|t| !t.is_terminal()).count();
    if pending == 0 {
        return Some(0.0);
    }
    let durations = run
        .tasks
        .iter()
        .filter(|t| t.status == SiteTaskStatus::Completed)
        .filter_map(SiteTask::duration_secs)
        .collect::<Vec<_>>();
    if durations.is_empty() {
        return None;
    }
    Some(durations.iter().sum::<f64>() / durations.len() as f64 * pending as f64)
}

fn resident_memory_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kib = line.split_whitespace().nth(1)?.parse::<u64>().ok()?;
    Some(kib * 1024)
}

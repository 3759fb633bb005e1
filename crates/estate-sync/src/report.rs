//! Per-run artifacts under `reports/<run_id>/`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use estate_core::{Batch, RunStatistics, RunStatus, ScrapeRun, SiteTask};
use estate_storage::write_atomic;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::remote::RemoteWriteAttempt;

pub const SUMMARY_FILE: &str = "run_summary.json";
pub const BRIEF_FILE: &str = "run_brief.md";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed_secs: f64,
    pub requested_sites: Vec<String>,
    pub batches: Vec<Batch>,
    pub sites: Vec<SiteTask>,
    pub stats: RunStatistics,
    pub remote_failures: Vec<RemoteWriteAttempt>,
    pub failure: Option<String>,
}

impl RunSummary {
    pub fn from_run(run: &ScrapeRun, remote_failures: &[RemoteWriteAttempt]) -> Self {
        let end = run.finished_at.unwrap_or_else(Utc::now);
        Self {
            run_id: run.id,
            status: run.status,
            started_at: run.started_at,
            finished_at: run.finished_at,
            elapsed_secs: (end - run.started_at).num_milliseconds().max(0) as f64 / 1000.0,
            requested_sites: run.requested_sites.clone(),
            batches: run.batches.clone(),
            sites: run.tasks.clone(),
            stats: run.stats.clone(),
            remote_failures: remote_failures.to_vec(),
            failure: run.failure.clone(),
        }
    }
}

pub fn render_brief(summary: &RunSummary) -> String {
    let stats = &summary.stats;
    let mut lines = vec![
        "# Listing Harvest Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Status: {}", summary.status),
        format!("- Started: {}", summary.started_at),
        format!(
            "- Finished: {}",
            summary
                .finished_at
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".to_string())
        ),
        format!("- Elapsed: {:.1}s", summary.elapsed_secs),
        format!(
            "- Sites: {} completed, {} failed, {} pending",
            stats.completed_sites, stats.failed_sites, stats.pending_sites
        ),
        format!(
            "- Records: {} raw, {} accepted, {} rejected, {} duplicates",
            stats.raw_records, stats.accepted, stats.rejected, stats.duplicates
        ),
        format!("- Workbook rows written: {}", stats.local_rows_written),
        format!(
            "- Remote: {} uploaded, {} failed, {} skipped",
            stats.remote_uploaded, stats.remote_failed, stats.remote_skipped
        ),
    ];
    if let Some(failure) = &summary.failure {
        lines.push(format!("- Failure: {failure}"));
    }

    lines.push(String::new());
    lines.push("## Sites".to_string());
    lines.push(String::new());
    lines.push("| site | status | raw | accepted | rejected | duplicates | errors | note |".to_string());
    lines.push("|---|---|---|---|---|---|---|---|".to_string());
    for task in &summary.sites {
        lines.push(format!(
            "| {} | {:?} | {} | {} | {} | {} | {} | {} |",
            task.site_key,
            task.status,
            task.raw_records,
            task.records_emitted,
            task.rejected,
            task.duplicates,
            task.error_count,
            task.failure_reason.as_deref().unwrap_or("")
        ));
    }

    if !summary.remote_failures.is_empty() {
        lines.push(String::new());
        lines.push("## Remote Failures".to_string());
        lines.push(String::new());
        for attempt in &summary.remote_failures {
            lines.push(format!(
                "- `{}` after {} attempt(s): {}",
                attempt.fingerprint,
                attempt.attempts,
                attempt.last_error.as_deref().unwrap_or("unknown error")
            ));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Write the JSON summary and markdown brief; returns the run's report directory.
pub async fn write_run_reports(reports_root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let dir = reports_root.join(summary.run_id.to_string());
    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    write_atomic(&dir.join(SUMMARY_FILE), &json)
        .await
        .with_context(|| format!("writing {SUMMARY_FILE}"))?;
    write_atomic(&dir.join(BRIEF_FILE), render_brief(summary).as_bytes())
        .await
        .with_context(|| format!("writing {BRIEF_FILE}"))?;
    Ok(dir)
}

pub fn read_run_summary(path: &Path) -> Result<RunSummary> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
}

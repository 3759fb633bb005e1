use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use estate_adapters::{AdapterError, FixtureFetcher, PageFetcher, SiteConfig, SiteRegistry};
use estate_core::{BatchStatus, ProgressSnapshot, RawListing, RunStatus, SiteTaskStatus};
use estate_storage::{BackoffPolicy, DedupHistoryStore, DurableWriter, LockConfig, RateLimitConfig};
use estate_sync::report::{read_run_summary, SUMMARY_FILE};
use estate_sync::{
    ExecutionCoordinator, InMemoryDocumentStore, PipelineComponents, PipelineError, PipelineSettings,
    StartRequest,
};
use serde_json::{json, Value};
use tempfile::TempDir;

/// Fixture pages with a short delay so runs yield between page fetches.
struct Paced(FixtureFetcher);

#[async_trait]
impl PageFetcher for Paced {
    async fn fetch_page(&self, site: &SiteConfig, page: u32) -> Result<Vec<RawListing>, AdapterError> {
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.0.fetch_page(site, page).await
    }

    async fn fetch_detail(&self, site: &SiteConfig, item: &RawListing) -> Result<RawListing, AdapterError> {
        self.0.fetch_detail(site, item).await
    }
}

struct Harness {
    dir: TempDir,
    store: Arc<InMemoryDocumentStore>,
    coordinator: ExecutionCoordinator,
}

impl Harness {
    fn new(site_keys: &[String]) -> Self {
        Self::with_settings(site_keys, |_| {})
    }

    fn with_settings(site_keys: &[String], tune: impl FnOnce(&mut PipelineSettings)) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = SiteRegistry::new(site_keys.iter().map(SiteConfig::fixture).collect()).expect("registry");
        let store = Arc::new(InMemoryDocumentStore::new());

        let mut settings = PipelineSettings::default();
        settings.coordinator.site_workers = 1;
        settings.coordinator.batch_retry_backoff = Duration::from_millis(20);
        settings.coordinator.write_retry_delay = Duration::from_millis(10);
        settings.coordinator.reports_dir = Some(dir.path().join("reports"));
        settings.executor.rate_limit = RateLimitConfig {
            min_delay: Duration::ZERO,
            error_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        };
        settings.remote.backoff = BackoffPolicy::fixed(1, Duration::from_millis(1));
        tune(&mut settings);

        let coordinator = ExecutionCoordinator::new(
            PipelineComponents {
                registry: Arc::new(registry),
                fetcher: Arc::new(Paced(FixtureFetcher::new(dir.path().join("fixtures")))),
                writer: DurableWriter::new(workbook_path(dir.path()), LockConfig::default(), "test-run"),
                history: DedupHistoryStore::new(
                    dir.path().join("data").join("dedup_history.json"),
                    LockConfig::default(),
                    "test-run",
                ),
                store: store.clone(),
            },
            settings,
        );
        Self { dir, store, coordinator }
    }

    fn page(&self, site_key: &str, page: u32, items: Value) {
        let path = self.dir.path().join("fixtures").join(site_key).join(format!("page_{page}.json"));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, serde_json::to_vec(&items).unwrap()).unwrap();
    }

    fn workbook_rows(&self) -> usize {
        DurableWriter::new(workbook_path(self.dir.path()), LockConfig::default(), "reader")
            .read_all()
            .expect("read workbook")
            .len()
    }

    async fn run(&self, request: StartRequest) -> ProgressSnapshot {
        self.coordinator.start(request).expect("start");
        tokio::time::timeout(Duration::from_secs(30), self.coordinator.wait())
            .await
            .expect("run finishes")
    }

    /// Poll until the run has entered its first batch.
    async fn wait_for_batch(&self) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.coordinator.status().current_batch.is_none() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("a batch starts");
    }
}

fn workbook_path(root: &Path) -> std::path::PathBuf {
    root.join("data").join("listings.parquet")
}

fn good(title: &str, price: u64, location: &str) -> Value {
    json!({ "title": title, "price": format!("₦ {price}"), "location": location, "bedrooms": "3" })
}

fn junk(location: &str) -> Value {
    json!({ "title": "", "price": "0", "location": location })
}

fn keys(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("site-{i:02}")).collect()
}

/// Every site gets two good listings at well-separated prices plus one junk row.
fn seed_many(h: &Harness, site_keys: &[String]) {
    for (i, key) in site_keys.iter().enumerate() {
        let price = |k: i32| (10_000_000.0 * 1.25f64.powi(k)).round() as u64;
        h.page(
            key,
            1,
            json!([
                good(&format!("Listing {i} north wing duplex"), price(2 * i as i32), &format!("Estate {i}")),
                junk("Yaba"),
                good(&format!("Listing {i} south wing terrace"), price(2 * i as i32 + 1), &format!("Estate {i}")),
            ]),
        );
    }
}

#[tokio::test]
async fn two_sites_end_to_end() {
    let h = Harness::new(&["A".to_string(), "B".to_string()]);
    let shared = good("Four bedroom semi detached duplex", 85_000_000, "Chevron, Lekki");
    h.page(
        "A",
        1,
        json!([
            good("Three bedroom flat with BQ", 45_000_000, "Ikoyi"),
            junk("Ajah"),
            shared.clone(),
            junk("Surulere"),
            good("Mini flat close to the expressway", 9_000_000, "Gbagada"),
        ]),
    );
    h.page(
        "B",
        1,
        json!([
            good("Five bedroom mansion with pool", 650_000_000, "Banana Island"),
            good("Two bedroom apartment in gated estate", 28_000_000, "Ikeja GRA"),
            shared,
            good("Land for sale, 600 sqm dry land", 150_000_000, "Sangotedo"),
        ]),
    );

    let snap = h
        .run(StartRequest {
            site_keys: Some(vec!["A".into(), "B".into()]),
            quality_threshold: Some(0.4),
            ..Default::default()
        })
        .await;

    assert_eq!(snap.status, RunStatus::Completed);
    assert_eq!(snap.stats.raw_records, 9);
    assert_eq!(snap.stats.accepted, 6);
    assert_eq!(snap.stats.rejected, 2);
    assert_eq!(snap.stats.duplicates, 1);
    assert_eq!(snap.stats.completed_sites, 2);
    assert_eq!(snap.stats.local_rows_written, 6);
    assert_eq!(snap.stats.remote_uploaded, 6);
    assert_eq!(snap.stats.remote_failed, 0);
    assert_eq!(snap.estimated_remaining_secs, Some(0.0));
    assert_eq!(h.workbook_rows(), 6);
    assert_eq!(h.store.len(), 6);

    let summary_path = h
        .dir
        .path()
        .join("reports")
        .join(snap.run_id.unwrap().to_string())
        .join(SUMMARY_FILE);
    let summary = read_run_summary(&summary_path).expect("run summary");
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.stats, snap.stats);
}

#[tokio::test]
async fn rerun_recognizes_listings_from_history() {
    let h = Harness::new(&["A".to_string()]);
    h.page(
        "A",
        1,
        json!([
            good("Three bedroom flat with BQ", 45_000_000, "Ikoyi"),
            good("Mini flat close to the expressway", 9_000_000, "Gbagada"),
        ]),
    );

    let first = h.run(StartRequest::default()).await;
    assert_eq!(first.stats.accepted, 2);

    let second = h.run(StartRequest::default()).await;
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.stats.accepted, 0);
    assert_eq!(second.stats.duplicates, 2);
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(h.workbook_rows(), 2);
    assert_eq!(h.store.len(), 2);
}

#[tokio::test]
async fn pause_and_resume_match_an_uninterrupted_run() {
    let sites = keys(25);

    let baseline = Harness::new(&sites);
    seed_many(&baseline, &sites);
    let expected = baseline.run(StartRequest::default()).await;
    assert_eq!(expected.batches.len(), 3);
    assert_eq!(expected.stats.accepted, 50);

    let h = Harness::new(&sites);
    seed_many(&h, &sites);
    h.coordinator.start(StartRequest::default()).expect("start");
    h.wait_for_batch().await;
    h.coordinator.pause().expect("pause while running");

    let mut rx = h.coordinator.subscribe();
    tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|s| *s == RunStatus::Paused))
        .await
        .expect("pauses")
        .expect("status channel open");
    let paused = h.coordinator.status();
    assert!(paused.paused_at.is_some());
    assert!(paused.batches.iter().all(|b| b.status != BatchStatus::Running));
    assert!(paused.batches.iter().any(|b| b.status == BatchStatus::Completed));
    assert!(paused.batches.iter().any(|b| b.status == BatchStatus::Pending));
    assert!(matches!(
        h.coordinator.pause(),
        Err(PipelineError::InvalidTransition { status: RunStatus::Paused, .. })
    ));

    h.coordinator.resume().expect("resume while paused");
    let done = tokio::time::timeout(Duration::from_secs(30), h.coordinator.wait())
        .await
        .expect("finishes");
    assert_eq!(done.status, RunStatus::Completed);
    assert!(done.resumed_at.is_some());
    assert_eq!(done.stats.accepted, expected.stats.accepted);
    assert_eq!(done.stats.rejected, expected.stats.rejected);
    assert_eq!(done.stats.duplicates, expected.stats.duplicates);
    assert_eq!(h.workbook_rows(), 50);
}

#[tokio::test]
async fn stop_abandons_pending_batches() {
    let sites = keys(25);
    let h = Harness::new(&sites);
    seed_many(&h, &sites);

    h.coordinator.start(StartRequest::default()).expect("start");
    h.wait_for_batch().await;
    h.coordinator.stop().expect("stop while running");
    let snap = tokio::time::timeout(Duration::from_secs(30), h.coordinator.wait())
        .await
        .expect("stops");

    assert_eq!(snap.status, RunStatus::Stopped);
    assert_eq!(snap.batches[2].status, BatchStatus::Pending);
    assert_eq!(snap.stats.pending_sites, 0);
    assert!(snap
        .sites
        .iter()
        .any(|t| t.status == SiteTaskStatus::Failed && t.failure_reason.as_deref() == Some("cancelled")));
    assert_eq!(snap.stats.local_rows_written, snap.stats.accepted);
    assert_eq!(
        snap.stats.remote_uploaded + snap.stats.remote_skipped + snap.stats.remote_failed,
        snap.stats.accepted
    );
    assert_eq!(h.workbook_rows() as u64, snap.stats.accepted);
}

#[tokio::test]
async fn only_one_run_at_a_time() {
    let sites = keys(12);
    let h = Harness::new(&sites);
    seed_many(&h, &sites);

    h.coordinator.start(StartRequest::default()).expect("first start");
    assert!(matches!(
        h.coordinator.start(StartRequest::default()),
        Err(PipelineError::Concurrency(_))
    ));
    let first = tokio::time::timeout(Duration::from_secs(30), h.coordinator.wait())
        .await
        .expect("finishes");
    assert_eq!(first.status, RunStatus::Completed);

    h.coordinator.start(StartRequest::default()).expect("start after completion");
    h.coordinator.wait().await;
}

#[tokio::test]
async fn control_operations_reject_invalid_states() {
    let h = Harness::new(&["A".to_string()]);
    h.page("A", 1, json!([good("Three bedroom flat with BQ", 45_000_000, "Ikoyi")]));

    assert_eq!(h.coordinator.status().status, RunStatus::Idle);
    for result in [h.coordinator.pause(), h.coordinator.resume(), h.coordinator.stop()] {
        assert!(matches!(
            result,
            Err(PipelineError::InvalidTransition { status: RunStatus::Idle, .. })
        ));
    }

    h.coordinator.start(StartRequest::default()).expect("start");
    assert!(matches!(
        h.coordinator.resume(),
        Err(PipelineError::InvalidTransition { action: "resume", .. })
    ));
    let done = h.coordinator.wait().await;
    assert_eq!(done.status, RunStatus::Completed);
    assert!(matches!(
        h.coordinator.pause(),
        Err(PipelineError::InvalidTransition { status: RunStatus::Completed, .. })
    ));

    assert!(matches!(
        h.coordinator.start(StartRequest {
            quality_threshold: Some(2.0),
            ..Default::default()
        }),
        Err(PipelineError::Validation(_))
    ));
}

#[tokio::test]
async fn unknown_subset_falls_back_to_enabled_sites() {
    let h = Harness::new(&["A".to_string(), "B".to_string()]);
    h.page("A", 1, json!([good("Three bedroom flat with BQ", 45_000_000, "Ikoyi")]));
    h.page("B", 1, json!([good("Mini flat close to the expressway", 9_000_000, "Gbagada")]));

    let snap = h
        .run(StartRequest {
            site_keys: Some(vec!["nowhere".into()]),
            ..Default::default()
        })
        .await;
    assert_eq!(snap.sites.len(), 2);
    assert_eq!(snap.stats.accepted, 2);
}

#[tokio::test]
async fn failing_batch_is_retried_exactly_once() {
    let h = Harness::new(&["broken".to_string()]);
    h.page("broken", 1, json!({ "not": "an array" }));
    h.page("broken", 2, json!({ "not": "an array" }));

    let snap = h
        .run(StartRequest {
            max_pages: Some(2),
            ..Default::default()
        })
        .await;
    assert_eq!(snap.status, RunStatus::Completed);
    assert_eq!(snap.batches[0].attempts, 1);
    assert_eq!(snap.batches[0].status, BatchStatus::Failed);
    let task = &snap.sites[0];
    assert_eq!(task.status, SiteTaskStatus::Failed);
    assert_eq!(task.error_count, 4);
    assert_eq!(snap.stats.failed_sites, 1);
}

#[tokio::test]
async fn batch_retry_does_not_count_its_own_records_twice() {
    let h = Harness::with_settings(&["flaky".to_string()], |settings| {
        settings.executor.error_threshold = 2;
    });
    h.page(
        "flaky",
        1,
        json!([
            good("Three bedroom flat with BQ", 45_000_000, "Ikoyi"),
            good("Mini flat close to the expressway", 9_000_000, "Gbagada"),
        ]),
    );
    for page in 2..=5 {
        h.page("flaky", page, json!({ "not": "an array" }));
    }

    let snap = h.run(StartRequest::default()).await;
    assert_eq!(snap.batches[0].attempts, 1);
    assert_eq!(snap.batches[0].status, BatchStatus::Failed);
    let task = &snap.sites[0];
    assert_eq!(task.status, SiteTaskStatus::Failed);
    assert_eq!(task.raw_records, 2);
    assert_eq!(task.records_emitted, 2);
    assert_eq!(task.duplicates, 0);
    assert_eq!(task.error_count, 6);
    assert_eq!(snap.stats.raw_records, 2);
    assert_eq!(snap.stats.accepted, 2);
    assert_eq!(snap.stats.duplicates, 0);
    assert_eq!(snap.stats.local_rows_written, 2);
    assert_eq!(h.workbook_rows(), 2);
    assert_eq!(h.store.len(), 2);
}

#[tokio::test]
async fn fatal_write_keeps_earlier_batches() {
    let sites = keys(25);
    let h = Harness::new(&sites);
    seed_many(&h, &sites);

    h.coordinator.start(StartRequest::default()).expect("start");
    h.wait_for_batch().await;
    h.coordinator.pause().expect("pause while running");
    let mut rx = h.coordinator.subscribe();
    tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|s| *s == RunStatus::Paused))
        .await
        .expect("pauses")
        .expect("status channel open");

    let paused = h.coordinator.status();
    let persisted = paused
        .batches
        .iter()
        .take_while(|b| b.status == BatchStatus::Completed)
        .count();
    assert!(persisted >= 1 && persisted < paused.batches.len());
    let rows_before = h.workbook_rows();
    assert!(rows_before > 0);
    assert_eq!(rows_before as u64, paused.stats.local_rows_written);

    // A directory where the lock file belongs makes every later write fail outright.
    std::fs::create_dir_all(h.dir.path().join("data").join("listings.parquet.lock")).unwrap();
    h.coordinator.resume().expect("resume");
    let done = tokio::time::timeout(Duration::from_secs(30), h.coordinator.wait())
        .await
        .expect("finishes");

    assert_eq!(done.status, RunStatus::Failed);
    assert!(done.failure.as_deref().unwrap().contains("fatal local I/O"));
    for batch in &done.batches[..persisted] {
        assert_eq!(batch.status, BatchStatus::Completed);
    }
    assert_eq!(done.batches[persisted].status, BatchStatus::Failed);
    assert!(done.batches[persisted + 1..]
        .iter()
        .all(|b| b.status == BatchStatus::Pending));
    assert_eq!(done.stats.local_rows_written, rows_before as u64);
    assert_eq!(h.workbook_rows(), rows_before);
}

#[tokio::test]
async fn unwritable_workbook_fails_the_run() {
    let h = Harness::new(&["A".to_string()]);
    h.page("A", 1, json!([good("Three bedroom flat with BQ", 45_000_000, "Ikoyi")]));
    std::fs::create_dir_all(workbook_path(h.dir.path())).unwrap();

    let snap = h.run(StartRequest::default()).await;
    assert_eq!(snap.status, RunStatus::Failed);
    assert!(snap.failure.as_deref().unwrap().contains("fatal local I/O"));
    assert_eq!(snap.stats.remote_uploaded, 0);
    assert_eq!(h.store.len(), 0);
}

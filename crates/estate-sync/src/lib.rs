//! Scrape orchestration and durable-write pipeline.

pub mod coordinator;
pub mod dedup;
pub mod executor;
pub mod planner;
pub mod quality;
pub mod remote;
pub mod report;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use estate_adapters::{FixtureFetcher, HtmlFetcher, RegistryError, RegistryFetcher, SiteRegistry};
use estate_core::{ProgressSnapshot, RunStatus};
use estate_storage::{
    DedupHistoryStore, DurableWriter, HttpClientConfig, HttpFetcher, LockConfig, LockError, RateLimitConfig,
    WriteError,
};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub use coordinator::{CoordinatorConfig, ExecutionCoordinator, PipelineComponents, StartRequest};
pub use dedup::{DedupConfig, DedupEngine, DedupVerdict};
pub use executor::{ExecutorConfig, SiteTaskExecutor, SiteTaskOutcome};
pub use planner::{batch_size_for, BatchPlan, BatchPlanner};
pub use quality::{QualityFilter, QualityWeights, DEFAULT_QUALITY_THRESHOLD};
pub use remote::{
    DocumentStore, InMemoryDocumentStore, PgDocumentStore, RemoteDocument, RemoteSync, RemoteSyncConfig,
    RemoteSyncReport, RemoteWriteAttempt, RemoteWriteError,
};

pub const CRATE_NAME: &str = "estate-sync";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid run parameters: {0}")]
    Validation(String),
    #[error("concurrency conflict: {0}")]
    Concurrency(String),
    #[error("transient fetch failure for {site_key}: {message}")]
    TransientFetch { site_key: String, message: String },
    #[error("site task {site_key} exceeded {timeout_secs}s")]
    TaskTimeout { site_key: String, timeout_secs: u64 },
    #[error("remote write for {fingerprint} failed after {attempts} attempt(s): {message}")]
    RemoteWrite {
        fingerprint: String,
        attempts: usize,
        message: String,
    },
    #[error("fatal local I/O: {0}")]
    FatalLocalIo(String),
    #[error("cannot {action} while the run is {status}")]
    InvalidTransition { action: &'static str, status: RunStatus },
}

impl From<RegistryError> for PipelineError {
    fn from(err: RegistryError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<LockError> for PipelineError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Io { .. } => Self::FatalLocalIo(err.to_string()),
            LockError::Held { .. } | LockError::Unavailable { .. } => Self::Concurrency(err.to_string()),
        }
    }
}

impl From<WriteError> for PipelineError {
    fn from(err: WriteError) -> Self {
        match err {
            WriteError::Lock(lock) => lock.into(),
            WriteError::Io { .. } => Self::FatalLocalIo(err.to_string()),
        }
    }
}

impl From<remote::RemoteWriteAttempt> for PipelineError {
    fn from(attempt: remote::RemoteWriteAttempt) -> Self {
        Self::RemoteWrite {
            fingerprint: attempt.fingerprint,
            attempts: attempt.attempts,
            message: attempt.last_error.unwrap_or_default(),
        }
    }
}

/// Every tunable of one coordinator, grouped by stage.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub executor: ExecutorConfig,
    pub coordinator: CoordinatorConfig,
    pub quality_weights: QualityWeights,
    pub quality_threshold: f64,
    pub dedup: DedupConfig,
    pub remote: RemoteSyncConfig,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig::default(),
            coordinator: CoordinatorConfig::default(),
            quality_weights: QualityWeights::default(),
            quality_threshold: DEFAULT_QUALITY_THRESHOLD,
            dedup: DedupConfig::default(),
            remote: RemoteSyncConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub workspace_root: PathBuf,
    pub data_dir: PathBuf,
    pub database_url: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub lock: LockConfig,
    pub history_retention_days: i64,
    pub settings: PipelineSettings,
}

impl ScrapeConfig {
    /// Defaults rooted at `workspace_root`.
    pub fn for_workspace(workspace_root: impl Into<PathBuf>) -> Self {
        let workspace_root = workspace_root.into();
        let mut settings = PipelineSettings::default();
        settings.coordinator.reports_dir = Some(workspace_root.join("reports"));
        Self {
            data_dir: workspace_root.join("data"),
            workspace_root,
            database_url: None,
            user_agent: "estate-harvester/0.1".to_string(),
            http_timeout_secs: 20,
            lock: LockConfig::default(),
            history_retention_days: estate_storage::history::DEFAULT_RETENTION_DAYS,
            settings,
        }
    }

    pub fn from_env() -> Self {
        let root = std::env::var("ESTATE_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let mut config = Self::for_workspace(root);

        if let Ok(dir) = std::env::var("ESTATE_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        config.database_url = std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty());
        if let Ok(agent) = std::env::var("ESTATE_USER_AGENT") {
            config.user_agent = agent;
        }
        config.http_timeout_secs = env_parse("ESTATE_HTTP_TIMEOUT_SECS").unwrap_or(config.http_timeout_secs);

        let settings = &mut config.settings;
        settings.coordinator.site_workers =
            env_parse("ESTATE_SITE_WORKERS").unwrap_or(settings.coordinator.site_workers);
        settings.executor.detail_workers =
            env_parse("ESTATE_DETAIL_WORKERS").unwrap_or(settings.executor.detail_workers);
        settings.executor.max_pages = env_parse("ESTATE_MAX_PAGES").unwrap_or(settings.executor.max_pages);
        settings.executor.error_threshold =
            env_parse("ESTATE_TASK_ERROR_THRESHOLD").unwrap_or(settings.executor.error_threshold);
        if let Some(secs) = env_parse::<u64>("ESTATE_TASK_TIMEOUT_SECS") {
            settings.executor.task_timeout = Duration::from_secs(secs);
        }
        settings.quality_threshold = env_parse::<f64>("ESTATE_QUALITY_THRESHOLD")
            .filter(|t| (0.0..=1.0).contains(t))
            .unwrap_or(settings.quality_threshold);
        config
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join("sites.yaml")
    }

    pub fn fixtures_dir(&self) -> PathBuf {
        self.workspace_root.join("fixtures")
    }

    pub fn workbook_path(&self) -> PathBuf {
        self.data_dir.join("listings.parquet")
    }

    pub fn history_path(&self) -> PathBuf {
        self.data_dir.join("dedup_history.json")
    }

    pub fn rate_limit(&self) -> RateLimitConfig {
        self.settings.executor.rate_limit
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Identity written into lock files by this process.
pub fn holder_id() -> String {
    format!("estate-{}-{}", std::process::id(), Uuid::new_v4().simple())
}

/// Wire the registry, fetchers, local stores and remote store described by `config`.
pub async fn build_coordinator(config: &ScrapeConfig) -> Result<ExecutionCoordinator> {
    let registry = SiteRegistry::load(config.registry_path())
        .with_context(|| format!("loading {}", config.registry_path().display()))?;

    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?;
    let fetcher = RegistryFetcher::new(
        FixtureFetcher::new(config.fixtures_dir()),
        Some(Arc::new(HtmlFetcher::new(Arc::new(http)))),
    );

    let holder = holder_id();
    let writer = DurableWriter::new(config.workbook_path(), config.lock, holder.clone());
    let history = DedupHistoryStore::new(config.history_path(), config.lock, holder)
        .with_retention_days(config.history_retention_days);

    let store: Arc<dyn DocumentStore> = match config.database_url.as_deref() {
        Some(url) => Arc::new(
            PgDocumentStore::connect(url)
                .await
                .context("connecting to remote document store")?,
        ),
        None => {
            warn!("DATABASE_URL not set; remote sync goes to an in-memory store (dry run)");
            Arc::new(InMemoryDocumentStore::new())
        }
    };

    Ok(ExecutionCoordinator::new(
        PipelineComponents {
            registry: Arc::new(registry),
            fetcher: Arc::new(fetcher),
            writer,
            history,
            store,
        },
        config.settings.clone(),
    ))
}

/// Start one run from environment configuration and wait for it to finish.
pub async fn run_once_from_env(request: StartRequest) -> Result<ProgressSnapshot> {
    let config = ScrapeConfig::from_env();
    let coordinator = build_coordinator(&config).await?;
    let run_id = coordinator.start(request)?;
    info!(%run_id, "run started");
    Ok(coordinator.wait().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn workspace_defaults_resolve_paths() {
        let config = ScrapeConfig::for_workspace("/srv/estate");
        assert_eq!(config.registry_path(), Path::new("/srv/estate/sites.yaml"));
        assert_eq!(config.workbook_path(), Path::new("/srv/estate/data/listings.parquet"));
        assert_eq!(config.history_path(), Path::new("/srv/estate/data/dedup_history.json"));
        assert_eq!(config.settings.quality_threshold, 0.40);
        assert_eq!(config.settings.executor.max_pages, 5);
        assert_eq!(
            config.settings.coordinator.reports_dir.as_deref(),
            Some(Path::new("/srv/estate/reports"))
        );
    }

    #[test]
    fn bundled_registry_plans() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        let config = ScrapeConfig::for_workspace(&root);
        let registry = SiteRegistry::load(config.registry_path()).expect("bundled sites.yaml");
        let plan = BatchPlanner::plan(&registry, None).expect("plan");
        assert_eq!(plan.site_keys(), vec!["propertyhub", "lagos-lettings"]);
    }

    #[test]
    fn lock_contention_maps_to_concurrency_error() {
        let err: PipelineError = LockError::Unavailable {
            path: PathBuf::from("data/listings.parquet.lock"),
            attempts: 9,
            last: "held".into(),
        }
        .into();
        assert!(matches!(err, PipelineError::Concurrency(_)));

        let io: PipelineError = WriteError::Io {
            path: PathBuf::from("data/listings.parquet"),
            cause: anyhow::anyhow!("disk full"),
        }
        .into();
        assert!(matches!(io, PipelineError::FatalLocalIo(msg) if msg.contains("disk full")));
    }
}

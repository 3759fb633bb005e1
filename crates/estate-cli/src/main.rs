use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use estate_adapters::SiteRegistry;
use estate_core::RunStatus;
use estate_storage::DedupHistoryStore;
use estate_sync::{build_coordinator, holder_id, BatchPlanner, ScrapeConfig, StartRequest};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "estate-cli")]
#[command(about = "Property listing harvester")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape, filter, dedup and persist listings, then print the run summary.
    Run(RunArgs),
    /// Print the batch plan without fetching anything.
    Plan {
        #[arg(long, value_delimiter = ',')]
        sites: Option<Vec<String>>,
    },
    /// Summarize the cross-run dedup history.
    History,
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    #[arg(long, value_delimiter = ',')]
    sites: Option<Vec<String>>,
    #[arg(long)]
    max_pages: Option<u32>,
    #[arg(long)]
    enrich: bool,
    #[arg(long)]
    quality_threshold: Option<f64>,
}

impl From<RunArgs> for StartRequest {
    fn from(args: RunArgs) -> Self {
        StartRequest {
            site_keys: args.sites,
            max_pages: args.max_pages,
            enrich_details: args.enrich,
            quality_threshold: args.quality_threshold,
        }
    }
}

/// `RUST_LOG` directives when present and valid, `info` otherwise.
fn log_filter(directives: Option<String>) -> EnvFilter {
    directives
        .filter(|d| !d.trim().is_empty())
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok()))
        .init();

    let cli = Cli::parse();
    let config = ScrapeConfig::from_env();

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run(&config, args.into()).await,
        Commands::Plan { sites } => plan(&config, sites),
        Commands::History => history(&config).await,
    }
}

async fn run(config: &ScrapeConfig, request: StartRequest) -> Result<()> {
    let coordinator = build_coordinator(config).await?;
    let run_id = coordinator.start(request)?;
    info!(%run_id, "run started; ctrl-c stops after in-flight work");

    let snapshot = tokio::select! {
        snapshot = coordinator.wait() => snapshot,
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for ctrl-c")?;
            if let Err(err) = coordinator.stop() {
                warn!(error = %err, "stop request ignored");
            }
            coordinator.wait().await
        }
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&snapshot).context("serializing run summary")?
    );
    if snapshot.status == RunStatus::Failed {
        bail!(
            "run {} failed: {}",
            run_id,
            snapshot.failure.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn plan(config: &ScrapeConfig, sites: Option<Vec<String>>) -> Result<()> {
    let registry = SiteRegistry::load(config.registry_path())?;
    let plan = BatchPlanner::plan(&registry, sites.as_deref())?;
    for key in &plan.dropped {
        println!("dropped: {key}");
    }
    if plan.fell_back_to_enabled {
        println!("no requested site was valid; using every enabled site");
    }
    for batch in &plan.batches {
        println!("batch {} ({} sites): {}", batch.index, batch.site_keys.len(), batch.site_keys.join(", "));
    }
    println!("{} sites in {} batches", plan.site_count(), plan.batches.len());
    Ok(())
}

async fn history(config: &ScrapeConfig) -> Result<()> {
    let store = DedupHistoryStore::new(config.history_path(), config.lock, holder_id())
        .with_retention_days(config.history_retention_days);
    let history = store.load().await?;
    let oldest = history.iter().map(|e| e.last_seen_at).min();
    let newest = history.iter().map(|e| e.last_seen_at).max();
    println!("history: {}", store.path().display());
    println!("fingerprints: {}", history.len());
    if let (Some(oldest), Some(newest)) = (oldest, newest) {
        println!("last seen: {oldest} .. {newest}");
    }
    Ok(())
}

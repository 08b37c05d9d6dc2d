//! Dashboard runner - keeps JSON endpoints refreshed through the offline core.
//!
//! `dashboard run` wires the connectivity monitor, the state store and one
//! refresh scheduler per source together and runs until interrupted.
//! `dashboard status` prints what the last run left on disk.

mod source;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dashboard_core::network::HttpFingerprint;
use dashboard_core::{
    age_display, CallOptions, ConnectivityMonitor, DashboardConfig, FixedInterval, HttpClient,
    HttpProbe, JsonFileStorage, NetworkStateStore, RefreshScheduler, RetryPolicy, VersionWatcher,
};
use source::{JsonEndpoint, SourceSpec};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "dashboard")]
#[command(about = "Offline-resilient refresh runner for dashboard data sources")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Refresh sources until interrupted
    Run {
        /// Source as name=url[@seconds] (repeatable)
        #[arg(
            short,
            long = "source",
            value_parser = source::parse_source_spec,
            required = true
        )]
        sources: Vec<SourceSpec>,

        /// Directory for the persisted state (defaults to DASHBOARD_STATE_DIR
        /// or the platform data directory)
        #[arg(long)]
        state_dir: Option<PathBuf>,

        /// Enable debug logging
        #[arg(short, long)]
        debug: bool,
    },
    /// Print the persisted network state
    Status {
        /// Directory holding the persisted state
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Run {
            sources,
            state_dir,
            debug,
        } => {
            init_logging(debug);
            run(sources, load_config(state_dir)).await
        }
        Command::Status { state_dir } => {
            init_logging(false);
            print_status(&load_config(state_dir))
        }
    }
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();
}

fn load_config(state_dir: Option<PathBuf>) -> DashboardConfig {
    let mut config = DashboardConfig::from_env();
    if state_dir.is_some() {
        config.state_dir = state_dir;
    }
    config
}

async fn run(sources: Vec<SourceSpec>, config: DashboardConfig) -> Result<()> {
    info!("Starting dashboard runner with {} source(s)", sources.len());

    let state_dir = config.resolve_state_dir();
    info!("State directory: {}", state_dir.display());
    let store = NetworkStateStore::builder()
        .storage(Arc::new(JsonFileStorage::new(&state_dir)))
        .build();

    let probe = HttpProbe::from_config(&config).context("Failed to create connectivity probe")?;
    let monitor = ConnectivityMonitor::from_config(Arc::new(probe), store.clone(), &config);
    monitor.start(|verdict| info!(%verdict, "Connectivity verdict"));

    let watcher = match &config.version_url {
        Some(url) => {
            let fingerprint =
                HttpFingerprint::new(url.clone()).context("Failed to create version watcher")?;
            let watcher = VersionWatcher::new(Arc::new(fingerprint), config.version_check_interval);
            watcher.start(|previous, current| {
                warn!(%previous, %current, "New build deployed, restart to pick it up");
            });
            Some(watcher)
        }
        None => None,
    };

    let http = HttpClient::new(store.clone())
        .context("Failed to create HTTP client")?
        .with_retry_policy(
            RetryPolicy::new()
                .with_max_retries(config.retry_attempts)
                .with_base_delay(config.retry_delay),
        );
    let http = Arc::new(http);
    let options = CallOptions::from_config(&config);

    let schedulers: Vec<_> = sources
        .iter()
        .map(|spec| {
            let endpoint = JsonEndpoint::new(spec, http.clone(), store.clone(), options.clone());
            let scheduler = RefreshScheduler::new(
                Arc::new(endpoint),
                Arc::new(FixedInterval(spec.interval)),
                store.clone(),
            );
            scheduler.attach();
            scheduler.start();
            info!(source = %spec.name, interval = ?spec.interval, "Scheduled {}", spec.url);
            scheduler
        })
        .collect();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping");

    monitor.stop();
    if let Some(watcher) = watcher {
        watcher.stop();
    }
    for scheduler in &schedulers {
        scheduler.detach();
    }
    if let Err(e) = store.flush() {
        warn!("Failed to save network state: {}", e);
    }

    info!(status = %store.status(), "Stopped");
    Ok(())
}

fn print_status(config: &DashboardConfig) -> Result<()> {
    let storage = JsonFileStorage::new(config.resolve_state_dir());
    if !storage.path().exists() {
        println!("No saved state at {}", storage.path().display());
        return Ok(());
    }

    let store = NetworkStateStore::builder()
        .storage(Arc::new(storage.clone()))
        .build();
    let snapshot = store.snapshot();
    let now = store.now();

    println!("{}", snapshot.status);
    println!("State file:      {}", storage.path().display());
    println!(
        "Last online:     {} ({})",
        snapshot.last_online_time.to_rfc3339(),
        age_display(snapshot.last_online_time, now)
    );
    println!(
        "Last update:     {} ({})",
        snapshot.last_update_time.to_rfc3339(),
        age_display(snapshot.last_update_time, now)
    );
    println!("Network errors:  {}", snapshot.network_error_count);
    println!("Cached entries:  {}", snapshot.cached_data_count);

    for (key, written) in store.cached_entries() {
        println!("  {:<32} {}", key, age_display(written, now));
    }
    let stale = snapshot.total_entry_count - snapshot.cached_data_count;
    if stale > 0 {
        println!("  ({} entries marked stale)", stale);
    }

    Ok(())
}

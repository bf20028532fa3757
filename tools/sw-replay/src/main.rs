//! Lifecycle replay harness for the Crossroad Navigator offline cache.
//!
//! Drives the gatekeeper through install, activate and a series of fetches
//! against the live network, optionally persisting caches between runs.
//!
//! ## Usage
//!
//! ```bash
//! # Install, activate, then load two resources through the worker
//! sw-replay run --snapshot caches.json index.html https://placehold.co/600x400
//!
//! # Print the effective configuration
//! sw-replay config --config gatekeeper.json
//!
//! # List what a snapshot holds
//! sw-replay inspect caches.json --cache crossroad-navigator-cache-v1
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use crossroad_common::{init_logging, CrossroadError, LogConfig, LogFormat, OptionExt};
use crossroad_net::{HttpFetcher, LoaderConfig, Request};
use crossroad_sw::{
    CacheGatekeeper, CacheStorage, GatekeeperConfig, ServiceWorkerHost, ServiceWorkerState,
};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "sw-replay")]
#[command(about = "Replay the Crossroad Navigator worker lifecycle")]
struct Cli {
    /// Log format: pretty, compact or json
    #[arg(long, default_value = "pretty", global = true)]
    log_format: String,

    /// Verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install and activate the worker, then fetch each URL through it
    Run {
        /// JSON gatekeeper config (defaults built in)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Cache snapshot to load before and save after the run
        #[arg(short, long)]
        snapshot: Option<PathBuf>,
        /// URLs to fetch, absolute or relative to the scope
        urls: Vec<String>,
    },

    /// Print the effective configuration and its resolved cache manifest
    Config {
        /// JSON gatekeeper config (defaults built in)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// List the caches stored in a snapshot
    Inspect {
        /// Snapshot file
        snapshot: PathBuf,
        /// Only list the entries of this cache
        #[arg(long)]
        cache: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format: LogFormat = cli.log_format.parse()?;
    let log_config = if cli.verbose {
        LogConfig::debug()
    } else {
        LogConfig::default()
    };
    init_logging(log_config.with_format(format))?;

    match cli.command {
        Commands::Run {
            config,
            snapshot,
            urls,
        } => run(config.as_deref(), snapshot.as_deref(), &urls).await,
        Commands::Config { config } => show_config(config.as_deref()).await,
        Commands::Inspect { snapshot, cache } => inspect(&snapshot, cache.as_deref()).await,
    }
}

async fn load_config(path: Option<&Path>) -> crossroad_common::Result<GatekeeperConfig> {
    match path {
        Some(path) => GatekeeperConfig::from_file(path).await,
        None => Ok(GatekeeperConfig::default()),
    }
}

/// Outcome of one replayed fetch.
#[derive(Debug, Serialize)]
struct FetchRecord {
    url: String,
    cached_before: bool,
    cached_after: bool,
    status: u16,
    response_type: &'static str,
    body_len: usize,
}

#[derive(Debug, Serialize)]
struct ReplayReport {
    cache_name: String,
    installed: bool,
    install_error: Option<String>,
    active_state: Option<ServiceWorkerState>,
    caches: Vec<String>,
    fetches: Vec<FetchRecord>,
}

async fn run(config: Option<&Path>, snapshot: Option<&Path>, urls: &[String]) -> anyhow::Result<()> {
    let manifest = load_config(config).await?.resolve()?;

    let caches = match snapshot {
        Some(path) if path.exists() => Arc::new(
            CacheStorage::load(path)
                .await
                .map_err(|e| CrossroadError::cache_with_source("failed to load snapshot", e))?,
        ),
        _ => Arc::new(CacheStorage::new()),
    };

    let fetcher = Arc::new(
        HttpFetcher::new(LoaderConfig::default(), &manifest.scope)
            .map_err(|e| CrossroadError::network_with_source("failed to build HTTP client", e))?,
    );

    let scope = manifest.scope.clone();
    let cache_name = manifest.cache_name.clone();
    let gatekeeper = Arc::new(CacheGatekeeper::new(
        manifest,
        Arc::clone(&caches),
        fetcher.clone(),
    ));
    let (host, _events) = ServiceWorkerHost::new(scope.clone(), fetcher);

    let script_url = scope.join("sw.js")?;
    let install_error = match host.install(script_url, gatekeeper).await {
        Ok(_) => {
            host.activate().await?;
            None
        }
        Err(err) => {
            warn!(error = %err, "Install failed, fetching uncontrolled");
            Some(err.to_string())
        }
    };

    let current = caches.open(&cache_name).await;
    let mut fetches = Vec::with_capacity(urls.len());
    for raw in urls {
        let url = scope
            .join(raw)
            .with_context(|| format!("'{raw}' is not a valid URL"))?;
        let request = Request::get(url.clone());

        let cached_before = current.match_request(&request).await.is_some();
        let response = host.dispatch_fetch(request.clone()).await;
        let cached_after = current.match_request(&request).await.is_some();

        info!(url = %url, status = response.status(), cached_before, "Replayed fetch");
        fetches.push(FetchRecord {
            url: url.to_string(),
            cached_before,
            cached_after,
            status: response.status(),
            response_type: response.response_type().as_str(),
            body_len: response.raw_body().len(),
        });
    }

    if let Some(path) = snapshot {
        caches
            .save(path)
            .await
            .map_err(|e| CrossroadError::cache_with_source("failed to save snapshot", e))?;
    }

    let report = ReplayReport {
        cache_name,
        installed: install_error.is_none(),
        install_error,
        active_state: host.active_state().await,
        caches: caches.keys().await,
        fetches,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.installed {
        std::process::exit(1);
    }
    Ok(())
}

async fn show_config(config: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config).await?;
    let manifest = config.resolve()?;

    println!("{}", serde_json::to_string_pretty(&config)?);
    println!("cache:       {}", manifest.cache_name);
    println!("scope:       {}", manifest.scope);
    for url in &manifest.required {
        println!("required:    {url}");
    }
    for url in &manifest.best_effort {
        println!("best-effort: {url}");
    }
    Ok(())
}

async fn inspect(snapshot: &Path, cache: Option<&str>) -> anyhow::Result<()> {
    let storage = CacheStorage::load(snapshot)
        .await
        .map_err(|e| CrossroadError::cache_with_source("failed to load snapshot", e))?;
    let names = storage.keys().await;

    let names = match cache {
        Some(name) => vec![names
            .into_iter()
            .find(|n| n == name)
            .ok_or_not_found(format!("cache '{name}'"))?],
        None => names,
    };

    for name in names {
        let cache = storage.open(&name).await;
        let mut keys = cache.keys().await;
        keys.sort();
        println!("{name} ({} entries)", keys.len());
        for key in keys {
            println!("  {key}");
        }
    }
    Ok(())
}

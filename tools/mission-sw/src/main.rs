//! Operator CLI for the mission report offline cache.
//!
//! Drives the cache manager against the configured origin with the durable
//! on-disk store, so a generation installed by one run is served by the next.
//!
//! ## Usage
//!
//! ```bash
//! # Preload the critical assets and promote the generation
//! mission-sw --config site.json register
//!
//! # Replay requests through the cache with the network unplugged
//! mission-sw fetch / /testimony/4.html --navigate --offline
//!
//! # Inspect what is stored
//! mission-sw caches
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mission_common::{init_logging, LogFormat};
use mission_core::SiteConfig;
use mission_net::{Fetcher, HttpFetcher, OfflineFetcher, Request};
use mission_sw::{
    CacheConfig, FetchDecision, FileCacheStorage, OfflineCacheManager, ServiceWorkerEvent,
    ServiceWorkerRegistration, SwError,
};
use serde::Serialize;
use tracing::{info, warn};
use url::Url;

#[derive(Parser)]
#[command(name = "mission-sw")]
#[command(about = "Offline cache manager for the mission report site")]
struct Cli {
    /// Site config file (JSON); defaults are used when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log format: pretty, compact or json
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Preload the critical assets into the current generation
    Install,

    /// Promote an installed generation and delete stale ones
    Activate,

    /// Install (retrying failed preloads) then activate
    Register,

    /// Send requests through the active cache manager
    Fetch {
        /// Site paths to request
        #[arg(required = true)]
        paths: Vec<String>,
        /// Treat the requests as page navigations
        #[arg(long)]
        navigate: bool,
        /// Fail every network fetch
        #[arg(long)]
        offline: bool,
    },

    /// List cache generations and the current generation's entries
    Caches,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = SiteConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load site config")?;

    let mut log = config.log_config();
    if let Some(format) = cli.log_format {
        log = log.with_format(format);
    }
    init_logging(log);

    run(cli.command, &config).await
}

async fn run(command: Commands, config: &SiteConfig) -> Result<()> {
    match command {
        Commands::Install => {
            let manager = open_manager(config, false).await?;
            manager.install().await?;
            print_json(&serde_json::json!({
                "version": manager.config().version,
                "state": manager.state().await,
                "entries": manager.cached_keys().await?.len(),
            }))
        }

        Commands::Activate => {
            let manager = open_manager(config, true).await?;
            manager
                .adopt()
                .await
                .context("No installed generation; run `mission-sw install` first")?;
            let report = manager.activate().await?;
            print_json(&serde_json::json!({
                "version": manager.config().version,
                "state": manager.state().await,
                "deleted": report.deleted,
                "failed": report.failed,
            }))
        }

        Commands::Register => {
            let manager = Arc::new(open_manager(config, false).await?);
            let script_url = config.script_url()?;
            let (registration, mut events) =
                ServiceWorkerRegistration::new(manager, script_url, None)?;

            let result = registration.start(&config.install_retry).await;
            while let Ok(event) = events.try_recv() {
                log_event(&event);
            }
            result?;

            print_json(&serde_json::json!({
                "scope": registration.scope().as_str(),
                "script": registration.script_url().as_str(),
                "state": registration.manager().state().await,
            }))
        }

        Commands::Fetch {
            paths,
            navigate,
            offline,
        } => {
            let manager = open_manager(config, offline).await?;
            manager
                .resume()
                .await
                .context("No active generation; run `mission-sw register` first")?;

            for path in &paths {
                let url = config
                    .origin
                    .join(path)
                    .with_context(|| format!("Invalid path '{path}'"))?;
                let request = if navigate {
                    Request::navigate(url)
                } else {
                    Request::get(url)
                };

                let summary = FetchSummary::new(path, manager.handle_request(&request).await);
                print_json(&summary)?;
            }

            manager.settle().await;
            Ok(())
        }

        Commands::Caches => {
            let manager = open_manager(config, true).await?;
            let generations = manager.generations().await?;
            let version = &manager.config().version;

            let entries: Vec<String> = if generations.contains(version) {
                manager
                    .cached_keys()
                    .await?
                    .iter()
                    .map(ToString::to_string)
                    .collect()
            } else {
                Vec::new()
            };

            print_json(&serde_json::json!({
                "current": version,
                "directory": config.storage_dir.display().to_string(),
                "generations": generations,
                "entries": entries,
            }))
        }
    }
}

/// Build a manager over the durable store in `config.storage_dir`.
async fn open_manager(config: &SiteConfig, offline: bool) -> Result<OfflineCacheManager> {
    let storage = FileCacheStorage::new(config.storage_dir.clone())
        .await
        .with_context(|| {
            format!(
                "Failed to open cache store at {}",
                config.storage_dir.display()
            )
        })?;

    let fetcher: Arc<dyn Fetcher> = if offline {
        Arc::new(OfflineFetcher)
    } else {
        Arc::new(HttpFetcher::new(config.loader_config())?)
    };

    Ok(OfflineCacheManager::new(
        cache_config(config),
        Arc::new(storage),
        fetcher,
    ))
}

fn cache_config(config: &SiteConfig) -> CacheConfig {
    CacheConfig::new(config.origin.clone(), config.cache.version.clone())
        .with_critical_assets(config.cache.critical_assets.iter().cloned())
        .with_fallback_document(config.cache.fallback_document.clone())
}

fn log_event(event: &ServiceWorkerEvent) {
    match event {
        ServiceWorkerEvent::StateChange { scope, state } => {
            info!(scope = %scope, state = state.as_str(), "State change");
        }
        ServiceWorkerEvent::InstallFailed { scope, error } => {
            warn!(scope = %scope, error = %error, "Install failed");
        }
        ServiceWorkerEvent::CachesDeleted { scope, names } => {
            info!(scope = %scope, caches = ?names, "Deleted stale caches");
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

/// One line of `fetch` output.
#[derive(Debug, Serialize, PartialEq)]
struct FetchSummary {
    path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<Url>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<u16>,
    source: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl FetchSummary {
    fn new(path: &str, result: Result<FetchDecision, SwError>) -> Self {
        let mut summary = Self {
            path: path.to_string(),
            url: None,
            status: None,
            source: "passthrough",
            bytes: None,
            error: None,
        };

        match result {
            Ok(FetchDecision::Respond { response, source }) => {
                summary.url = Some(response.url);
                summary.status = Some(response.status.as_u16());
                summary.source = source.as_str();
                summary.bytes = Some(response.body.len());
            }
            Ok(FetchDecision::Passthrough) => {}
            Err(e) => {
                summary.source = "error";
                summary.error = Some(e.to_string());
            }
        }
        summary
    }
}

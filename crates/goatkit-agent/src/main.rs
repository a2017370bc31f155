//! `goatkit`: drive the GOAT KIDS cache agent from the command line.
//!
//! ## Usage
//!
//! ```bash
//! # Write a default configuration
//! goatkit init-config
//!
//! # Install the agent against the live site and persist the store
//! goatkit install
//!
//! # Dispatch requests through the installed agent, with the network down
//! goatkit fetch ./ ./index.html ./missing.png --offline
//!
//! # List stores and their entries
//! goatkit caches
//!
//! # Trace only the cache layer
//! goatkit fetch ./index.html --log-filter goatkit_sw=trace
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info, Level};
use url::Url;

use goatkit_agent::{AgentConfig, CacheAgent};
use goatkit_common::{init_logging, LogConfig, LogFormat};
use goatkit_net::{Fetcher, HttpFetcher, OfflineFetcher, Origin, Request};
use goatkit_sw::{CacheStorage, ServiceWorkerContainer};

const SCRIPT: &str = "sw.js";

#[derive(Parser)]
#[command(name = "goatkit")]
#[command(version, about = "Offline asset cache for the GOAT KIDS web app")]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = "goatkit.json")]
    config: PathBuf,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format (pretty, compact, json)
    #[arg(long, global = true, default_value = "pretty")]
    log_format: LogFormat,

    /// Filter directives (e.g. "goatkit_sw=trace"), overriding RUST_LOG
    #[arg(long, global = true)]
    log_filter: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a configuration file with default values
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Install the agent: fetch the seed list and persist the store
    Install,

    /// Dispatch requests through the installed agent
    Fetch {
        /// URLs or paths relative to the scope
        #[arg(required = true)]
        targets: Vec<String>,
        /// Simulate a network that is down
        #[arg(long)]
        offline: bool,
        /// Send the requests as document navigations
        #[arg(long)]
        navigate: bool,
    },

    /// List stores and their entries
    Caches,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::debug()
    } else if cli.log_format == LogFormat::Json {
        LogConfig::production()
    } else {
        LogConfig {
            level: Level::WARN,
            ..LogConfig::default()
        }
    };
    let mut log_config = log_config.with_format(cli.log_format);
    if let Some(filter) = &cli.log_filter {
        log_config = log_config.with_filter(filter.as_str());
    }
    init_logging(log_config).context("Failed to initialize logging")?;

    match cli.command {
        Commands::InitConfig { force } => init_config(&cli.config, force),
        Commands::Install => {
            let config = load_config(&cli.config)?;
            install(&config).await
        }
        Commands::Fetch {
            targets,
            offline,
            navigate,
        } => {
            let config = load_config(&cli.config)?;
            fetch(&config, &targets, offline, navigate).await
        }
        Commands::Caches => {
            let config = load_config(&cli.config)?;
            list_caches(&config).await
        }
    }
}

fn load_config(path: &Path) -> Result<AgentConfig> {
    AgentConfig::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    AgentConfig::default()
        .save(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Configuration written to: {}", path.display());
    Ok(())
}

fn network(config: &AgentConfig, scope: &Url, offline: bool) -> Result<Arc<dyn Fetcher>> {
    if offline {
        return Ok(Arc::new(OfflineFetcher));
    }
    let fetcher = HttpFetcher::new(config.loader_config())
        .context("Failed to create HTTP client")?
        .with_origin(Origin::from_url(scope));
    Ok(Arc::new(fetcher))
}

async fn load_storage(config: &AgentConfig) -> Result<CacheStorage> {
    CacheStorage::load(&config.store_path)
        .await
        .with_context(|| format!("Failed to load {}", config.store_path.display()))
}

async fn save_storage(config: &AgentConfig, storage: &CacheStorage) -> Result<()> {
    storage
        .save(&config.store_path)
        .await
        .with_context(|| format!("Failed to save {}", config.store_path.display()))
}

async fn install(config: &AgentConfig) -> Result<()> {
    let scope = config.scope_url()?;
    let storage = load_storage(config).await?;
    let (container, _events) =
        ServiceWorkerContainer::new(scope.clone(), storage.clone(), network(config, &scope, false)?)?;

    let worker = container
        .register(SCRIPT, Arc::new(CacheAgent::new(config.clone())))
        .await
        .context("Install failed")?;
    container.settle().await;
    save_storage(config, &storage).await?;

    info!(worker = %worker, "Agent installed");
    println!("Installed {} for {}", worker, scope);
    print_caches(&storage).await?;
    Ok(())
}

async fn fetch(config: &AgentConfig, targets: &[String], offline: bool, navigate: bool) -> Result<()> {
    let scope = config.scope_url()?;
    let storage = load_storage(config).await?;
    let (container, _events) =
        ServiceWorkerContainer::new(scope.clone(), storage.clone(), network(config, &scope, offline)?)?;

    let agent = Arc::new(CacheAgent::new(config.clone()));
    if storage.has(&config.cache_name).await {
        container.resume(SCRIPT, agent).await?;
    } else {
        debug!(cache = %config.cache_name, "No store yet, installing first");
        container.register(SCRIPT, agent).await?;
    }
    let page = container.open_client(scope.as_str()).await?;

    for target in targets {
        let url = scope
            .join(target)
            .with_context(|| format!("Invalid target {}", target))?;
        let request = if navigate {
            Request::navigate(url.clone())
        } else {
            Request::get(url.clone())
        };

        match container.dispatch_fetch(request, Some(page.id)).await {
            Ok(response) => {
                let content_type = response
                    .content_type()
                    .map(|m| m.essence_str().to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{} {} {} {} {} bytes",
                    url,
                    response.status.as_u16(),
                    response.response_type,
                    content_type,
                    response.body_len()
                );
            }
            Err(e) => println!("{} failed: {}", url, e),
        }
    }

    container.settle().await;
    if !offline {
        save_storage(config, &storage).await?;
    }
    Ok(())
}

async fn list_caches(config: &AgentConfig) -> Result<()> {
    let storage = load_storage(config).await?;
    print_caches(&storage).await
}

async fn print_caches(storage: &CacheStorage) -> Result<()> {
    let names = storage.keys().await;
    if names.is_empty() {
        println!("No caches");
        return Ok(());
    }
    for name in names {
        let cache = storage.open(&name).await?;
        let keys = cache.keys().await;
        println!("{} ({} entries)", name, keys.len());
        for key in keys {
            println!("  {}", key);
        }
    }
    Ok(())
}

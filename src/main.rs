mod cache;
mod config;
mod event;
mod fetch;
mod server;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::cache::{CacheStorage, MemoryStorage, SqliteStorage};
use crate::config::{Config, StorageBackend};
use crate::event::{EventHandler, WorkerFactory};
use crate::fetch::{Fetcher, HttpFetcher};
use crate::worker::{OfflineWorker, Registration};

#[derive(Parser, Debug)]
#[command(name = "navcache")]
#[command(about = "An offline-first caching proxy with navigation fallback")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/navcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Upstream origin to proxy, overriding the config file
  #[arg(short, long)]
  upstream: Option<String>,

  /// Address to listen on, overriding the config file
  #[arg(short, long)]
  listen: Option<String>,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache, then run the proxy (default)
  Serve,
  /// Fetch the precache list into the cache once and exit
  Precache,
  /// Inspect the cache
  Cache {
    #[command(subcommand)]
    action: CacheCommand,
  },
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  /// List cached URLs
  List,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref(), args.upstream.as_deref())?;
  if let Some(listen) = args.listen.clone() {
    config.listen = listen;
  }

  let _log_guard = init_tracing(&config)?;
  let storage = open_storage(&config)?;

  match args.command.unwrap_or(Command::Serve) {
    Command::Serve => serve(config, args.config, args.upstream, storage).await,
    Command::Precache => {
      let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new()?);
      let worker = OfflineWorker::from_config(&config, storage, fetcher)?;
      let count = worker.install().await?;
      println!("Precached {} entries into '{}'", count, config.cache.name);
      Ok(())
    }
    Command::Cache {
      action: CacheCommand::List,
    } => {
      for entry in storage.entries(&config.cache.name)? {
        println!(
          "{}  {}  {}",
          entry.status,
          entry.cached_at.format("%Y-%m-%d %H:%M:%S"),
          entry.url
        );
      }
      Ok(())
    }
  }
}

async fn serve(
  config: Config,
  config_path: Option<PathBuf>,
  upstream: Option<String>,
  storage: Arc<dyn CacheStorage>,
) -> Result<()> {
  let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new()?);
  let registration = Registration::new();

  // Nothing is proxied until the first version has installed
  let worker = OfflineWorker::from_config(&config, Arc::clone(&storage), Arc::clone(&fetcher))?;
  registration
    .install(worker)
    .await
    .map_err(|e| eyre!("Initial install failed: {}", e))?;

  // Updates re-read the same config sources the process started with
  let factory: WorkerFactory = Arc::new(move || -> Result<OfflineWorker> {
    let config = Config::load(config_path.as_deref(), upstream.as_deref())?;
    OfflineWorker::from_config(&config, Arc::clone(&storage), Arc::clone(&fetcher))
  });
  let events = EventHandler::spawn(registration.clone(), factory);

  info!(upstream = %config.upstream, cache = %config.cache.name, "starting proxy");
  server::run(&config.listen, registration, events).await
}

fn open_storage(config: &Config) -> Result<Arc<dyn CacheStorage>> {
  Ok(match config.storage.backend {
    StorageBackend::Sqlite => Arc::new(SqliteStorage::open(config.storage.path.as_deref())?),
    StorageBackend::Memory => Arc::new(MemoryStorage::new()),
  })
}

/// Log to stderr, and to a daily file when a log directory is configured.
fn init_tracing(config: &Config) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  let (file_layer, guard) = match &config.log.directory {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "navcache.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      (
        Some(fmt::layer().with_ansi(false).with_writer(writer)),
        Some(guard),
      )
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(std::io::stderr))
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

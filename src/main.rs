mod cache;
mod config;
mod message;
mod net;
mod registration;
mod update;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use cache::{CacheStorage, SqliteStorage};
use config::Config;
use net::{Destination, HttpNetwork, Network, OfflineNetwork, Request};
use registration::Registration;
use update::{PageReload, UpdateCheck, UpdateFlow, UpdateNotice, UpdatePrompt};

#[derive(Parser, Debug)]
#[command(name = "offline-shell")]
#[command(about = "Offline app-shell cache: precache, route and inspect cache generations")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offline-shell/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Write logs to this file instead of stderr
  #[arg(long, global = true)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install the configured version and activate it
  Install {
    /// Activate a waiting update without asking
    #[arg(short, long)]
    yes: bool,
  },
  /// Fetch a path through the active worker
  Fetch {
    /// Path or absolute URL
    path: String,
    /// Treat as a full-page navigation
    #[arg(long)]
    navigate: bool,
    #[arg(long, default_value = "empty")]
    destination: Destination,
    #[arg(long, default_value = "GET")]
    method: String,
    /// Simulate a lost connection
    #[arg(long)]
    offline: bool,
    /// Write the body here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// Check for a new version and install it
  Check,
  /// List cache generations
  Generations,
  /// List entries of the configured generation
  Entries,
  /// Delete every cache generation
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_tracing(args.log_file.as_deref())?;

  let config = Config::load(args.config.as_deref())?;
  let storage: Arc<dyn CacheStorage> = Arc::new(SqliteStorage::open(
    &config.database_path()?,
    config.cache.max_entry_bytes,
  )?);

  match args.command {
    Command::Install { yes } => install(&config, storage, yes).await,
    Command::Check => check(&config, storage).await,
    Command::Fetch {
      path,
      navigate,
      destination,
      method,
      offline,
      output,
    } => {
      let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;
      let url = config
        .origin
        .join(&path)
        .map_err(|e| eyre!("Invalid path '{}': {}", path, e))?;
      let request = if navigate {
        Request::navigate(url)
      } else {
        Request::get(url).with_destination(destination)
      }
      .with_method(method);

      fetch(&config, storage, network(offline)?, request, output.as_deref()).await
    }
    Command::Generations => {
      for name in storage.generation_names()? {
        let marker = if name == config.cache.version { "*" } else { " " };
        println!("{} {} ({} entries)", marker, name, storage.entries(&name)?.len());
      }
      Ok(())
    }
    Command::Entries => {
      for entry in storage.entries(&config.cache.version)? {
        println!(
          "{} {:>8} {} {} {}",
          entry.status,
          entry.body.len(),
          &entry.digest()[..12],
          entry.cached_at.format("%Y-%m-%d %H:%M:%S"),
          entry.url
        );
      }
      Ok(())
    }
    Command::Clear => {
      let registration = Registration::new(storage, network(true)?);
      let removed = update::reset_for_development(&registration)?;
      println!("Deleted {} cache generation(s)", removed.len());
      Ok(())
    }
  }
}

fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  match log_file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
      let file_name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;

      let appender = tracing_appender::rolling::never(dir, file_name);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
      Ok(None)
    }
  }
}

fn network(offline: bool) -> Result<Arc<dyn Network>> {
  if offline {
    Ok(Arc::new(OfflineNetwork))
  } else {
    Ok(Arc::new(HttpNetwork::new()?))
  }
}

/// Prints update offers and optionally accepts them.
struct ConsolePrompt {
  accept: bool,
}

impl UpdatePrompt for ConsolePrompt {
  fn update_available(&self, notice: UpdateNotice) {
    println!("Update available (worker {})", notice.worker());
    if !self.accept {
      println!("Run again with --yes to activate it now");
      return;
    }
    if let Err(e) = notice.accept() {
      warn!(error = %e, "could not activate update");
    }
  }
}

struct ConsoleReload;

impl PageReload for ConsoleReload {
  fn reload(&self) {
    println!("New version active, pages should reload");
  }
}

async fn install(config: &Config, storage: Arc<dyn CacheStorage>, accept: bool) -> Result<()> {
  let registration = Registration::new(storage, network(false)?);
  if !update::should_register(config.environment) {
    let removed = update::reset_for_development(&registration)?;
    warn!(removed = removed.len(), "development environment, worker registration disabled");
    return Ok(());
  }

  // A generation from an older version stands in for the worker a
  // browser would still be running
  let previous = registration
    .generations()?
    .into_iter()
    .find(|name| *name != config.cache.version);
  if let Some(version) = previous {
    info!(%version, "resuming previous version");
    registration.adopt(&config.with_version(&version)).await?;
  }

  let flow = UpdateFlow::new(Arc::new(ConsolePrompt { accept }), Arc::new(ConsoleReload));
  let mut events = registration.subscribe();
  flow.on_registered(&registration)?;

  let id = registration.register(config).await?;
  flow.pump(&registration, &mut events)?;
  registration.dispatch_messages().await?;
  flow.pump(&registration, &mut events)?;
  registration.settle().await;

  let state = if registration.controller()? == Some(id) {
    "active"
  } else {
    "waiting"
  };
  let entries = registration.storage().entries(&config.cache.version)?;
  println!(
    "{} installed ({}), {} precached entries",
    config.cache.version,
    state,
    entries.len()
  );
  Ok(())
}

async fn check(config: &Config, storage: Arc<dyn CacheStorage>) -> Result<()> {
  if !update::should_register(config.environment) {
    warn!("development environment, worker registration disabled");
    return Ok(());
  }

  let registration = Registration::new(storage, network(false)?);
  // Resume whatever generation an earlier run left active
  if let Some(version) = registration.generations()?.into_iter().next() {
    registration.adopt(&config.with_version(&version)).await?;
  }

  match update::check_for_update(&registration, config).await? {
    UpdateCheck::NotRegistered => println!("No worker installed yet, run `install` first"),
    UpdateCheck::UpToDate => println!("{} is up to date", config.cache.version),
    UpdateCheck::Installed(id) => {
      registration.settle().await;
      let state = if registration.controller()? == Some(id) {
        "active"
      } else {
        "waiting"
      };
      println!("Installed {} ({})", config.cache.version, state);
    }
  }
  Ok(())
}

async fn fetch(
  config: &Config,
  storage: Arc<dyn CacheStorage>,
  network: Arc<dyn Network>,
  request: Request,
  output: Option<&Path>,
) -> Result<()> {
  if !update::should_register(config.environment) {
    warn!("development environment, bypassing the worker");
    let response = network.fetch(&request).await?;
    return write_body(&response.body, output);
  }

  let registration = Registration::new(storage, network);
  registration.ensure_controller(config).await?;

  let response = registration.fetch(&request).await?;
  registration.settle().await;

  eprintln!(
    "{} {} ({:?}, {} bytes, {})",
    response.status,
    request.url,
    response.source,
    response.body.len(),
    response.header("content-type").unwrap_or("no content type")
  );
  write_body(&response.body, output)
}

fn write_body(body: &[u8], output: Option<&Path>) -> Result<()> {
  match output {
    Some(path) => std::fs::write(path, body)
      .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e)),
    None => std::io::stdout()
      .write_all(body)
      .map_err(|e| eyre!("Failed to write response body: {}", e)),
  }
}

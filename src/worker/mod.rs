//! The offline worker: install, activate, fetch and message handlers.
//!
//! A `ServiceWorker` owns one cache generation, its precache manifest and
//! its routing table. The host drives it through the lifecycle:
//! `parsed -> installing -> installed -> activating -> activated`, with
//! `redundant` reached on install failure or when a newer worker replaces it.

mod background;
mod precache;
mod routing;
mod strategy;

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, GenerationCache};
use crate::config::Config;
use crate::message::Directive;
use crate::net::{Network, Request, Response};

use background::BackgroundTasks;
use precache::PrecacheManifest;
use routing::Router;

pub use routing::RouteConfig;

pub type WorkerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
  Parsed,
  Installing,
  Installed,
  Activating,
  Activated,
  Redundant,
}

/// Outcome of a fetch event.
#[derive(Debug)]
pub enum Interception {
  /// The worker answered the request
  Respond(Response),
  /// Not handled; the request goes to the network unmodified
  Fallthrough,
}

pub struct ServiceWorker {
  id: WorkerId,
  origin: Url,
  generation: GenerationCache,
  manifest: PrecacheManifest,
  router: Router,
  network: Arc<dyn Network>,
  background: BackgroundTasks,
  state: Mutex<WorkerState>,
  skip_waiting: AtomicBool,
  skip_waiting_on_install: bool,
}

impl ServiceWorker {
  pub fn new(
    id: WorkerId,
    config: &Config,
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
  ) -> Result<Self> {
    let manifest = PrecacheManifest::resolve(&config.origin, &config.precache)?;
    let router = Router::from_config(config.routes.as_deref(), &config.navigation_fallback)?;

    Ok(Self {
      id,
      origin: config.origin.clone(),
      generation: GenerationCache::new(storage, config.cache.version.clone()),
      manifest,
      router,
      network,
      background: BackgroundTasks::new(),
      state: Mutex::new(WorkerState::Parsed),
      skip_waiting: AtomicBool::new(false),
      skip_waiting_on_install: config.skip_waiting_on_install,
    })
  }

  pub fn id(&self) -> WorkerId {
    self.id
  }

  /// Name of the generation this worker reads and writes.
  pub fn generation_name(&self) -> &str {
    self.generation.name()
  }

  pub fn state(&self) -> WorkerState {
    self
      .state
      .lock()
      .map(|state| *state)
      .unwrap_or(WorkerState::Redundant)
  }

  fn set_state(&self, next: WorkerState) {
    if let Ok(mut state) = self.state.lock() {
      let from = *state;
      debug!(worker = self.id, ?from, to = ?next, "worker state change");
      *state = next;
    }
  }

  pub fn mark_redundant(&self) {
    self.set_state(WorkerState::Redundant);
  }

  /// Whether the worker asked to skip the waiting phase.
  pub fn skip_waiting_requested(&self) -> bool {
    self.skip_waiting.load(Ordering::SeqCst)
  }

  fn skip_waiting(&self) {
    self.skip_waiting.store(true, Ordering::SeqCst);
  }

  /// Precache the manifest into this worker's generation.
  ///
  /// All-or-nothing: on any failure nothing is stored and the worker becomes
  /// redundant.
  pub async fn on_install(&self) -> Result<()> {
    self.set_state(WorkerState::Installing);

    let stored = match self.precache().await {
      Ok(stored) => stored,
      Err(e) => {
        warn!(worker = self.id, generation = %self.generation.name(), error = %e, "install failed");
        self.mark_redundant();
        return Err(e);
      }
    };

    info!(
      worker = self.id,
      generation = %self.generation.name(),
      entries = stored,
      "precache complete"
    );
    self.set_state(WorkerState::Installed);

    if self.skip_waiting_on_install {
      self.skip_waiting();
    }
    Ok(())
  }

  async fn precache(&self) -> Result<usize> {
    let entries = self.manifest.fetch_all(self.network.as_ref()).await?;
    self.generation.put_all(&entries)?;
    Ok(entries.len())
  }

  /// Drop every generation but this worker's. Returns the removed names.
  ///
  /// The host claims clients once this returns.
  pub fn on_activate(&self) -> Result<Vec<String>> {
    match self.state() {
      WorkerState::Redundant => {
        return Err(eyre!("Worker {} is redundant and cannot activate", self.id))
      }
      WorkerState::Installing => {
        return Err(eyre!("Worker {} is still installing", self.id))
      }
      _ => {}
    }

    self.set_state(WorkerState::Activating);
    self.generation.open()?;
    let removed = self.generation.delete_others()?;
    if !removed.is_empty() {
      info!(worker = self.id, removed = ?removed, "deleted stale cache generations");
    }
    self.set_state(WorkerState::Activated);

    Ok(removed)
  }

  /// Route a request and apply its strategy.
  pub async fn on_fetch(&self, request: &Request) -> Result<Interception> {
    let chosen = self.router.route(request);
    debug!(method = %request.method, url = %request.url, strategy = ?chosen, "routing request");

    let cx = strategy::Context {
      cache: &self.generation,
      network: &self.network,
      background: &self.background,
      origin: &self.origin,
    };

    Ok(match strategy::respond(chosen, request, &cx).await? {
      Some(response) => Interception::Respond(response),
      None => Interception::Fallthrough,
    })
  }

  pub fn on_message(&self, directive: Directive) {
    match directive {
      Directive::SkipWaiting => {
        debug!(worker = self.id, "skip waiting requested");
        self.skip_waiting();
      }
    }
  }

  /// Wait for outstanding background cache writes and revalidations.
  pub async fn settle(&self) {
    self.background.settle().await;
  }
}

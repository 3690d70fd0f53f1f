//! Registration host: drives workers through their lifecycle the way a
//! browser would and tells pages about it.

use color_eyre::{eyre::eyre, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::cache::CacheStorage;
use crate::config::Config;
use crate::message::Directive;
use crate::net::{Network, Request, Response};
use crate::worker::{Interception, ServiceWorker, WorkerId, WorkerState};

/// Lifecycle notifications delivered to pages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
  /// A new worker started installing
  UpdateFound { worker: WorkerId },
  StateChanged { worker: WorkerId, state: WorkerState },
  /// The worker controlling pages changed
  ControllerChanged {
    previous: Option<WorkerId>,
    worker: WorkerId,
  },
}

/// Something a page can post directives to.
pub trait MessageTarget: Send + Sync {
  fn post_message(&self, directive: Directive) -> Result<()>;
}

/// Raw message as posted by a page, addressed to one worker.
type Envelope = (WorkerId, String);

/// Page-side handle on a worker's message port.
#[derive(Clone)]
pub struct WorkerClient {
  id: WorkerId,
  tx: mpsc::UnboundedSender<Envelope>,
}

impl WorkerClient {
  pub fn id(&self) -> WorkerId {
    self.id
  }
}

impl MessageTarget for WorkerClient {
  fn post_message(&self, directive: Directive) -> Result<()> {
    self
      .tx
      .send((self.id, directive.to_json()))
      .map_err(|_| eyre!("Worker {} is no longer reachable", self.id))
  }
}

#[derive(Default)]
struct Slots {
  installing: Option<Arc<ServiceWorker>>,
  waiting: Option<Arc<ServiceWorker>>,
  active: Option<Arc<ServiceWorker>>,
  controller: Option<WorkerId>,
}

impl Slots {
  fn find(&self, id: WorkerId) -> Option<Arc<ServiceWorker>> {
    [&self.installing, &self.waiting, &self.active]
      .into_iter()
      .flatten()
      .find(|worker| worker.id() == id)
      .cloned()
  }
}

pub struct Registration {
  storage: Arc<dyn CacheStorage>,
  network: Arc<dyn Network>,
  slots: Mutex<Slots>,
  /// Replaced workers whose background work has not been awaited yet
  retired: Mutex<Vec<Arc<ServiceWorker>>>,
  events: broadcast::Sender<LifecycleEvent>,
  messages_tx: mpsc::UnboundedSender<Envelope>,
  messages_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>,
  next_id: AtomicU64,
}

impl Registration {
  pub fn new(storage: Arc<dyn CacheStorage>, network: Arc<dyn Network>) -> Self {
    let (events, _) = broadcast::channel(64);
    let (messages_tx, messages_rx) = mpsc::unbounded_channel();

    Self {
      storage,
      network,
      slots: Mutex::new(Slots::default()),
      retired: Mutex::new(Vec::new()),
      events,
      messages_tx,
      messages_rx: tokio::sync::Mutex::new(messages_rx),
      next_id: AtomicU64::new(1),
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
    self.events.subscribe()
  }

  fn emit(&self, event: LifecycleEvent) {
    debug!(?event, "lifecycle event");
    // No subscribers is fine
    let _ = self.events.send(event);
  }

  fn slots(&self) -> Result<MutexGuard<'_, Slots>> {
    self
      .slots
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Mark `worker` redundant and keep it until its background work settles.
  fn retire(&self, worker: Arc<ServiceWorker>) -> Result<()> {
    worker.mark_redundant();
    self.emit(LifecycleEvent::StateChanged {
      worker: worker.id(),
      state: WorkerState::Redundant,
    });
    self
      .retired
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .push(worker);
    Ok(())
  }

  fn build_worker(&self, config: &Config) -> Result<Arc<ServiceWorker>> {
    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
    Ok(Arc::new(ServiceWorker::new(
      id,
      config,
      Arc::clone(&self.storage),
      Arc::clone(&self.network),
    )?))
  }

  /// Install a worker for `config` and activate or park it.
  ///
  /// The worker activates straight away when nothing is active yet or when it
  /// asked to skip waiting; otherwise it waits until told to skip waiting.
  /// A failed install leaves the registration as it was.
  pub async fn register(&self, config: &Config) -> Result<WorkerId> {
    let worker = self.build_worker(config)?;
    let id = worker.id();

    self.slots()?.installing = Some(Arc::clone(&worker));
    self.emit(LifecycleEvent::UpdateFound { worker: id });
    self.emit(LifecycleEvent::StateChanged {
      worker: id,
      state: WorkerState::Installing,
    });

    if let Err(e) = worker.on_install().await {
      self.slots()?.installing = None;
      self.emit(LifecycleEvent::StateChanged {
        worker: id,
        state: WorkerState::Redundant,
      });
      return Err(e.wrap_err(format!(
        "Worker {} for {} failed to install",
        id, config.cache.version
      )));
    }

    let (activate_now, replaced) = {
      let mut slots = self.slots()?;
      slots.installing = None;
      let activate_now = slots.active.is_none() || worker.skip_waiting_requested();
      let replaced = if activate_now {
        None
      } else {
        slots.waiting.replace(Arc::clone(&worker))
      };
      (activate_now, replaced)
    };
    if let Some(previous) = replaced {
      debug!(worker = previous.id(), "replaced waiting worker");
      self.retire(previous)?;
    }

    self.emit(LifecycleEvent::StateChanged {
      worker: id,
      state: WorkerState::Installed,
    });

    if activate_now {
      self.activate(worker).await?;
    } else {
      info!(worker = id, generation = %worker.generation_name(), "update installed, waiting");
    }

    Ok(id)
  }

  /// Check for a new version. Installs a worker when the configured version
  /// differs from the active one; returns its id.
  pub async fn update(&self, config: &Config) -> Result<Option<WorkerId>> {
    let current = self
      .slots()?
      .active
      .as_ref()
      .map(|worker| worker.generation_name().to_string());

    if current.as_deref() == Some(config.cache.version.as_str()) {
      debug!(version = %config.cache.version, "already up to date");
      return Ok(None);
    }

    self.register(config).await.map(Some)
  }

  /// Take over an already-populated generation without reinstalling, as a
  /// browser does on restart.
  pub async fn adopt(&self, config: &Config) -> Result<WorkerId> {
    let worker = self.build_worker(config)?;
    let id = worker.id();
    self.activate(worker).await?;
    Ok(id)
  }

  /// Adopt the configured generation if it exists, otherwise register.
  pub async fn ensure_controller(&self, config: &Config) -> Result<WorkerId> {
    let exists = self
      .storage
      .generation_names()?
      .iter()
      .any(|name| *name == config.cache.version);

    if exists {
      self.adopt(config).await
    } else {
      self.register(config).await
    }
  }

  async fn activate(&self, worker: Arc<ServiceWorker>) -> Result<()> {
    let id = worker.id();

    let previous = {
      let mut slots = self.slots()?;
      if slots.waiting.as_ref().map(|w| w.id()) == Some(id) {
        slots.waiting = None;
      }
      slots.active.take()
    };
    if let Some(previous) = previous {
      // Pending writes of the outgoing worker land before its generation goes
      previous.settle().await;
      self.retire(previous)?;
    }

    self.emit(LifecycleEvent::StateChanged {
      worker: id,
      state: WorkerState::Activating,
    });
    if let Err(e) = worker.on_activate() {
      worker.mark_redundant();
      self.emit(LifecycleEvent::StateChanged {
        worker: id,
        state: WorkerState::Redundant,
      });
      return Err(e);
    }
    self.emit(LifecycleEvent::StateChanged {
      worker: id,
      state: WorkerState::Activated,
    });

    // Claim clients
    let previous_controller = {
      let mut slots = self.slots()?;
      slots.active = Some(Arc::clone(&worker));
      slots.controller.replace(id)
    };
    if previous_controller != Some(id) {
      info!(worker = id, generation = %worker.generation_name(), "worker now controls pages");
      self.emit(LifecycleEvent::ControllerChanged {
        previous: previous_controller,
        worker: id,
      });
    }

    Ok(())
  }

  /// Deliver queued directives. Returns how many were delivered.
  pub async fn dispatch_messages(&self) -> Result<usize> {
    let mut rx = self.messages_rx.lock().await;
    let mut delivered = 0;

    while let Ok((id, raw)) = rx.try_recv() {
      let Some(directive) = Directive::parse(&raw) else {
        debug!(worker = id, message = %raw, "ignoring unrecognised message");
        continue;
      };
      let Some(worker) = self.slots()?.find(id) else {
        debug!(worker = id, ?directive, "dropping message for unknown worker");
        continue;
      };
      delivered += 1;
      worker.on_message(directive);

      let is_waiting = self.slots()?.waiting.as_ref().map(|w| w.id()) == Some(id);
      if is_waiting && worker.skip_waiting_requested() {
        self.activate(worker).await?;
      }
    }

    Ok(delivered)
  }

  /// Message port of a worker known to this registration.
  pub fn client(&self, id: WorkerId) -> Result<Option<WorkerClient>> {
    Ok(self.slots()?.find(id).map(|worker| WorkerClient {
      id: worker.id(),
      tx: self.messages_tx.clone(),
    }))
  }

  pub fn waiting_client(&self) -> Result<Option<WorkerClient>> {
    let waiting = self.slots()?.waiting.as_ref().map(|w| w.id());
    match waiting {
      Some(id) => self.client(id),
      None => Ok(None),
    }
  }

  pub fn controller(&self) -> Result<Option<WorkerId>> {
    Ok(self.slots()?.controller)
  }

  pub fn active(&self) -> Result<Option<Arc<ServiceWorker>>> {
    Ok(self.slots()?.active.clone())
  }

  /// Send a request the way a controlled page would.
  pub async fn fetch(&self, request: &Request) -> Result<Response> {
    let controller = {
      let slots = self.slots()?;
      slots.controller.and_then(|_| slots.active.clone())
    };

    if let Some(worker) = controller {
      if let Interception::Respond(response) = worker.on_fetch(request).await? {
        return Ok(response);
      }
    }

    self.network.fetch(request).await
  }

  /// Names of all cache generations in storage.
  pub fn generations(&self) -> Result<Vec<String>> {
    self.storage.generation_names()
  }

  pub fn storage(&self) -> &Arc<dyn CacheStorage> {
    &self.storage
  }

  /// Drop every worker. Caches are left alone.
  pub fn unregister(&self) -> Result<()> {
    let workers = {
      let mut slots = self.slots()?;
      slots.controller = None;
      [
        slots.installing.take(),
        slots.waiting.take(),
        slots.active.take(),
      ]
    };

    for worker in workers.into_iter().flatten() {
      self.retire(worker)?;
    }
    Ok(())
  }

  /// Wait for background work of every live and replaced worker.
  pub async fn settle(&self) {
    let mut workers = match self.slots() {
      Ok(slots) => [
        slots.installing.clone(),
        slots.waiting.clone(),
        slots.active.clone(),
      ]
      .into_iter()
      .flatten()
      .collect::<Vec<_>>(),
      Err(e) => {
        warn!(error = %e, "cannot settle background work");
        return;
      }
    };
    match self.retired.lock() {
      Ok(mut retired) => workers.append(&mut retired),
      Err(e) => warn!(error = %e, "cannot settle replaced workers"),
    }

    for worker in workers {
      worker.settle().await;
    }
  }
}

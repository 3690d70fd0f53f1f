//! Page-side update flow.
//!
//! Tells the user when a new worker is installed and waiting, lets them
//! activate it right away, and reloads the page once when control moves to
//! the new worker so old page code never runs against a new cache.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, info, warn};

use crate::config::{Config, Environment};
use crate::message::Directive;
use crate::registration::{LifecycleEvent, MessageTarget, Registration, WorkerClient};
use crate::worker::{WorkerId, WorkerState};

/// Shows the "update available" prompt.
pub trait UpdatePrompt: Send + Sync {
  fn update_available(&self, notice: UpdateNotice);
}

/// Reloads the page.
pub trait PageReload: Send + Sync {
  fn reload(&self);
}

/// An update offer for one waiting worker.
#[derive(Clone)]
pub struct UpdateNotice {
  worker: WorkerId,
  target: Arc<dyn MessageTarget>,
  accepted: Arc<AtomicBool>,
}

impl UpdateNotice {
  pub fn new(worker: WorkerId, target: Arc<dyn MessageTarget>) -> Self {
    Self {
      worker,
      target,
      accepted: Arc::new(AtomicBool::new(false)),
    }
  }

  pub fn worker(&self) -> WorkerId {
    self.worker
  }

  /// Ask the waiting worker to activate. Only the first call sends anything.
  pub fn accept(&self) -> Result<()> {
    if self.accepted.swap(true, Ordering::SeqCst) {
      return Ok(());
    }

    if let Err(e) = self.target.post_message(Directive::SkipWaiting) {
      warn!(worker = self.worker, error = %e, "failed to message waiting worker");
      self.accepted.store(false, Ordering::SeqCst);
      return Err(e);
    }
    Ok(())
  }
}

pub struct UpdateFlow {
  prompt: Arc<dyn UpdatePrompt>,
  reload: Arc<dyn PageReload>,
  notified: Mutex<HashSet<WorkerId>>,
  reloading: AtomicBool,
}

impl UpdateFlow {
  pub fn new(prompt: Arc<dyn UpdatePrompt>, reload: Arc<dyn PageReload>) -> Self {
    Self {
      prompt,
      reload,
      notified: Mutex::new(HashSet::new()),
      reloading: AtomicBool::new(false),
    }
  }

  /// Offer an update if a worker is already waiting at registration time.
  pub fn on_registered(&self, registration: &Registration) -> Result<()> {
    if let Some(client) = registration.waiting_client()? {
      self.notify(client)?;
    }
    Ok(())
  }

  pub fn on_event(&self, registration: &Registration, event: &LifecycleEvent) -> Result<()> {
    match event {
      LifecycleEvent::StateChanged {
        worker,
        state: WorkerState::Installed,
      } => {
        // Only an update if an older worker already controls the page
        if registration.controller()?.is_none() {
          return Ok(());
        }
        let waiting = registration
          .waiting_client()?
          .filter(|client| client.id() == *worker);
        if let Some(client) = waiting {
          self.notify(client)?;
        }
      }
      LifecycleEvent::ControllerChanged {
        previous: Some(_), ..
      } => self.on_controller_change(),
      _ => {}
    }
    Ok(())
  }

  /// Reload the page, once.
  pub fn on_controller_change(&self) {
    if self.reloading.swap(true, Ordering::SeqCst) {
      debug!("reload already in progress");
      return;
    }
    info!("controller changed, reloading page");
    self.reload.reload();
  }

  fn notify(&self, client: WorkerClient) -> Result<()> {
    let first = self
      .notified
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .insert(client.id());
    if !first {
      return Ok(());
    }

    debug!(worker = client.id(), "update available");
    let notice = UpdateNotice::new(client.id(), Arc::new(client));
    self.prompt.update_available(notice);
    Ok(())
  }

  /// Handle every lifecycle event queued on `events`. Returns how many were
  /// handled.
  pub fn pump(
    &self,
    registration: &Registration,
    events: &mut broadcast::Receiver<LifecycleEvent>,
  ) -> Result<usize> {
    let mut handled = 0;
    loop {
      match events.try_recv() {
        Ok(event) => {
          self.on_event(registration, &event)?;
          handled += 1;
        }
        Err(TryRecvError::Lagged(skipped)) => warn!(skipped, "missed lifecycle events"),
        Err(TryRecvError::Empty | TryRecvError::Closed) => return Ok(handled),
      }
    }
  }
}

/// Workers are only registered in production; in development they would
/// serve stale assets while iterating.
pub fn should_register(environment: Environment) -> bool {
  environment == Environment::Production
}

/// Unregister every worker and delete every cache generation. Returns the
/// deleted generation names.
pub fn reset_for_development(registration: &Registration) -> Result<Vec<String>> {
  registration.unregister()?;

  let mut removed = Vec::new();
  for name in registration.generations()? {
    if registration.storage().delete_generation(&name)? {
      removed.push(name);
    }
  }
  if !removed.is_empty() {
    info!(removed = ?removed, "cleared caches for development");
  }
  Ok(removed)
}

/// Result of a manual update check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateCheck {
  /// No worker is registered yet
  NotRegistered,
  UpToDate,
  Installed(WorkerId),
}

/// Manual "check for updates": installs the configured version if it differs
/// from the active one.
pub async fn check_for_update(registration: &Registration, config: &Config) -> Result<UpdateCheck> {
  if registration.active()?.is_none() {
    return Ok(UpdateCheck::NotRegistered);
  }

  Ok(match registration.update(config).await? {
    Some(id) => UpdateCheck::Installed(id),
    None => UpdateCheck::UpToDate,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{SqliteStorage, DEFAULT_MAX_ENTRY_BYTES};
  use crate::config::test_config;
  use crate::net::testing::StubNetwork;
  use crate::net::Network;
  use std::sync::atomic::AtomicUsize;

  const ORIGIN: &str = "https://shell.test";

  #[derive(Default)]
  struct RecordingPrompt {
    notices: Mutex<Vec<UpdateNotice>>,
  }

  impl RecordingPrompt {
    fn count(&self) -> usize {
      self.notices.lock().unwrap().len()
    }

    fn last(&self) -> UpdateNotice {
      self.notices.lock().unwrap().last().cloned().unwrap()
    }
  }

  impl UpdatePrompt for RecordingPrompt {
    fn update_available(&self, notice: UpdateNotice) {
      self.notices.lock().unwrap().push(notice);
    }
  }

  #[derive(Default)]
  struct CountingReload {
    reloads: AtomicUsize,
  }

  impl CountingReload {
    fn count(&self) -> usize {
      self.reloads.load(Ordering::SeqCst)
    }
  }

  impl PageReload for CountingReload {
    fn reload(&self) {
      self.reloads.fetch_add(1, Ordering::SeqCst);
    }
  }

  #[derive(Default)]
  struct RecordingTarget {
    sent: Mutex<Vec<Directive>>,
  }

  impl MessageTarget for RecordingTarget {
    fn post_message(&self, directive: Directive) -> Result<()> {
      self.sent.lock().unwrap().push(directive);
      Ok(())
    }
  }

  fn config(version: &str) -> Config {
    let mut config = test_config(ORIGIN, version, &["/", "/index.html"]);
    config.skip_waiting_on_install = false;
    config
  }

  fn registration() -> Registration {
    let network = Arc::new(StubNetwork::new(ORIGIN));
    network.serve("/", "root");
    network.serve("/index.html", "root");
    Registration::new(
      Arc::new(SqliteStorage::in_memory(DEFAULT_MAX_ENTRY_BYTES).unwrap()),
      network as Arc<dyn Network>,
    )
  }

  fn flow() -> (UpdateFlow, Arc<RecordingPrompt>, Arc<CountingReload>) {
    let prompt = Arc::new(RecordingPrompt::default());
    let reload = Arc::new(CountingReload::default());
    let flow = UpdateFlow::new(
      Arc::clone(&prompt) as Arc<dyn UpdatePrompt>,
      Arc::clone(&reload) as Arc<dyn PageReload>,
    );
    (flow, prompt, reload)
  }

  /// A controlling v1 worker and a waiting v2 worker.
  async fn with_waiting_worker() -> (Registration, WorkerId, WorkerId) {
    let registration = registration();
    let old = registration.register(&config("shell-v1")).await.unwrap();
    let new = registration.register(&config("shell-v2")).await.unwrap();
    (registration, old, new)
  }

  #[test]
  fn test_accept_sends_single_skip_waiting() {
    let target = Arc::new(RecordingTarget::default());
    let notice = UpdateNotice::new(3, Arc::clone(&target) as Arc<dyn MessageTarget>);

    notice.accept().unwrap();
    notice.accept().unwrap();
    notice.clone().accept().unwrap();

    assert_eq!(*target.sent.lock().unwrap(), vec![Directive::SkipWaiting]);
  }

  #[tokio::test]
  async fn test_waiting_at_registration_notifies_once() {
    let (registration, _old, new) = with_waiting_worker().await;
    let (flow, prompt, _reload) = flow();

    flow.on_registered(&registration).unwrap();
    flow.on_registered(&registration).unwrap();
    flow
      .on_event(
        &registration,
        &LifecycleEvent::StateChanged {
          worker: new,
          state: WorkerState::Installed,
        },
      )
      .unwrap();

    assert_eq!(prompt.count(), 1);
    assert_eq!(prompt.last().worker(), new);
  }

  #[tokio::test]
  async fn test_accept_activates_and_reloads_once() {
    let (registration, old, new) = with_waiting_worker().await;
    let (flow, prompt, reload) = flow();
    let mut events = registration.subscribe();

    flow.on_registered(&registration).unwrap();
    prompt.last().accept().unwrap();
    prompt.last().accept().unwrap();
    assert_eq!(registration.dispatch_messages().await.unwrap(), 1);

    assert_eq!(registration.controller().unwrap(), Some(new));
    flow.pump(&registration, &mut events).unwrap();
    // A second controller change must not reload again
    flow
      .on_event(
        &registration,
        &LifecycleEvent::ControllerChanged {
          previous: Some(old),
          worker: new,
        },
      )
      .unwrap();

    assert_eq!(reload.count(), 1);
  }

  #[tokio::test]
  async fn test_installed_update_notifies_when_controlled() {
    let registration = registration();
    registration.register(&config("shell-v1")).await.unwrap();
    let (flow, prompt, _reload) = flow();
    let mut events = registration.subscribe();

    let new = registration.register(&config("shell-v2")).await.unwrap();
    flow.pump(&registration, &mut events).unwrap();

    assert_eq!(prompt.count(), 1);
    assert_eq!(prompt.last().worker(), new);
  }

  #[tokio::test]
  async fn test_first_install_does_not_prompt_or_reload() {
    let registration = registration();
    let (flow, prompt, reload) = flow();
    let mut events = registration.subscribe();

    registration.register(&config("shell-v1")).await.unwrap();
    flow.pump(&registration, &mut events).unwrap();

    assert_eq!(prompt.count(), 0);
    assert_eq!(reload.count(), 0);
  }

  #[tokio::test]
  async fn test_pump_drives_flow() {
    let registration = registration();
    registration.register(&config("shell-v1")).await.unwrap();
    let (flow, prompt, reload) = flow();
    let mut events = registration.subscribe();
    assert_eq!(flow.pump(&registration, &mut events).unwrap(), 0);

    registration.register(&config("shell-v2")).await.unwrap();
    assert!(flow.pump(&registration, &mut events).unwrap() > 0);
    assert_eq!(prompt.count(), 1);

    prompt.last().accept().unwrap();
    registration.dispatch_messages().await.unwrap();
    flow.pump(&registration, &mut events).unwrap();
    assert_eq!(reload.count(), 1);
    assert_eq!(flow.pump(&registration, &mut events).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_check_for_update() {
    let registration = registration();
    assert_eq!(
      check_for_update(&registration, &config("shell-v1")).await.unwrap(),
      UpdateCheck::NotRegistered
    );

    registration.register(&config("shell-v1")).await.unwrap();
    assert_eq!(
      check_for_update(&registration, &config("shell-v1")).await.unwrap(),
      UpdateCheck::UpToDate
    );
    assert!(matches!(
      check_for_update(&registration, &config("shell-v2")).await.unwrap(),
      UpdateCheck::Installed(_)
    ));
  }

  #[tokio::test]
  async fn test_development_reset_clears_everything() {
    assert!(should_register(Environment::Production));
    assert!(!should_register(Environment::Development));

    let (registration, _old, _new) = with_waiting_worker().await;
    let removed = reset_for_development(&registration).unwrap();

    assert_eq!(removed, vec!["shell-v1".to_string(), "shell-v2".to_string()]);
    assert!(registration.generations().unwrap().is_empty());
    assert_eq!(registration.controller().unwrap(), None);
  }
}

//! Detached tasks for work that must not hold up a response.

use color_eyre::Result;
use std::future::Future;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// Fire-and-forget task set.
///
/// Errors from spawned tasks are logged and dropped; they never reach the
/// code that spawned them.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
  tracker: TaskTracker,
}

impl BackgroundTasks {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn spawn<F>(&self, label: impl Into<String>, task: F)
  where
    F: Future<Output = Result<()>> + Send + 'static,
  {
    let label = label.into();
    self.tracker.spawn(async move {
      match task.await {
        Ok(()) => debug!(task = %label, "background task finished"),
        Err(e) => debug!(task = %label, error = %e, "background task failed, dropping error"),
      }
    });
  }

  /// Wait for every task spawned so far (and any they spawn) to finish.
  pub async fn settle(&self) {
    self.tracker.close();
    self.tracker.wait().await;
    self.tracker.reopen();
  }
}

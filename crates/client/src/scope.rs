// SPDX-License-Identifier: AGPL-3.0-only

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// The lifetime of one connection epoch.
///
/// Owns the cancellation of every epoch-bound worker (listener, category
/// senders, keepalive) together with their task handles, so they are cancelled
/// and joined as a unit.
#[derive(Clone, Debug, Default)]
pub struct CancellationScope {
  token: CancellationToken,
  task_tracker: TaskTracker,
}

// === impl CancellationScope ===

impl CancellationScope {
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns the epoch's cancellation token.
  pub fn token(&self) -> CancellationToken {
    self.token.clone()
  }

  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  /// Spawns a worker owned by this epoch.
  pub fn spawn<F>(&self, task: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    self.task_tracker.spawn(task);
  }

  /// Returns the number of workers still running.
  pub fn active_tasks(&self) -> usize {
    self.task_tracker.len()
  }

  /// Signals cancellation to every worker of the epoch.
  pub fn cancel(&self) {
    self.token.cancel();
    self.task_tracker.close();
  }

  /// Waits up to `timeout` for the epoch's workers to finish.
  ///
  /// Returns `true` if every worker finished in time.
  pub async fn join(&self, timeout: Duration) -> bool {
    self.task_tracker.close();
    tokio::time::timeout(timeout, self.task_tracker.wait()).await.is_ok()
  }
}

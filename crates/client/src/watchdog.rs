// SPDX-License-Identifier: AGPL-3.0-only

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures::FutureExt;
use parking_lot::Mutex as PlMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::event::{Event, FatalReason};
use crate::link::Link;

struct Monitor {
  token: CancellationToken,
  handle: JoinHandle<()>,
}

impl Monitor {
  fn is_active(&self) -> bool {
    !self.token.is_cancelled() && !self.handle.is_finished()
  }
}

/// Polls connectivity and restores lost connections.
///
/// The watchdog is independent of the connection epochs: it survives the
/// reconnects it triggers itself, and is only stopped by a full close.
pub struct ConnectionWatchDog {
  client_id: Arc<String>,
  poll_interval: Duration,
  monitor: PlMutex<Option<Monitor>>,
}

// === impl ConnectionWatchDog ===

impl ConnectionWatchDog {
  pub fn new(client_id: Arc<String>, poll_interval: Duration) -> Self {
    Self { client_id, poll_interval, monitor: PlMutex::new(None) }
  }

  pub fn poll_interval(&self) -> Duration {
    self.poll_interval
  }

  /// Reports whether the monitoring loop is alive.
  pub fn is_running(&self) -> bool {
    self.monitor.lock().as_ref().is_some_and(Monitor::is_active)
  }

  /// Launches the monitoring loop.
  ///
  /// Fails if a previous loop is still running.
  pub fn start(&self, link: Arc<dyn Link>) -> anyhow::Result<()> {
    let mut monitor = self.monitor.lock();
    if monitor.as_ref().is_some_and(Monitor::is_active) {
      return Err(anyhow!("watchdog is already running"));
    }

    let token = CancellationToken::new();
    let handle = tokio::spawn(Self::run(self.client_id.clone(), link, self.poll_interval, token.clone()));
    *monitor = Some(Monitor { token, handle });

    debug!(client_id = self.client_id.as_str(), poll_interval = ?self.poll_interval, "watchdog started");
    Ok(())
  }

  /// Cancels the monitoring loop and gives it two poll intervals to wind down.
  ///
  /// Safe to call when the watchdog was never started, and from within the
  /// loop itself.
  pub async fn stop(&self) {
    let token = match self.monitor.lock().as_ref() {
      Some(monitor) if !monitor.token.is_cancelled() => monitor.token.clone(),
      _ => return,
    };

    token.cancel();
    tokio::time::sleep(self.poll_interval * 2).await;

    debug!(client_id = self.client_id.as_str(), "watchdog stopped");
  }

  async fn run(client_id: Arc<String>, link: Arc<dyn Link>, poll_interval: Duration, token: CancellationToken) {
    let monitoring = Self::monitor_loop(client_id.clone(), link.clone(), poll_interval, token.clone());

    if let Err(panic) = AssertUnwindSafe(monitoring).catch_unwind().await {
      let error = Arc::new(anyhow!("watchdog panicked: {}", panic_message(panic.as_ref())));
      error!(client_id = client_id.as_str(), "{}", error);

      token.cancel();
      link.events().emit_all(vec![Event::Error(error.clone()), Event::Fatal(FatalReason::WatchdogFailure(error))]).await;
    }
  }

  async fn monitor_loop(client_id: Arc<String>, link: Arc<dyn Link>, poll_interval: Duration, token: CancellationToken) {
    loop {
      tokio::select! {
        _ = token.cancelled() => break,
        _ = tokio::time::sleep(poll_interval) => {},
      }

      if link.is_connected() {
        continue;
      }

      warn!(client_id = client_id.as_str(), "connection lost, reconnecting");

      let restored = link.reconnect_internal().await;
      if token.is_cancelled() {
        break;
      }

      if !restored {
        error!(client_id = client_id.as_str(), "unable to restore connection, closing");
        link.close().await;
        break;
      }

      info!(client_id = client_id.as_str(), "connection restored");
    }

    debug!(client_id = client_id.as_str(), "watchdog loop exited");
  }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
  if let Some(message) = panic.downcast_ref::<&str>() {
    message.to_string()
  } else if let Some(message) = panic.downcast_ref::<String>() {
    message.clone()
  } else {
    "unknown panic".to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  use std::sync::atomic::Ordering;

  use crate::link::fake::FakeLink;

  const POLL: Duration = Duration::from_millis(200);

  fn watchdog() -> ConnectionWatchDog {
    ConnectionWatchDog::new(Arc::new("test".to_string()), POLL)
  }

  #[tokio::test(start_paused = true)]
  async fn test_start_twice_fails() -> anyhow::Result<()> {
    let link = FakeLink::new();
    let watchdog = watchdog();

    watchdog.start(link.clone())?;
    assert!(watchdog.is_running());
    assert!(watchdog.start(link.clone()).is_err());

    watchdog.stop().await;
    assert!(!watchdog.is_running());

    // A stopped watchdog can be started again.
    watchdog.start(link)?;
    assert!(watchdog.is_running());
    watchdog.stop().await;

    Ok(())
  }

  #[tokio::test(start_paused = true)]
  async fn test_stop_without_start() {
    let watchdog = watchdog();
    watchdog.stop().await;
    assert!(!watchdog.is_running());
  }

  #[tokio::test(start_paused = true)]
  async fn test_healthy_link_is_left_alone() -> anyhow::Result<()> {
    let link = FakeLink::new();
    let watchdog = watchdog();
    watchdog.start(link.clone())?;

    tokio::time::sleep(POLL * 10).await;

    assert_eq!(link.reconnect_calls.load(Ordering::SeqCst), 0);
    assert_eq!(link.close_calls.load(Ordering::SeqCst), 0);
    watchdog.stop().await;

    Ok(())
  }

  #[tokio::test(start_paused = true)]
  async fn test_lost_connection_triggers_reconnect() -> anyhow::Result<()> {
    let link = FakeLink::new();
    let watchdog = watchdog();
    watchdog.start(link.clone())?;

    link.set_connected(false);
    tokio::time::sleep(POLL + Duration::from_millis(10)).await;

    assert_eq!(link.reconnect_calls.load(Ordering::SeqCst), 1);
    assert!(link.is_connected());
    assert!(watchdog.is_running());

    link.set_connected(false);
    tokio::time::sleep(POLL + Duration::from_millis(10)).await;
    assert_eq!(link.reconnect_calls.load(Ordering::SeqCst), 2);

    watchdog.stop().await;
    Ok(())
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_reconnect_closes_and_exits() -> anyhow::Result<()> {
    let link = FakeLink::new();
    link.reconnect_succeeds.store(false, Ordering::SeqCst);
    let watchdog = watchdog();
    watchdog.start(link.clone())?;

    link.set_connected(false);
    tokio::time::sleep(POLL * 5).await;

    assert_eq!(link.reconnect_calls.load(Ordering::SeqCst), 1);
    assert_eq!(link.close_calls.load(Ordering::SeqCst), 1);
    assert!(!watchdog.is_running());

    Ok(())
  }

  #[tokio::test(start_paused = true)]
  async fn test_stopped_watchdog_does_not_reconnect() -> anyhow::Result<()> {
    let link = FakeLink::new();
    let watchdog = watchdog();
    watchdog.start(link.clone())?;
    watchdog.stop().await;

    link.set_connected(false);
    tokio::time::sleep(POLL * 5).await;

    assert_eq!(link.reconnect_calls.load(Ordering::SeqCst), 0);
    Ok(())
  }

  #[tokio::test(start_paused = true)]
  async fn test_panic_reports_fatal() -> anyhow::Result<()> {
    let link = FakeLink::new();
    let watchdog = watchdog();
    watchdog.start(link.clone())?;

    link.panic_on_probe.store(true, Ordering::SeqCst);
    tokio::time::sleep(POLL * 2).await;

    assert!(!watchdog.is_running());

    let events = link.collect.events();
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], Event::Error(e) if e.to_string().contains("probe exploded")));
    assert!(matches!(&events[1], Event::Fatal(FatalReason::WatchdogFailure(_))));

    Ok(())
  }
}

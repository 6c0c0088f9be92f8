// SPDX-License-Identifier: AGPL-3.0-only

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::event::Event;
use crate::link::Link;
use crate::scope::CancellationScope;
use crate::throttle::Category;
use crate::watchdog::ConnectionWatchDog;

#[derive(Clone, Debug)]
struct Keepalive {
  interval: Duration,
  payload: String,
}

/// The background services that run while a connection is established.
///
/// The listener and the keepalive belong to the epoch and end with its
/// cancellation. The watchdog outlives epochs and is only stopped explicitly.
pub struct NetworkServices {
  client_id: Arc<String>,
  watchdog: ConnectionWatchDog,
  keepalive: Option<Keepalive>,
}

// === impl NetworkServices ===

impl NetworkServices {
  pub fn new(
    client_id: Arc<String>,
    watchdog_interval: Duration,
    keepalive_interval: Option<Duration>,
    keepalive_payload: String,
  ) -> Self {
    let watchdog = ConnectionWatchDog::new(client_id.clone(), watchdog_interval);
    let keepalive = keepalive_interval.map(|interval| Keepalive { interval, payload: keepalive_payload });

    Self { client_id, watchdog, keepalive }
  }

  pub fn watchdog(&self) -> &ConnectionWatchDog {
    &self.watchdog
  }

  /// Ensures a single watchdog is running and launches the epoch workers.
  pub fn start(&self, link: Arc<dyn Link>, scope: &CancellationScope) {
    if !self.watchdog.is_running()
      && let Err(e) = self.watchdog.start(link.clone())
    {
      warn!(client_id = self.client_id.as_str(), "failed to start watchdog: {}", e);
    }

    scope.spawn(Self::listen(self.client_id.clone(), link.clone(), scope.token()));

    if let Some(keepalive) = self.keepalive.clone() {
      scope.spawn(Self::keep_alive(self.client_id.clone(), link, keepalive, scope.token()));
    }
  }

  /// Stops the watchdog.
  ///
  /// Epoch workers terminate through the epoch's cancellation.
  pub async fn stop(&self) {
    self.watchdog.stop().await;
  }

  async fn listen(client_id: Arc<String>, link: Arc<dyn Link>, token: CancellationToken) {
    loop {
      let received = tokio::select! {
        _ = token.cancelled() => break,
        received = link.receive(&token) => received,
      };

      match received {
        Ok(Some(payload)) => {
          trace!(client_id = client_id.as_str(), len = payload.len(), "received payload");
          link.events().emit(Event::Message(payload)).await;
        },
        Ok(None) => {
          if !token.is_cancelled() {
            debug!(client_id = client_id.as_str(), "inbound stream ended");
          }
          break;
        },
        Err(e) => {
          if token.is_cancelled() {
            break;
          }
          warn!(client_id = client_id.as_str(), "failed to receive payload: {}", e);
          link.events().emit(Event::Error(Arc::new(e))).await;
          break;
        },
      }
    }

    trace!(client_id = client_id.as_str(), "listener stopped");
  }

  async fn keep_alive(client_id: Arc<String>, link: Arc<dyn Link>, keepalive: Keepalive, token: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + keepalive.interval, keepalive.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        _ = token.cancelled() => break,
        _ = ticker.tick() => {},
      }

      if !link.enqueue(keepalive.payload.clone(), Category::Bypass) {
        debug!(client_id = client_id.as_str(), "keepalive not queued");
      }
    }

    trace!(client_id = client_id.as_str(), "keepalive stopped");
  }
}

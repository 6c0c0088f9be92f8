// SPDX-License-Identifier: AGPL-3.0-only

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use parking_lot::Mutex as PlMutex;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::LevelFilter;

use relink_client::config::{CategoryLimits, Config, ReconnectConfig, ThrottlingConfig};
use relink_client::event::{Event, EventHandler};
use relink_util::conn::{Transport, TransportFactory};

/// Installs a test-friendly tracing subscriber. Repeated calls are ignored.
pub fn init_tracing() {
  let _ = tracing_subscriber::fmt().with_test_writer().with_max_level(LevelFilter::DEBUG).try_init();
}

/// Returns a controller configuration with short intervals suitable for tests.
///
/// Reconnection uses a fixed 20ms interval with a budget of 3 attempts.
pub fn default_test_config() -> Config {
  let limits = CategoryLimits {
    allowed_in_window: 100,
    window: Duration::from_secs(30),
    capacity: 1000,
    item_ttl: Duration::from_secs(60),
  };

  Config {
    client_id: "test-client".to_string(),
    reconnect: ReconnectConfig::Fixed { interval: Duration::from_millis(20), max_attempts: Some(3) },
    connect_timeout: Duration::from_millis(500),
    disconnect_wait: Duration::from_millis(200),
    send_delay: Duration::from_millis(5),
    watchdog_interval: Duration::from_millis(50),
    keepalive_interval: None,
    keepalive_payload: "PING".to_string(),
    event_buffer_size: 64,
    throttling: ThrottlingConfig { message: limits.clone(), whisper: limits, control_capacity: 1000 },
  }
}

/// Polls `condition` every 5ms until it holds or `timeout` elapses.
///
/// Returns whether the condition held.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
  let deadline = tokio::time::Instant::now() + timeout;
  loop {
    if condition() {
      return true;
    }
    if tokio::time::Instant::now() >= deadline {
      return false;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
}

// === MockTransportFactory ===

#[derive(Default)]
struct Shared {
  fail_create: AtomicBool,
  fail_connect: AtomicBool,
  fail_send: AtomicBool,
  created: AtomicUsize,
  connect_calls: AtomicUsize,
  close_calls: AtomicUsize,
  sent: PlMutex<Vec<String>>,
  current: PlMutex<Option<Current>>,
}

struct Current {
  connected: Arc<AtomicBool>,
  inbound_tx: mpsc::UnboundedSender<String>,
}

/// A scriptable in-memory transport factory.
///
/// Clones share state, so a test keeps one clone to drive and inspect the
/// transports created for the controller.
#[derive(Clone, Default)]
pub struct MockTransportFactory {
  shared: Arc<Shared>,
}

// === impl MockTransportFactory ===

impl MockTransportFactory {
  pub fn new() -> Self {
    Self::default()
  }

  /// Makes every subsequent `create` fail.
  pub fn set_fail_create(&self, fail: bool) {
    self.shared.fail_create.store(fail, Ordering::SeqCst);
  }

  /// Makes every subsequent `connect` fail.
  pub fn set_fail_connect(&self, fail: bool) {
    self.shared.fail_connect.store(fail, Ordering::SeqCst);
  }

  /// Makes every subsequent `send` fail.
  pub fn set_fail_send(&self, fail: bool) {
    self.shared.fail_send.store(fail, Ordering::SeqCst);
  }

  /// Flips the current transport to disconnected, as if the peer went away.
  pub fn drop_connection(&self) {
    if let Some(current) = self.shared.current.lock().as_ref() {
      current.connected.store(false, Ordering::SeqCst);
    }
  }

  /// Delivers an inbound payload on the current transport.
  ///
  /// Returns `false` if no transport is live.
  pub fn push_inbound(&self, payload: impl Into<String>) -> bool {
    self.shared.current.lock().as_ref().is_some_and(|current| current.inbound_tx.send(payload.into()).is_ok())
  }

  /// The number of transports created so far.
  pub fn created(&self) -> usize {
    self.shared.created.load(Ordering::SeqCst)
  }

  /// The number of `connect` calls across every transport.
  pub fn connect_calls(&self) -> usize {
    self.shared.connect_calls.load(Ordering::SeqCst)
  }

  /// The number of `close` calls across every transport.
  pub fn close_calls(&self) -> usize {
    self.shared.close_calls.load(Ordering::SeqCst)
  }

  /// Every payload successfully written, in write order.
  pub fn sent(&self) -> Vec<String> {
    self.shared.sent.lock().clone()
  }
}

impl TransportFactory for MockTransportFactory {
  type Transport = MockTransport;

  fn create(&self) -> anyhow::Result<MockTransport> {
    if self.shared.fail_create.load(Ordering::SeqCst) {
      return Err(anyhow!("transport factory unavailable"));
    }

    let connected = Arc::new(AtomicBool::new(false));
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

    *self.shared.current.lock() = Some(Current { connected: connected.clone(), inbound_tx });
    self.shared.created.fetch_add(1, Ordering::SeqCst);

    Ok(MockTransport { shared: self.shared.clone(), connected, inbound_rx: Mutex::new(inbound_rx) })
  }
}

/// A transport created by [`MockTransportFactory`].
pub struct MockTransport {
  shared: Arc<Shared>,
  connected: Arc<AtomicBool>,
  inbound_rx: Mutex<mpsc::UnboundedReceiver<String>>,
}

#[async_trait::async_trait]
impl Transport for MockTransport {
  async fn connect(&self, _cancellation: &CancellationToken) -> anyhow::Result<()> {
    self.shared.connect_calls.fetch_add(1, Ordering::SeqCst);

    if self.shared.fail_connect.load(Ordering::SeqCst) {
      return Err(anyhow!("connection refused"));
    }
    self.connected.store(true, Ordering::SeqCst);
    Ok(())
  }

  fn is_connected(&self) -> bool {
    self.connected.load(Ordering::SeqCst)
  }

  async fn send(&self, payload: &str, _cancellation: &CancellationToken) -> anyhow::Result<()> {
    if !self.is_connected() {
      return Err(anyhow!("not connected"));
    }
    if self.shared.fail_send.load(Ordering::SeqCst) {
      return Err(anyhow!("write failed"));
    }
    self.shared.sent.lock().push(payload.to_string());
    Ok(())
  }

  async fn receive(&self, cancellation: &CancellationToken) -> anyhow::Result<Option<String>> {
    let mut inbound_rx = self.inbound_rx.lock().await;
    tokio::select! {
      _ = cancellation.cancelled() => Ok(None),
      payload = inbound_rx.recv() => Ok(payload),
    }
  }

  async fn close(&self) {
    self.shared.close_calls.fetch_add(1, Ordering::SeqCst);
    self.connected.store(false, Ordering::SeqCst);

    let mut current = self.shared.current.lock();
    if current.as_ref().is_some_and(|live| Arc::ptr_eq(&live.connected, &self.connected)) {
      current.take();
    }
  }
}

// === EventRecorder ===

/// An [`EventHandler`] that records every event it receives.
#[derive(Clone, Default)]
pub struct EventRecorder(Arc<PlMutex<Vec<Event>>>);

// === impl EventRecorder ===

impl EventRecorder {
  pub fn new() -> Self {
    Self::default()
  }

  /// A snapshot of the recorded events, in delivery order.
  pub fn events(&self) -> Vec<Event> {
    self.0.lock().clone()
  }

  /// Counts the recorded events matching `predicate`.
  pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
    self.0.lock().iter().filter(|event| predicate(event)).count()
  }

  /// Inbound payloads, in delivery order.
  pub fn messages(&self) -> Vec<String> {
    self
      .0
      .lock()
      .iter()
      .filter_map(|event| match event {
        Event::Message(payload) => Some(payload.clone()),
        _ => None,
      })
      .collect()
  }

  pub fn clear(&self) {
    self.0.lock().clear();
  }
}

#[async_trait::async_trait]
impl EventHandler for EventRecorder {
  async fn on_event(&self, event: &Event) {
    self.0.lock().push(event.clone());
  }
}

// SPDX-License-Identifier: AGPL-3.0-only

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use anyhow::anyhow;
use parking_lot::RwLock as PlRwLock;
use tokio::sync::Mutex;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use relink_util::backoff::ReconnectionPolicy;
use relink_util::conn::{Transport, TransportFactory};

use crate::config::Config;
use crate::event::{Dispatcher, Event, EventBus, EventHandler, FatalReason};
use crate::link::Link;
use crate::scope::CancellationScope;
use crate::services::NetworkServices;
use crate::throttle::{Category, ThrottlingPipeline};

/// The lifecycle state of a controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum State {
  /// No transport is live.
  Disconnected,

  /// A manual open is running its connect loop.
  Connecting,

  /// The transport is connected and background services are running.
  Connected,

  /// An automatic or requested reconnect is running its connect loop.
  Reconnecting,

  /// The current epoch is being torn down.
  Closing,
}

impl fmt::Display for State {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      State::Disconnected => "disconnected",
      State::Connecting => "connecting",
      State::Connected => "connected",
      State::Reconnecting => "reconnecting",
      State::Closing => "closing",
    };
    f.write_str(s)
  }
}

/// An auto-reconnecting, rate-limited connection over a pluggable transport.
///
/// Every call to [`Controller::open`] or to a reconnect begins a new epoch with
/// a fresh transport from the factory. Outbound payloads go through a
/// per-category throttling pipeline; inbound payloads and lifecycle changes are
/// reported as [`Event`]s.
///
/// Lifecycle operations never fail across the public boundary: they return
/// `bool` and report details through events.
pub struct Controller<F: TransportFactory>(Arc<ControllerInner<F>>);

impl<F: TransportFactory> Clone for Controller<F> {
  fn clone(&self) -> Self {
    Self(Arc::clone(&self.0))
  }
}

impl<F: TransportFactory> fmt::Debug for Controller<F> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.0.fmt(f)
  }
}

// === impl Controller ===

impl<F: TransportFactory> Controller<F> {
  /// Creates a new `Controller` instance.
  ///
  /// # Arguments
  ///
  /// * `config` - Controller settings: reconnection, timeouts and throttling.
  /// * `factory` - Creates a fresh transport for every connection epoch.
  ///
  /// # Errors
  ///
  /// Returns an error if the configuration is invalid.
  pub fn new(config: Config, factory: F) -> anyhow::Result<Self> {
    config.validate()?;

    let inner = Arc::new_cyclic(|this| ControllerInner::new(config, factory, this.clone()));
    Ok(Self(inner))
  }

  /// The client identifier used to tag log lines.
  pub fn client_id(&self) -> &str {
    self.0.client_id.as_str()
  }

  /// The configuration the controller was built with.
  pub fn config(&self) -> &Config {
    &self.0.config
  }

  /// Opens the connection.
  ///
  /// Returns `true` right away if already connected, and `false` once the
  /// controller has been shut down or the reconnection budget runs out.
  /// Per-attempt errors are delivered while the connect loop is still running.
  pub async fn open(&self) -> bool {
    self.0.open().await
  }

  /// Closes the connection, stopping the watchdog before the epoch is torn down.
  ///
  /// Safe to call on a controller that was never opened.
  pub async fn close(&self) {
    self.0.close().await
  }

  /// Closes the connection if needed, then reopens it without resetting the
  /// reconnection budget.
  pub async fn reconnect(&self) -> bool {
    self.0.reconnect().await
  }

  /// Disposes the controller.
  ///
  /// Events are suppressed from this point on and further opens fail.
  pub async fn shutdown(&self) {
    self.0.shutdown().await
  }

  /// Queues a regular message.
  pub fn send(&self, payload: impl Into<String>) -> bool {
    self.0.pipeline.enqueue(payload.into(), Category::Message)
  }

  /// Queues a whisper.
  pub fn whisper(&self, payload: impl Into<String>) -> bool {
    self.0.pipeline.enqueue(payload.into(), Category::Whisper)
  }

  /// Queues control traffic, which is never rate limited.
  pub fn send_control(&self, payload: impl Into<String>) -> bool {
    self.0.pipeline.enqueue(payload.into(), Category::Bypass)
  }

  /// Queues a payload on `category`.
  ///
  /// Returns `false` if not connected or if the category queue is full.
  pub fn enqueue(&self, payload: impl Into<String>, category: Category) -> bool {
    self.0.pipeline.enqueue(payload.into(), category)
  }

  /// Writes a payload directly, bypassing the throttling pipeline.
  ///
  /// Failures are reported through a [`Event::SendFailed`] event.
  pub async fn send_immediate(&self, payload: impl Into<String>) -> bool {
    self.0.send_immediate(payload.into()).await
  }

  /// Registers an event handler. Handlers are awaited in registration order.
  pub fn subscribe(&self, handler: Arc<dyn EventHandler>) {
    self.0.events.subscribe(handler);
  }

  /// Returns a stream of events.
  ///
  /// Events are dropped, with a warning, whenever the consumer lags more than
  /// `event_buffer_size` events behind.
  pub fn event_stream(&self) -> ReceiverStream<Event> {
    self.0.events.stream(self.0.config.event_buffer_size)
  }

  /// The current lifecycle state.
  pub fn state(&self) -> State {
    *self.0.state.read()
  }

  /// Whether the current epoch's transport reports a live connection.
  pub fn is_connected(&self) -> bool {
    self.0.is_connected()
  }

  /// The number of payloads waiting in `category`'s queue.
  pub fn queue_len(&self, category: Category) -> usize {
    self.0.pipeline.queue(category).len()
  }

  /// The number of connect attempts consumed from the reconnection budget.
  pub fn reconnect_attempt(&self) -> u32 {
    self.0.policy.current_attempt()
  }
}

// === ControllerInner ===

struct Epoch<T> {
  /// Sequence number, for log correlation.
  id: u64,

  /// Cancellation and task ownership of the epoch's workers.
  scope: CancellationScope,

  /// The epoch's transport, if one was created.
  transport: Option<Arc<T>>,
}

struct ControllerInner<F: TransportFactory> {
  /// The client ID used to identify the client.
  client_id: Arc<String>,

  /// The controller configuration.
  config: Config,

  /// Creates one transport per epoch.
  factory: F,

  /// Long-lived across reconnects.
  policy: ReconnectionPolicy,

  state: PlRwLock<State>,

  epoch: PlRwLock<Epoch<F::Transport>>,

  /// Serializes open, close and reconnect.
  lifecycle: Mutex<()>,

  /// Serializes transport writes and transport close.
  send_lock: Mutex<()>,

  /// Cleared by an explicit close, so a pending watchdog reconnect gives up.
  open_requested: AtomicBool,

  services: NetworkServices,

  pipeline: ThrottlingPipeline,

  events: EventBus,

  /// Cancelled once on shutdown.
  shutdown_token: CancellationToken,

  this: Weak<ControllerInner<F>>,
}

impl<F: TransportFactory> fmt::Debug for ControllerInner<F> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ControllerInner")
      .field("client_id", &self.client_id)
      .field("state", &*self.state.read())
      .field("config", &self.config)
      .finish()
  }
}

// === impl ControllerInner ===

impl<F: TransportFactory> ControllerInner<F> {
  fn new(config: Config, factory: F, this: Weak<Self>) -> Self {
    let client_id = Arc::new(config.client_id.clone());
    let shutdown_token = CancellationToken::new();

    let services = NetworkServices::new(
      client_id.clone(),
      config.watchdog_interval,
      config.keepalive_interval,
      config.keepalive_payload.clone(),
    );
    let pipeline = ThrottlingPipeline::new(client_id.clone(), config.send_delay, &config.throttling);
    let events = EventBus::new(client_id.clone(), shutdown_token.clone());
    let policy = ReconnectionPolicy::from(&config.reconnect);

    Self {
      client_id,
      policy,
      state: PlRwLock::new(State::Disconnected),
      epoch: PlRwLock::new(Epoch { id: 0, scope: CancellationScope::new(), transport: None }),
      lifecycle: Mutex::new(()),
      send_lock: Mutex::new(()),
      open_requested: AtomicBool::new(false),
      services,
      pipeline,
      events,
      shutdown_token,
      factory,
      config,
      this,
    }
  }

  fn is_disposed(&self) -> bool {
    self.shutdown_token.is_cancelled()
  }

  fn link(&self) -> Option<Arc<dyn Link>> {
    self.this.upgrade().map(|inner| inner as Arc<dyn Link>)
  }

  async fn open(&self) -> bool {
    if self.is_disposed() {
      debug!(client_id = self.client_id.as_str(), "open rejected: controller is shut down");
      return false;
    }

    let events = self.events.dispatcher();
    let opened = {
      let _lifecycle = self.lifecycle.lock().await;

      if self.is_disposed() {
        false
      } else if self.is_connected() {
        true
      } else {
        self.open_requested.store(true, Ordering::SeqCst);
        self.open_locked(false, &events).await
      }
    };

    events.finish().await;
    opened
  }

  async fn close(&self) {
    self.open_requested.store(false, Ordering::SeqCst);

    // Abort a connect loop in progress so the lifecycle lock frees up.
    self.epoch.read().scope.cancel();

    let events = self.events.dispatcher();
    {
      let _lifecycle = self.lifecycle.lock().await;
      self.services.stop().await;
      self.close_epoch_locked(&events).await;
    }

    events.finish().await;
  }

  async fn reconnect(&self) -> bool {
    if self.is_disposed() {
      return false;
    }

    if self.is_connected() {
      self.close().await;
    }
    self.open_requested.store(true, Ordering::SeqCst);

    self.reconnect_epoch().await
  }

  async fn reconnect_epoch(&self) -> bool {
    let events = self.events.dispatcher();
    let reconnected = {
      let _lifecycle = self.lifecycle.lock().await;

      if self.is_disposed() || !self.open_requested.load(Ordering::SeqCst) {
        debug!(client_id = self.client_id.as_str(), "reconnect skipped: connection was closed");
        false
      } else if self.is_connected() {
        true
      } else {
        self.close_epoch_locked(&events).await;

        let reconnected = self.open_locked(true, &events).await;
        if reconnected {
          events.push(Event::Reconnected);
        }
        reconnected
      }
    };

    events.finish().await;
    reconnected
  }

  async fn shutdown(&self) {
    if self.is_disposed() {
      return;
    }

    self.shutdown_token.cancel();
    self.close().await;

    info!(client_id = self.client_id.as_str(), "controller shut down");
  }

  async fn send_immediate(&self, payload: String) -> bool {
    match self.write(&payload).await {
      Ok(()) => true,
      Err(e) => {
        warn!(client_id = self.client_id.as_str(), "failed to send payload: {}", e);
        self.events.emit(Event::SendFailed { payload, error: Arc::new(e) }).await;
        false
      },
    }
  }

  /// Runs the connect loop for a new epoch. Must hold the lifecycle lock.
  async fn open_locked(&self, is_reconnect: bool, events: &Dispatcher) -> bool {
    if self.epoch.read().transport.is_some() {
      self.close_epoch_locked(events).await;
    }

    self.set_state(if is_reconnect { State::Reconnecting } else { State::Connecting }, events);

    // A reconnect keeps the attempt counter, so the budget may already be spent.
    if is_reconnect && self.policy.are_attempts_complete() {
      let attempts = self.policy.current_attempt();
      error!(client_id = self.client_id.as_str(), attempts, "reconnect budget exhausted, giving up");
      events.push(Event::Fatal(FatalReason::AttemptsExhausted { attempts }));
      self.set_state(State::Disconnected, events);
      return false;
    }

    let transport = match self.factory.create() {
      Ok(transport) => Arc::new(transport),
      Err(e) => {
        let e = Arc::new(e);
        error!(client_id = self.client_id.as_str(), "failed to create transport: {}", e);
        events.push(Event::Error(e.clone()));
        events.push(Event::Fatal(FatalReason::TransportUnavailable(e)));
        self.set_state(State::Disconnected, events);
        return false;
      },
    };

    let (epoch_id, scope) = {
      let mut epoch = self.epoch.write();
      if epoch.scope.is_cancelled() {
        epoch.scope = CancellationScope::new();
      }
      epoch.id += 1;
      epoch.transport = Some(transport.clone());
      (epoch.id, epoch.scope.clone())
    };
    let token = scope.token();

    self.policy.reset(is_reconnect);

    loop {
      let attempt = self.policy.current_attempt() + 1;
      debug!(client_id = self.client_id.as_str(), epoch = epoch_id, attempt, "connecting");

      let connect_timeout = self.config.connect_timeout;
      let result = tokio::select! {
        _ = token.cancelled() => break,
        result = tokio::time::timeout(connect_timeout, transport.connect(&token)) => result,
      };
      match result {
        Ok(Ok(())) => {},
        Ok(Err(e)) => {
          warn!(client_id = self.client_id.as_str(), epoch = epoch_id, attempt, "connect attempt failed: {}", e);
          events.push(Event::Error(Arc::new(e)));
        },
        Err(_) => {
          let e = anyhow!("connect timed out after {:?}", connect_timeout);
          warn!(client_id = self.client_id.as_str(), epoch = epoch_id, attempt, "connect attempt failed: {}", e);
          events.push(Event::Error(Arc::new(e)));
        },
      }

      self.policy.process_values();

      if transport.is_connected() || self.policy.are_attempts_complete() {
        break;
      }

      let delay = self.policy.reconnect_interval();
      trace!(client_id = self.client_id.as_str(), epoch = epoch_id, delay = ?delay, "waiting before next attempt");

      tokio::select! {
        _ = token.cancelled() => break,
        _ = self.shutdown_token.cancelled() => break,
        _ = tokio::time::sleep(delay) => {},
      }
    }

    if token.is_cancelled() || self.is_disposed() || !transport.is_connected() {
      if token.is_cancelled() || self.is_disposed() {
        debug!(client_id = self.client_id.as_str(), epoch = epoch_id, "connect aborted");
      } else {
        let attempts = self.policy.current_attempt();
        error!(client_id = self.client_id.as_str(), epoch = epoch_id, attempts, "unable to connect, giving up");
        events.push(Event::Fatal(FatalReason::AttemptsExhausted { attempts }));
      }

      let released = self.epoch.write().transport.take();
      if let Some(transport) = released {
        let _send = self.send_lock.lock().await;
        transport.close().await;
      }
      self.set_state(State::Disconnected, events);
      return false;
    }

    let Some(link) = self.link() else {
      return false;
    };

    self.set_state(State::Connected, events);
    self.pipeline.start(link.clone(), &scope);
    self.services.start(link, &scope);

    if !is_reconnect {
      events.push(Event::Connected);
    }

    info!(
      client_id = self.client_id.as_str(),
      epoch = epoch_id,
      attempts = self.policy.current_attempt(),
      reconnect = is_reconnect,
      "connected"
    );
    true
  }

  /// Tears down the current epoch. Must hold the lifecycle lock.
  async fn close_epoch_locked(&self, events: &Dispatcher) {
    let (epoch_id, scope, transport) = {
      let mut epoch = self.epoch.write();
      epoch.scope.cancel();
      let scope = std::mem::take(&mut epoch.scope);
      (epoch.id, scope, epoch.transport.take())
    };

    self.pipeline.stop();

    if let Some(transport) = transport {
      self.set_state(State::Closing, events);
      {
        let _send = self.send_lock.lock().await;
        transport.close().await;
      }
      events.push(Event::Disconnected);
      info!(client_id = self.client_id.as_str(), epoch = epoch_id, "disconnected");
    }
    self.set_state(State::Disconnected, events);

    if !scope.join(self.config.disconnect_wait).await {
      warn!(
        client_id = self.client_id.as_str(),
        epoch = epoch_id,
        pending = scope.active_tasks(),
        "epoch workers still running after disconnect wait"
      );
    }
  }

  fn set_state(&self, new_state: State, events: &Dispatcher) {
    let old_state = std::mem::replace(&mut *self.state.write(), new_state);
    if old_state == new_state {
      return;
    }
    trace!(client_id = self.client_id.as_str(), from = %old_state, to = %new_state, "state changed");

    let was_connected = old_state == State::Connected;
    let is_connected = new_state == State::Connected;
    if was_connected != is_connected {
      events.push(Event::StateChanged { is_connected, was_connected });
    }
  }
}

#[async_trait::async_trait]
impl<F: TransportFactory> Link for ControllerInner<F> {
  fn client_id(&self) -> &str {
    self.client_id.as_str()
  }

  fn is_connected(&self) -> bool {
    self.epoch.read().transport.as_ref().is_some_and(|transport| transport.is_connected())
  }

  fn events(&self) -> &EventBus {
    &self.events
  }

  async fn write(&self, payload: &str) -> anyhow::Result<()> {
    let _send = self.send_lock.lock().await;

    let (transport, token) = {
      let epoch = self.epoch.read();
      (epoch.transport.clone(), epoch.scope.token())
    };
    let Some(transport) = transport else {
      return Err(anyhow!("not connected"));
    };

    transport.send(payload, &token).await
  }

  async fn receive(&self, cancellation: &CancellationToken) -> anyhow::Result<Option<String>> {
    let transport = {
      let epoch = self.epoch.read();
      if cancellation.is_cancelled() {
        return Ok(None);
      }
      epoch.transport.clone()
    };

    match transport {
      Some(transport) => transport.receive(cancellation).await,
      None => Ok(None),
    }
  }

  fn enqueue(&self, payload: String, category: Category) -> bool {
    self.pipeline.enqueue(payload, category)
  }

  async fn reconnect_internal(&self) -> bool {
    self.reconnect_epoch().await
  }

  async fn close(&self) {
    ControllerInner::close(self).await
  }
}

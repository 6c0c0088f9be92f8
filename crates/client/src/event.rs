// SPDX-License-Identifier: AGPL-3.0-only

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock as PlRwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Details of a payload dropped because its category ran out of window budget.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Throttled {
  /// The dropped payload.
  pub payload: String,

  /// Sends already performed in the current window.
  pub sent_count: u32,

  /// The window length.
  pub period: Duration,

  /// The number of sends admitted per window.
  pub allowed_in_period: u32,
}

/// Why the controller gave up on the connection.
#[derive(Clone, Debug)]
pub enum FatalReason {
  /// The reconnection budget ran out before a connection could be established.
  AttemptsExhausted { attempts: u32 },

  /// The transport factory could not create a transport for the epoch.
  TransportUnavailable(Arc<anyhow::Error>),

  /// The watchdog hit an unexpected failure and stopped itself.
  WatchdogFailure(Arc<anyhow::Error>),
}

impl fmt::Display for FatalReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      FatalReason::AttemptsExhausted { attempts } => {
        write!(f, "unable to connect after {} attempt(s)", attempts)
      },
      FatalReason::TransportUnavailable(e) => write!(f, "transport unavailable: {}", e),
      FatalReason::WatchdogFailure(e) => write!(f, "watchdog failure: {}", e),
    }
  }
}

/// Lifecycle and traffic notifications raised by the controller.
#[derive(Clone, Debug)]
pub enum Event {
  /// A manual open established the connection.
  Connected,

  /// The current epoch's transport was closed.
  Disconnected,

  /// An automatic or requested reconnect established a new epoch.
  Reconnected,

  /// An inbound payload.
  Message(String),

  /// A recoverable transport error.
  Error(Arc<anyhow::Error>),

  /// The controller gave up on the connection.
  Fatal(FatalReason),

  /// A payload could not be written to the transport.
  SendFailed { payload: String, error: Arc<anyhow::Error> },

  /// A regular message was dropped by the rate limiter.
  MessageThrottled(Throttled),

  /// A whisper was dropped by the rate limiter.
  WhisperThrottled(Throttled),

  /// Connectivity changed.
  StateChanged { is_connected: bool, was_connected: bool },
}

/// Receives controller events.
///
/// The raiser awaits `on_event` before continuing, so handlers observe events
/// in order and must not perform long blocking work.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + 'static {
  /// Handles a single event.
  async fn on_event(&self, event: &Event);
}

/// Forwards events into a bounded channel, dropping them when the consumer lags.
struct ChannelHandler {
  client_id: Arc<String>,
  tx: mpsc::Sender<Event>,
}

#[async_trait::async_trait]
impl EventHandler for ChannelHandler {
  async fn on_event(&self, event: &Event) {
    if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(event.clone()) {
      warn!(client_id = self.client_id.as_str(), "dropped event: event stream is full");
    }
  }
}

/// Ordered, awaited fan-out of events to registered handlers.
///
/// Once the owning controller has been shut down every event is suppressed.
#[derive(Clone)]
pub struct EventBus {
  client_id: Arc<String>,
  handlers: Arc<PlRwLock<Vec<Arc<dyn EventHandler>>>>,
  shutdown_token: CancellationToken,
}

impl fmt::Debug for EventBus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("EventBus").field("client_id", &self.client_id).field("handlers", &self.handlers.read().len()).finish()
  }
}

// === impl EventBus ===

impl EventBus {
  pub fn new(client_id: Arc<String>, shutdown_token: CancellationToken) -> Self {
    Self { client_id, handlers: Arc::new(PlRwLock::new(Vec::new())), shutdown_token }
  }

  /// Registers a handler. Handlers are invoked in registration order.
  pub fn subscribe(&self, handler: Arc<dyn EventHandler>) {
    self.handlers.write().push(handler);
  }

  /// Returns a stream of events backed by a channel of `buffer_size` slots.
  pub fn stream(&self, buffer_size: usize) -> ReceiverStream<Event> {
    let (tx, rx) = mpsc::channel(buffer_size);
    self.subscribe(Arc::new(ChannelHandler { client_id: self.client_id.clone(), tx }));
    ReceiverStream::new(rx)
  }

  /// Delivers `event` to every handler, awaiting each one in turn.
  pub async fn emit(&self, event: Event) {
    if self.shutdown_token.is_cancelled() {
      return;
    }

    let handlers = self.handlers.read().clone();
    for handler in handlers {
      handler.on_event(&event).await;
    }
  }

  /// Delivers a batch of events in order.
  pub async fn emit_all(&self, events: Vec<Event>) {
    for event in events {
      self.emit(event).await;
    }
  }

  /// Starts a [`Dispatcher`] that delivers pushed events on its own task.
  pub fn dispatcher(&self) -> Dispatcher {
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let bus = self.clone();
    let handle = tokio::spawn(async move {
      while let Some(event) = rx.recv().await {
        bus.emit(event).await;
      }
    });
    Dispatcher { tx, handle }
  }
}

/// Ordered event delivery that does not run handlers on the pushing task.
///
/// Lifecycle operations push events while holding the lifecycle lock; handlers
/// run concurrently on the dispatcher task and may call back into the
/// controller.
pub struct Dispatcher {
  tx: mpsc::UnboundedSender<Event>,
  handle: JoinHandle<()>,
}

// === impl Dispatcher ===

impl Dispatcher {
  /// Queues `event` for delivery after every previously pushed event.
  pub fn push(&self, event: Event) {
    let _ = self.tx.send(event);
  }

  /// Waits until every pushed event has been delivered.
  pub async fn finish(self) {
    drop(self.tx);
    let _ = self.handle.await;
  }
}

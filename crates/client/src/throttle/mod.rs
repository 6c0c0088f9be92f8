// SPDX-License-Identifier: AGPL-3.0-only

mod queue;

pub use queue::{Admission, Queued, ThrottleQueue};

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex as PlMutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::ThrottlingConfig;
use crate::event::{Event, Throttled};
use crate::link::Link;
use crate::scope::CancellationScope;

/// Outbound traffic categories, each with its own queue and rate limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Category {
  /// Control traffic (keepalive and the like), never rate limited.
  Bypass,

  /// Regular messages.
  Message,

  /// Whispers (private messages), limited separately.
  Whisper,
}

impl Category {
  pub const ALL: [Category; 3] = [Category::Bypass, Category::Message, Category::Whisper];

  pub fn as_str(self) -> &'static str {
    match self {
      Category::Bypass => "bypass",
      Category::Message => "message",
      Category::Whisper => "whisper",
    }
  }

  fn index(self) -> usize {
    match self {
      Category::Bypass => 0,
      Category::Message => 1,
      Category::Whisper => 2,
    }
  }

  fn throttled_event(self, throttled: Throttled) -> Option<Event> {
    match self {
      Category::Message => Some(Event::MessageThrottled(throttled)),
      Category::Whisper => Some(Event::WhisperThrottled(throttled)),
      Category::Bypass => None,
    }
  }
}

impl fmt::Display for Category {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Admits, paces and expires outbound payloads per category.
///
/// Each category gets one sender worker bound to the epoch's cancellation and
/// one window-reset timer owned by the pipeline itself.
pub struct ThrottlingPipeline {
  client_id: Arc<String>,
  send_delay: Duration,
  queues: [Arc<ThrottleQueue>; 3],
  link: PlMutex<Option<Weak<dyn Link>>>,
  timers: PlMutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for ThrottlingPipeline {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ThrottlingPipeline")
      .field("client_id", &self.client_id)
      .field("send_delay", &self.send_delay)
      .field("queues", &self.queues)
      .finish()
  }
}

// === impl ThrottlingPipeline ===

impl ThrottlingPipeline {
  pub fn new(client_id: Arc<String>, send_delay: Duration, config: &ThrottlingConfig) -> Self {
    let queues = [
      Arc::new(ThrottleQueue::bypass(config.control_capacity, config.message.window, config.message.item_ttl)),
      Arc::new(ThrottleQueue::new(Category::Message, &config.message)),
      Arc::new(ThrottleQueue::new(Category::Whisper, &config.whisper)),
    ];

    Self { client_id, send_delay, queues, link: PlMutex::new(None), timers: PlMutex::new(Vec::new()) }
  }

  /// Returns the queue backing `category`.
  pub fn queue(&self, category: Category) -> &Arc<ThrottleQueue> {
    &self.queues[category.index()]
  }

  /// Reports whether the pipeline has been started and not stopped since.
  pub fn is_running(&self) -> bool {
    self.current_link().is_some()
  }

  /// Queues a payload for its category sender.
  ///
  /// Returns `false` when the link is not connected or the queue is full.
  /// Never blocks.
  pub fn enqueue(&self, payload: String, category: Category) -> bool {
    let connected = self.current_link().is_some_and(|link| link.is_connected());
    if !connected {
      debug!(client_id = self.client_id.as_str(), category = category.as_str(), "rejected payload: not connected");
      return false;
    }

    let queue = self.queue(category);
    if !queue.enqueue(payload) {
      debug!(
        client_id = self.client_id.as_str(),
        category = category.as_str(),
        capacity = queue.capacity(),
        "rejected payload: queue is full"
      );
      return false;
    }

    true
  }

  /// Arms the window-reset timers and launches one sender per category.
  pub fn start(&self, link: Arc<dyn Link>, scope: &CancellationScope) {
    self.stop_timers();

    let mut timers = Vec::with_capacity(self.queues.len());
    for queue in &self.queues {
      timers.push(tokio::spawn(Self::reset_window_task(queue.clone())));

      scope.spawn(Self::sender_task(
        self.client_id.clone(),
        queue.clone(),
        link.clone(),
        self.send_delay,
        scope.token(),
      ));
    }
    *self.timers.lock() = timers;
    *self.link.lock() = Some(Arc::downgrade(&link));

    debug!(client_id = self.client_id.as_str(), "throttling pipeline started");
  }

  /// Disposes the timers and discards whatever is still queued.
  ///
  /// Sender workers terminate through the epoch's cancellation.
  pub fn stop(&self) {
    self.stop_timers();
    self.link.lock().take();

    for queue in &self.queues {
      let discarded = queue.clear();
      if discarded > 0 {
        debug!(
          client_id = self.client_id.as_str(),
          category = queue.category().as_str(),
          discarded,
          "discarded queued payloads"
        );
      }
    }
  }

  fn current_link(&self) -> Option<Arc<dyn Link>> {
    self.link.lock().as_ref().and_then(Weak::upgrade)
  }

  fn stop_timers(&self) {
    for timer in self.timers.lock().drain(..) {
      timer.abort();
    }
  }

  async fn reset_window_task(queue: Arc<ThrottleQueue>) {
    let window = queue.window();
    let mut ticker = tokio::time::interval_at(Instant::now() + window, window);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      ticker.tick().await;
      queue.reset_window();
    }
  }

  async fn sender_task(
    client_id: Arc<String>,
    queue: Arc<ThrottleQueue>,
    link: Arc<dyn Link>,
    send_delay: Duration,
    token: CancellationToken,
  ) {
    let category = queue.category();

    loop {
      tokio::select! {
        _ = token.cancelled() => break,
        _ = tokio::time::sleep(send_delay) => {},
      }

      let Some(item) = queue.dequeue() else {
        continue;
      };

      match queue.admit(&item, Instant::now()) {
        Admission::Expired => {
          trace!(client_id = client_id.as_str(), category = category.as_str(), "dropped stale payload");
        },
        Admission::Throttled(throttled) => {
          debug!(
            client_id = client_id.as_str(),
            category = category.as_str(),
            sent_count = throttled.sent_count,
            allowed = throttled.allowed_in_period,
            "payload throttled"
          );
          if let Some(event) = category.throttled_event(throttled) {
            link.events().emit(event).await;
          }
        },
        Admission::Admit => match link.write(&item.payload).await {
          Ok(()) => queue.record_sent(),
          Err(e) => {
            warn!(client_id = client_id.as_str(), category = category.as_str(), "failed to send payload: {}", e);
            link.events().emit(Event::SendFailed { payload: item.payload, error: Arc::new(e) }).await;
          },
        },
      }
    }

    trace!(client_id = client_id.as_str(), category = category.as_str(), "sender stopped");
  }
}

impl Drop for ThrottlingPipeline {
  fn drop(&mut self) {
    self.stop_timers();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  use std::sync::atomic::Ordering;

  use crate::config::CategoryLimits;
  use crate::link::fake::FakeLink;

  fn throttling(allowed_in_window: u32, window: Duration, item_ttl: Duration) -> ThrottlingConfig {
    let limits = CategoryLimits { allowed_in_window, window, capacity: 16, item_ttl };
    ThrottlingConfig { message: limits.clone(), whisper: limits, control_capacity: 16 }
  }

  fn pipeline(config: &ThrottlingConfig) -> ThrottlingPipeline {
    ThrottlingPipeline::new(Arc::new("test".to_string()), Duration::from_millis(50), config)
  }

  #[tokio::test(start_paused = true)]
  async fn test_enqueue_rejected_until_started() {
    let link = FakeLink::new();
    let pipeline = pipeline(&throttling(10, Duration::from_secs(30), Duration::from_secs(60)));

    assert!(!pipeline.enqueue("early".to_string(), Category::Message));

    let scope = CancellationScope::new();
    pipeline.start(link.clone(), &scope);
    assert!(pipeline.is_running());
    assert!(pipeline.enqueue("on time".to_string(), Category::Message));

    link.set_connected(false);
    assert!(!pipeline.enqueue("too late".to_string(), Category::Message));

    scope.cancel();
    pipeline.stop();
    assert!(!pipeline.is_running());
    assert!(pipeline.queue(Category::Message).is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_payloads_delivered_in_order() {
    let link = FakeLink::new();
    let pipeline = pipeline(&throttling(10, Duration::from_secs(30), Duration::from_secs(60)));
    let scope = CancellationScope::new();
    pipeline.start(link.clone(), &scope);

    for payload in ["one", "two", "three"] {
      assert!(pipeline.enqueue(payload.to_string(), Category::Message));
    }

    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(*link.writes.lock(), vec!["one", "two", "three"]);
    assert_eq!(pipeline.queue(Category::Message).sent_in_window(), 3);
    assert!(link.collect.0.lock().is_empty());

    scope.cancel();
    pipeline.stop();
  }

  #[tokio::test(start_paused = true)]
  async fn test_budget_overflow_raises_single_throttled_event() {
    let link = FakeLink::new();
    let pipeline = pipeline(&throttling(3, Duration::from_secs(60), Duration::from_secs(600)));
    let scope = CancellationScope::new();
    pipeline.start(link.clone(), &scope);

    for i in 0..4 {
      assert!(pipeline.enqueue(format!("msg-{}", i), Category::Message));
    }

    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(*link.writes.lock(), vec!["msg-0", "msg-1", "msg-2"]);

    let events = link.collect.events();
    assert_eq!(events.len(), 1);
    match &events[0] {
      Event::MessageThrottled(throttled) => {
        assert_eq!(throttled.payload, "msg-3");
        assert_eq!(throttled.sent_count, 3);
        assert_eq!(throttled.period, Duration::from_secs(60));
        assert_eq!(throttled.allowed_in_period, 3);
      },
      other => panic!("unexpected event: {:?}", other),
    }

    scope.cancel();
    pipeline.stop();
  }

  #[tokio::test(start_paused = true)]
  async fn test_whisper_throttling_uses_whisper_event() {
    let link = FakeLink::new();
    let pipeline = pipeline(&throttling(1, Duration::from_secs(60), Duration::from_secs(600)));
    let scope = CancellationScope::new();
    pipeline.start(link.clone(), &scope);

    assert!(pipeline.enqueue("w1".to_string(), Category::Whisper));
    assert!(pipeline.enqueue("w2".to_string(), Category::Whisper));

    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(*link.writes.lock(), vec!["w1"]);
    assert!(matches!(&link.collect.0.lock()[..], [Event::WhisperThrottled(t)] if t.payload == "w2"));

    scope.cancel();
    pipeline.stop();
  }

  #[tokio::test(start_paused = true)]
  async fn test_window_reset_restores_budget() {
    let link = FakeLink::new();
    let pipeline = pipeline(&throttling(1, Duration::from_secs(2), Duration::from_secs(600)));
    let scope = CancellationScope::new();
    pipeline.start(link.clone(), &scope);

    assert!(pipeline.enqueue("first".to_string(), Category::Message));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(pipeline.queue(Category::Message).sent_in_window(), 1);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(pipeline.queue(Category::Message).sent_in_window(), 0);

    assert!(pipeline.enqueue("second".to_string(), Category::Message));
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(*link.writes.lock(), vec!["first", "second"]);
    assert!(link.collect.0.lock().is_empty());

    scope.cancel();
    pipeline.stop();
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_payload_dropped_silently() {
    let link = FakeLink::new();
    let pipeline = pipeline(&throttling(10, Duration::from_secs(30), Duration::from_millis(20)));
    let scope = CancellationScope::new();
    pipeline.start(link.clone(), &scope);

    assert!(pipeline.enqueue("stale".to_string(), Category::Message));
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(link.writes.lock().is_empty());
    assert!(link.collect.0.lock().is_empty());
    assert!(pipeline.queue(Category::Message).is_empty());
    assert_eq!(pipeline.queue(Category::Message).sent_in_window(), 0);

    scope.cancel();
    pipeline.stop();
  }

  #[tokio::test(start_paused = true)]
  async fn test_write_failure_reports_send_failed() {
    let link = FakeLink::new();
    link.fail_writes.store(true, Ordering::SeqCst);
    let pipeline = pipeline(&throttling(10, Duration::from_secs(30), Duration::from_secs(60)));
    let scope = CancellationScope::new();
    pipeline.start(link.clone(), &scope);

    assert!(pipeline.enqueue("lost".to_string(), Category::Message));
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(pipeline.queue(Category::Message).sent_in_window(), 0);
    let events = link.collect.events();
    assert!(
      matches!(&events[..], [Event::SendFailed { payload, error }] if payload == "lost" && error.to_string() == "broken pipe")
    );

    scope.cancel();
    pipeline.stop();
  }

  #[tokio::test(start_paused = true)]
  async fn test_bypass_is_never_throttled() {
    let link = FakeLink::new();
    let pipeline = pipeline(&throttling(1, Duration::from_secs(60), Duration::from_secs(600)));
    let scope = CancellationScope::new();
    pipeline.start(link.clone(), &scope);

    for _ in 0..5 {
      assert!(pipeline.enqueue("PING".to_string(), Category::Bypass));
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(link.writes.lock().len(), 5);
    assert!(link.collect.0.lock().is_empty());

    scope.cancel();
    pipeline.stop();
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancelled_scope_stops_senders() {
    let link = FakeLink::new();
    let pipeline = pipeline(&throttling(10, Duration::from_secs(30), Duration::from_secs(60)));
    let scope = CancellationScope::new();
    pipeline.start(link.clone(), &scope);

    scope.cancel();
    assert!(scope.join(Duration::from_secs(1)).await);

    // The queue still accepts while the link looks connected, but nobody drains it.
    assert!(pipeline.enqueue("orphan".to_string(), Category::Message));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(link.writes.lock().is_empty());

    pipeline.stop();
    assert!(pipeline.queue(Category::Message).is_empty());
  }
}

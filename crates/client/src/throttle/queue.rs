// SPDX-License-Identifier: AGPL-3.0-only

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex as PlMutex;
use tokio::time::Instant;

use crate::config::CategoryLimits;
use crate::event::Throttled;

use super::Category;

/// A payload waiting in a category queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Queued {
  /// When the payload was accepted.
  pub enqueued_at: Instant,

  /// The payload itself.
  pub payload: String,
}

/// The verdict for a dequeued item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
  /// The item may be written.
  Admit,

  /// The item outlived its time-to-live and is silently discarded.
  Expired,

  /// The window budget is used up; the item is dropped and reported.
  Throttled(Throttled),
}

/// Bounded FIFO of timestamped payloads for a single category.
///
/// Enqueueing beyond capacity is rejected rather than blocking. The window
/// counter is only bumped for items actually written.
#[derive(Debug)]
pub struct ThrottleQueue {
  category: Category,
  items: PlMutex<VecDeque<Queued>>,
  capacity: usize,
  allowed_in_window: u32,
  window: Duration,
  item_ttl: Duration,
  sent_in_window: AtomicU32,
}

// === impl ThrottleQueue ===

impl ThrottleQueue {
  /// Creates a rate-limited queue.
  pub fn new(category: Category, limits: &CategoryLimits) -> Self {
    Self {
      category,
      items: PlMutex::new(VecDeque::new()),
      capacity: limits.capacity,
      allowed_in_window: limits.allowed_in_window,
      window: limits.window,
      item_ttl: limits.item_ttl,
      sent_in_window: AtomicU32::new(0),
    }
  }

  /// Creates a queue for control traffic, whose budget can never run out.
  pub fn bypass(capacity: usize, window: Duration, item_ttl: Duration) -> Self {
    Self {
      category: Category::Bypass,
      items: PlMutex::new(VecDeque::new()),
      capacity,
      allowed_in_window: u32::MAX,
      window,
      item_ttl,
      sent_in_window: AtomicU32::new(0),
    }
  }

  pub fn category(&self) -> Category {
    self.category
  }

  pub fn window(&self) -> Duration {
    self.window
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn len(&self) -> usize {
    self.items.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.lock().is_empty()
  }

  /// Appends a payload stamped with the current time.
  ///
  /// Returns `false`, leaving the queue untouched, when it is at capacity.
  pub fn enqueue(&self, payload: String) -> bool {
    let mut items = self.items.lock();
    if items.len() >= self.capacity {
      return false;
    }
    items.push_back(Queued { enqueued_at: Instant::now(), payload });
    true
  }

  /// Removes the oldest payload.
  pub fn dequeue(&self) -> Option<Queued> {
    self.items.lock().pop_front()
  }

  /// Drops every queued payload, returning how many were discarded.
  pub fn clear(&self) -> usize {
    let mut items = self.items.lock();
    let count = items.len();
    items.clear();
    count
  }

  /// Decides what to do with a dequeued item at time `now`.
  ///
  /// Expiry is checked before the window budget, so a stale item never
  /// produces a throttled notification.
  pub fn admit(&self, item: &Queued, now: Instant) -> Admission {
    if now.saturating_duration_since(item.enqueued_at) > self.item_ttl {
      return Admission::Expired;
    }

    let sent_count = self.sent_in_window();
    if sent_count >= self.allowed_in_window {
      return Admission::Throttled(Throttled {
        payload: item.payload.clone(),
        sent_count,
        period: self.window,
        allowed_in_period: self.allowed_in_window,
      });
    }

    Admission::Admit
  }

  /// Records a successful write in the current window.
  pub fn record_sent(&self) {
    let _ = self.sent_in_window.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_add(1)));
  }

  /// Opens a new window.
  pub fn reset_window(&self) {
    self.sent_in_window.store(0, Ordering::SeqCst);
  }

  pub fn sent_in_window(&self) -> u32 {
    self.sent_in_window.load(Ordering::SeqCst)
  }
}

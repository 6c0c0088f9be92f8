// SPDX-License-Identifier: AGPL-3.0-only

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// The strategy used to compute the delay between two reconnection attempts.
#[derive(Clone, Debug, PartialEq)]
pub enum ReconnectInterval {
  /// Waits the same amount of time between every attempt.
  Fixed(Duration),

  /// Waits `initial_delay * factor^attempt`, capped at `max_delay`.
  Exponential { initial_delay: Duration, max_delay: Duration, factor: f64 },
}

/// Stateful reconnection budget and backoff tracker.
///
/// A single policy instance lives as long as the connection that owns it. The
/// attempt counter is only zeroed by an explicit (non reconnect-triggered)
/// [`reset`](Self::reset), so the budget bounds the *total* number of automatic
/// reconnection attempts across a sequence of connection drops.
///
/// All methods take `&self`; the counter is an atomic so the policy can be
/// shared between the caller's open path and the watchdog's reconnect path.
#[derive(Debug)]
pub struct ReconnectionPolicy {
  interval: ReconnectInterval,
  max_attempts: Option<u32>,
  current_attempt: AtomicU32,
}

impl Default for ReconnectionPolicy {
  fn default() -> Self {
    Self::exponential(Duration::from_secs(1), Duration::from_secs(30), Some(10))
  }
}

impl Clone for ReconnectionPolicy {
  fn clone(&self) -> Self {
    Self {
      interval: self.interval.clone(),
      max_attempts: self.max_attempts,
      current_attempt: AtomicU32::new(self.current_attempt()),
    }
  }
}

impl ReconnectionPolicy {
  /// Creates a policy that waits a constant `interval` between attempts.
  ///
  /// `max_attempts` of `None` means the budget is unbounded.
  pub fn fixed(interval: Duration, max_attempts: Option<u32>) -> Self {
    Self::new(ReconnectInterval::Fixed(interval), max_attempts)
  }

  /// Creates a policy with exponential backoff (factor 2) capped at `max_delay`.
  pub fn exponential(initial_delay: Duration, max_delay: Duration, max_attempts: Option<u32>) -> Self {
    Self::new(ReconnectInterval::Exponential { initial_delay, max_delay, factor: 2.0 }, max_attempts)
  }

  /// Creates a policy that never retries: a single failed attempt exhausts it.
  pub fn no_reconnect() -> Self {
    Self::new(ReconnectInterval::Fixed(Duration::ZERO), Some(1))
  }

  /// Creates a policy from an interval strategy and an attempt budget.
  ///
  /// # Panics
  ///
  /// Panics if `max_attempts` is `Some(0)`, or if an exponential factor is not
  /// greater than 1.0.
  pub fn new(interval: ReconnectInterval, max_attempts: Option<u32>) -> Self {
    assert!(max_attempts != Some(0), "Max attempts must be greater than 0");
    if let ReconnectInterval::Exponential { factor, .. } = interval {
      assert!(factor > 1.0, "Backoff factor must be greater than 1.0");
    }
    Self { interval, max_attempts, current_attempt: AtomicU32::new(0) }
  }

  /// Sets the exponential backoff factor. Has no effect on fixed policies.
  ///
  /// # Panics
  ///
  /// Panics if `factor` is not greater than 1.0.
  pub fn with_factor(mut self, new_factor: f64) -> Self {
    assert!(new_factor > 1.0, "Backoff factor must be greater than 1.0");
    if let ReconnectInterval::Exponential { ref mut factor, .. } = self.interval {
      *factor = new_factor;
    }
    self
  }

  /// Returns the configured attempt budget, `None` when unbounded.
  pub fn max_attempts(&self) -> Option<u32> {
    self.max_attempts
  }

  /// Returns the number of attempts recorded since the last counting reset.
  pub fn current_attempt(&self) -> u32 {
    self.current_attempt.load(Ordering::SeqCst)
  }

  /// Reports whether the attempt budget has been used up.
  pub fn are_attempts_complete(&self) -> bool {
    match self.max_attempts {
      Some(max) => self.current_attempt() >= max,
      None => false,
    }
  }

  /// Records one finished attempt. Called after the attempt, not before.
  pub fn process_values(&self) {
    let _ = self.current_attempt.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| Some(cur.saturating_add(1)));
  }

  /// Returns how long to wait before the next attempt.
  pub fn reconnect_interval(&self) -> Duration {
    match self.interval {
      ReconnectInterval::Fixed(interval) => interval,
      ReconnectInterval::Exponential { initial_delay, max_delay, factor } => {
        let exponent = i32::try_from(self.current_attempt()).unwrap_or(i32::MAX);
        let secs = initial_delay.as_secs_f64() * factor.powi(exponent);

        if !secs.is_finite() || secs >= max_delay.as_secs_f64() {
          max_delay
        } else {
          Duration::from_secs_f64(secs)
        }
      },
    }
  }

  /// Resets the attempt counter, unless the reset comes from a reconnect.
  ///
  /// A reconnect-triggered reset keeps the counter so that repeated drops
  /// share one budget.
  pub fn reset(&self, is_reconnect_trigger: bool) {
    if !is_reconnect_trigger {
      self.current_attempt.store(0, Ordering::SeqCst);
    }
  }
}

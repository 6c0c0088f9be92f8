// SPDX-License-Identifier: AGPL-3.0-only

use tokio_util::sync::CancellationToken;

use crate::event::EventBus;
use crate::throttle::Category;

/// The seam between the controller and its background services.
///
/// The watchdog, the listener, the keepalive and the throttling pipeline only
/// observe connectivity and request work through this trait; none of them
/// touch the transport directly.
#[async_trait::async_trait]
pub trait Link: Send + Sync + 'static {
  /// The client identifier used to tag log lines.
  fn client_id(&self) -> &str;

  /// Reports whether the current epoch's transport is connected.
  fn is_connected(&self) -> bool;

  /// The event bus used to notify callers.
  fn events(&self) -> &EventBus;

  /// Writes a payload to the transport inside the send critical section.
  async fn write(&self, payload: &str) -> anyhow::Result<()>;

  /// Waits for the next inbound payload of the epoch owning `cancellation`.
  ///
  /// Returns `Ok(None)` once that epoch has been cancelled.
  async fn receive(&self, cancellation: &CancellationToken) -> anyhow::Result<Option<String>>;

  /// Enqueues a payload on the throttling pipeline.
  fn enqueue(&self, payload: String, category: Category) -> bool;

  /// Closes and reopens the transport while keeping the reconnection budget.
  ///
  /// Leaves the watchdog running. Returns `true` once connected again.
  async fn reconnect_internal(&self) -> bool;

  /// Performs a full close, stopping the watchdog first.
  async fn close(&self);
}

// SPDX-License-Identifier: AGPL-3.0-only

//! # Relink Client Library
//!
//! A resilient, rate-limited connection runtime for chat and pub/sub style
//! protocols.
//!
//! A [`Controller`] drives a pluggable [`Transport`] through its lifecycle:
//!
//! - **Connect loop**: every open or reconnect creates a fresh transport and
//!   retries according to a [`ReconnectionPolicy`].
//! - **Throttling**: outbound payloads are queued per [`Category`] and paced so
//!   each category stays within its window budget.
//! - **Watchdog**: a background poller detects lost connections and reopens
//!   them without resetting the reconnection budget.
//! - **Events**: inbound payloads and lifecycle changes are delivered as
//!   [`Event`]s, either to [`EventHandler`]s or through an event stream.
//!
//! ## Example
//!
//! ```ignore
//! use relink_client::{Config, Controller};
//! use relink_util::conn::{LineTransportFactory, TransportConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let transport_config = TransportConfig { address: "127.0.0.1:6667".to_string(), ..Default::default() };
//! let controller = Controller::new(Config::default(), LineTransportFactory::new(transport_config)?)?;
//!
//! if controller.open().await {
//!   controller.send("hello");
//! }
//! controller.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod controller;
pub mod event;
pub mod scope;
pub mod services;
pub mod throttle;
pub mod watchdog;

mod link;

pub use config::{CategoryLimits, Config, ReconnectConfig, ThrottlingConfig};
pub use controller::{Controller, State};
pub use event::{Event, EventBus, EventHandler, FatalReason, Throttled};
pub use link::Link;
pub use scope::CancellationScope;
pub use throttle::Category;

pub use relink_util::backoff::ReconnectionPolicy;
pub use relink_util::conn::{Transport, TransportFactory};

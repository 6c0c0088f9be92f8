// SPDX-License-Identifier: AGPL-3.0-only

use std::path::Path;
use std::time::Duration;

use anyhow::anyhow;
use serde_derive::{Deserialize, Serialize};

use relink_util::backoff::{ReconnectInterval, ReconnectionPolicy};

/// Reconnection strategy configuration.
///
/// An absent `max_attempts` means the attempt budget is unbounded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ReconnectConfig {
  /// Waits a constant interval between attempts.
  Fixed {
    #[serde(default = "default_fixed_interval", with = "humantime_serde")]
    interval: Duration,

    #[serde(default)]
    max_attempts: Option<u32>,
  },

  /// Exponential backoff capped at `max_delay`.
  Exponential {
    #[serde(default = "default_backoff_initial_delay", with = "humantime_serde")]
    initial_delay: Duration,

    #[serde(default = "default_backoff_max_delay", with = "humantime_serde")]
    max_delay: Duration,

    #[serde(default = "default_backoff_factor")]
    factor: f64,

    #[serde(default)]
    max_attempts: Option<u32>,
  },

  /// A single connect attempt, no automatic reconnection.
  Disabled,
}

impl Default for ReconnectConfig {
  fn default() -> Self {
    ReconnectConfig::Exponential {
      initial_delay: default_backoff_initial_delay(),
      max_delay: default_backoff_max_delay(),
      factor: default_backoff_factor(),
      max_attempts: Some(10),
    }
  }
}

// === impl ReconnectConfig ===

impl ReconnectConfig {
  /// Validates the configuration.
  pub fn validate(&self) -> anyhow::Result<()> {
    match self {
      ReconnectConfig::Fixed { max_attempts, .. } => validate_max_attempts(*max_attempts),
      ReconnectConfig::Exponential { initial_delay, max_delay, factor, max_attempts } => {
        if initial_delay.is_zero() {
          return Err(anyhow!("backoff initial delay must be greater than 0"));
        }
        if max_delay < initial_delay {
          return Err(anyhow!("backoff max delay must not be lower than the initial delay"));
        }
        if !factor.is_finite() || *factor <= 1.0 {
          return Err(anyhow!("backoff factor must be greater than 1.0"));
        }
        validate_max_attempts(*max_attempts)
      },
      ReconnectConfig::Disabled => Ok(()),
    }
  }
}

fn validate_max_attempts(max_attempts: Option<u32>) -> anyhow::Result<()> {
  if max_attempts == Some(0) {
    return Err(anyhow!("max attempts must be greater than 0"));
  }
  Ok(())
}

impl From<&ReconnectConfig> for ReconnectionPolicy {
  fn from(val: &ReconnectConfig) -> Self {
    match *val {
      ReconnectConfig::Fixed { interval, max_attempts } => ReconnectionPolicy::fixed(interval, max_attempts),
      ReconnectConfig::Exponential { initial_delay, max_delay, factor, max_attempts } => {
        ReconnectionPolicy::new(ReconnectInterval::Exponential { initial_delay, max_delay, factor }, max_attempts)
      },
      ReconnectConfig::Disabled => ReconnectionPolicy::no_reconnect(),
    }
  }
}

/// Rate limit and queueing limits of a single message category.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CategoryLimits {
  /// The number of sends admitted per window.
  #[serde(default = "default_allowed_in_window")]
  pub allowed_in_window: u32,

  /// The length of a throttling window.
  #[serde(default = "default_window", with = "humantime_serde")]
  pub window: Duration,

  /// The maximum number of queued payloads.
  #[serde(default = "default_queue_capacity")]
  pub capacity: usize,

  /// How long a queued payload stays worth sending.
  #[serde(default = "default_item_ttl", with = "humantime_serde")]
  pub item_ttl: Duration,
}

impl CategoryLimits {
  fn validate(&self, name: &str) -> anyhow::Result<()> {
    if self.allowed_in_window == 0 {
      return Err(anyhow!("{} allowed_in_window must be greater than 0", name));
    }
    if self.window.is_zero() {
      return Err(anyhow!("{} window must be greater than 0", name));
    }
    if self.capacity == 0 {
      return Err(anyhow!("{} capacity must be greater than 0", name));
    }
    if self.item_ttl.is_zero() {
      return Err(anyhow!("{} item_ttl must be greater than 0", name));
    }
    Ok(())
  }
}

/// Throttling configuration for every message category.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThrottlingConfig {
  /// Limits for regular messages.
  #[serde(default = "default_message_limits")]
  pub message: CategoryLimits,

  /// Limits for whispers.
  #[serde(default = "default_whisper_limits")]
  pub whisper: CategoryLimits,

  /// Queue capacity of the control (bypass) category, which is never rate limited.
  #[serde(default = "default_queue_capacity")]
  pub control_capacity: usize,
}

impl Default for ThrottlingConfig {
  fn default() -> Self {
    Self {
      message: default_message_limits(),
      whisper: default_whisper_limits(),
      control_capacity: default_queue_capacity(),
    }
  }
}

// Connection controller configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
  /// Identifier attached to every log line of this client.
  #[serde(default = "default_client_id")]
  pub client_id: String,

  /// The reconnection strategy.
  #[serde(default)]
  pub reconnect: ReconnectConfig,

  /// Upper bound of a single connect attempt.
  #[serde(default = "default_connect_timeout", with = "humantime_serde")]
  pub connect_timeout: Duration,

  /// Upper bound on how long a close waits for epoch workers to finish.
  #[serde(default = "default_disconnect_wait", with = "humantime_serde")]
  pub disconnect_wait: Duration,

  /// Pacing delay between two dequeues of a category sender.
  #[serde(default = "default_send_delay", with = "humantime_serde")]
  pub send_delay: Duration,

  /// Poll interval of the connection watchdog.
  #[serde(default = "default_watchdog_interval", with = "humantime_serde")]
  pub watchdog_interval: Duration,

  /// Interval of the keepalive sent on the control category. Disabled when absent.
  #[serde(default, with = "humantime_serde")]
  pub keepalive_interval: Option<Duration>,

  /// The keepalive payload.
  #[serde(default = "default_keepalive_payload")]
  pub keepalive_payload: String,

  /// Buffer size of each event stream handed out by the controller.
  #[serde(default = "default_event_buffer_size")]
  pub event_buffer_size: usize,

  /// Per-category throttling.
  #[serde(default)]
  pub throttling: ThrottlingConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      client_id: default_client_id(),
      reconnect: ReconnectConfig::default(),
      connect_timeout: default_connect_timeout(),
      disconnect_wait: default_disconnect_wait(),
      send_delay: default_send_delay(),
      watchdog_interval: default_watchdog_interval(),
      keepalive_interval: None,
      keepalive_payload: default_keepalive_payload(),
      event_buffer_size: default_event_buffer_size(),
      throttling: ThrottlingConfig::default(),
    }
  }
}

// === impl Config ===

impl Config {
  /// Parses and validates a configuration from TOML text.
  pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
    let config: Config = toml::from_str(content).map_err(|e| anyhow!("failed to parse config: {}", e))?;
    config.validate()?;
    Ok(config)
  }

  /// Reads, parses and validates a TOML configuration file.
  pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
    let path = path.as_ref();
    let content =
      std::fs::read_to_string(path).map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    Self::from_toml_str(&content)
  }

  /// Validates the configuration.
  pub fn validate(&self) -> anyhow::Result<()> {
    self.reconnect.validate()?;

    if self.connect_timeout.is_zero() {
      return Err(anyhow!("connect timeout must be greater than 0"));
    }

    if self.send_delay.is_zero() {
      return Err(anyhow!("send delay must be greater than 0"));
    }

    if self.watchdog_interval.is_zero() {
      return Err(anyhow!("watchdog interval must be greater than 0"));
    }

    if let Some(keepalive_interval) = self.keepalive_interval
      && keepalive_interval.is_zero()
    {
      return Err(anyhow!("keepalive interval must be greater than 0"));
    }

    if self.event_buffer_size == 0 {
      return Err(anyhow!("event buffer size must be greater than 0"));
    }

    self.throttling.message.validate("message")?;
    self.throttling.whisper.validate("whisper")?;

    if self.throttling.control_capacity == 0 {
      return Err(anyhow!("control capacity must be greater than 0"));
    }

    Ok(())
  }
}

fn default_client_id() -> String {
  "relink".to_string()
}

fn default_fixed_interval() -> Duration {
  Duration::from_secs(3)
}

fn default_backoff_initial_delay() -> Duration {
  Duration::from_secs(1)
}

fn default_backoff_max_delay() -> Duration {
  Duration::from_secs(30)
}

fn default_backoff_factor() -> f64 {
  2.0
}

fn default_connect_timeout() -> Duration {
  Duration::from_secs(10)
}

fn default_disconnect_wait() -> Duration {
  Duration::from_millis(1500)
}

fn default_send_delay() -> Duration {
  Duration::from_millis(50)
}

fn default_watchdog_interval() -> Duration {
  Duration::from_millis(200)
}

fn default_keepalive_payload() -> String {
  "PING".to_string()
}

fn default_event_buffer_size() -> usize {
  1024
}

fn default_allowed_in_window() -> u32 {
  100
}

fn default_window() -> Duration {
  Duration::from_secs(30)
}

fn default_queue_capacity() -> usize {
  10_000
}

fn default_item_ttl() -> Duration {
  Duration::from_secs(30 * 60)
}

fn default_message_limits() -> CategoryLimits {
  CategoryLimits {
    allowed_in_window: default_allowed_in_window(),
    window: default_window(),
    capacity: default_queue_capacity(),
    item_ttl: default_item_ttl(),
  }
}

fn default_whisper_limits() -> CategoryLimits {
  CategoryLimits { window: Duration::from_secs(60), ..default_message_limits() }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_config_is_valid() {
    let config = Config::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.disconnect_wait, Duration::from_millis(1500));
    assert_eq!(config.watchdog_interval, Duration::from_millis(200));
    assert_eq!(config.throttling.whisper.window, Duration::from_secs(60));
  }

  #[test]
  fn test_empty_toml_yields_defaults() -> anyhow::Result<()> {
    assert_eq!(Config::from_toml_str("")?, Config::default());
    Ok(())
  }

  #[test]
  fn test_parse_full_toml() -> anyhow::Result<()> {
    let config = Config::from_toml_str(
      r#"
      client_id = "bot"
      connect_timeout = "2s"
      disconnect_wait = "100ms"
      keepalive_interval = "4m"

      [reconnect]
      strategy = "fixed"
      interval = "500ms"
      max_attempts = 3

      [throttling.message]
      allowed_in_window = 20
      window = "30s"

      [throttling.whisper]
      allowed_in_window = 3
      window = "1s"
      capacity = 5
      item_ttl = "10s"
      "#,
    )?;

    assert_eq!(config.client_id, "bot");
    assert_eq!(config.connect_timeout, Duration::from_secs(2));
    assert_eq!(config.keepalive_interval, Some(Duration::from_secs(240)));
    assert_eq!(config.reconnect, ReconnectConfig::Fixed { interval: Duration::from_millis(500), max_attempts: Some(3) });
    assert_eq!(config.throttling.message.allowed_in_window, 20);
    assert_eq!(config.throttling.message.capacity, 10_000);
    assert_eq!(config.throttling.whisper.capacity, 5);
    assert_eq!(config.throttling.whisper.item_ttl, Duration::from_secs(10));
    Ok(())
  }

  #[test]
  fn test_exponential_without_budget_is_unbounded() -> anyhow::Result<()> {
    let config = Config::from_toml_str(
      r#"
      [reconnect]
      strategy = "exponential"
      initial_delay = "100ms"
      max_delay = "5s"
      "#,
    )?;

    let policy = ReconnectionPolicy::from(&config.reconnect);
    assert_eq!(policy.max_attempts(), None);
    assert_eq!(policy.reconnect_interval(), Duration::from_millis(100));
    Ok(())
  }

  #[test]
  fn test_disabled_reconnect_maps_to_single_attempt() -> anyhow::Result<()> {
    let config = Config::from_toml_str(
      r#"
      [reconnect]
      strategy = "disabled"
      "#,
    )?;

    let policy = ReconnectionPolicy::from(&config.reconnect);
    assert_eq!(policy.max_attempts(), Some(1));
    assert_eq!(policy.reconnect_interval(), Duration::ZERO);
    Ok(())
  }

  #[test]
  fn test_invalid_configs_rejected() {
    let mut config = Config::default();
    config.connect_timeout = Duration::ZERO;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.throttling.message.allowed_in_window = 0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.throttling.whisper.capacity = 0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.reconnect = ReconnectConfig::Fixed { interval: Duration::from_secs(1), max_attempts: Some(0) };
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.reconnect = ReconnectConfig::Exponential {
      initial_delay: Duration::from_secs(1),
      max_delay: Duration::from_secs(10),
      factor: 1.0,
      max_attempts: None,
    };
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.keepalive_interval = Some(Duration::ZERO);
    assert!(config.validate().is_err());

    assert!(Config::from_toml_str("connect_timeout = \"soon\"").is_err());
  }
}

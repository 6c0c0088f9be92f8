// SPDX-License-Identifier: AGPL-3.0-only

use std::io::stdout;

use anyhow::anyhow;
use serde_derive::{Deserialize, Serialize};
use tracing::metadata::LevelFilter;
use tracing_subscriber::fmt;

/// Configuration for the logging system
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
  /// the logging level
  #[serde(default = "default_level")]
  pub level: String,

  /// the logging format, either "text" or "json"
  #[serde(default = "default_format")]
  pub format: String,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self { level: default_level(), format: default_format() }
  }
}

fn default_level() -> String {
  "info".to_string()
}

fn default_format() -> String {
  "text".to_string()
}

// === impl LoggingConfig ===

impl LoggingConfig {
  /// Resolves the configured level into a tracing level filter.
  pub fn level_filter(&self) -> anyhow::Result<LevelFilter> {
    match self.level.to_lowercase().as_str() {
      "trace" => Ok(LevelFilter::TRACE),
      "debug" => Ok(LevelFilter::DEBUG),
      "info" => Ok(LevelFilter::INFO),
      "warn" => Ok(LevelFilter::WARN),
      "error" => Ok(LevelFilter::ERROR),
      _ => Err(anyhow!("invalid logging level: {}", self.level)),
    }
  }

  /// Validates the configuration.
  pub fn validate(&self) -> anyhow::Result<()> {
    self.level_filter()?;

    match self.format.as_str() {
      "json" | "text" => Ok(()),
      _ => Err(anyhow!("invalid logging format: {}", self.format)),
    }
  }
}

/// Initializes the global tracing subscriber based on the provided configuration.
///
/// # Errors
///
/// Returns an error if the level or format are invalid, or if a global
/// subscriber has already been installed.
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
  config.validate()?;

  let level_filter = config.level_filter()?;

  match config.format.as_str() {
    "json" => init_json_logger(level_filter),
    _ => init_text_logger(level_filter),
  }
}

fn init_json_logger(level_filter: LevelFilter) -> anyhow::Result<()> {
  use tracing_subscriber::prelude::*;

  let fmt_layer =
    fmt::Layer::new().json().with_target(false).with_timer(fmt::time::UtcTime::rfc_3339()).with_writer(stdout);

  tracing_subscriber::registry()
    .with(fmt_layer.with_filter(level_filter))
    .try_init()
    .map_err(|e| anyhow!("failed to initialize logger: {}", e))
}

fn init_text_logger(level_filter: LevelFilter) -> anyhow::Result<()> {
  use tracing_subscriber::prelude::*;

  let fmt_layer = fmt::Layer::new()
    .with_target(false)
    .with_file(false)
    .with_line_number(false)
    .with_writer(stdout)
    .compact();

  tracing_subscriber::registry()
    .with(fmt_layer.with_filter(level_filter))
    .try_init()
    .map_err(|e| anyhow!("failed to initialize logger: {}", e))
}

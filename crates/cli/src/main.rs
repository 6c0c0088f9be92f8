// SPDX-License-Identifier: AGPL-3.0-only

use std::fs;

use anyhow::anyhow;
use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio_stream::StreamExt;
use tracing::{error, info};

use relink_client::{Controller, Event};
use relink_util::conn::{LineTransportFactory, TransportConfig};
use relink_util::telemetry::{self, LoggingConfig};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "relink")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Line-oriented client with automatic reconnection and rate limiting", long_about = None)]
struct Cli {
  /// Path to the TOML configuration file
  #[arg(short, long, default_value = "relink.toml")]
  config: String,

  /// Server address, overriding the configuration file
  #[arg(short, long)]
  address: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Config {
  #[serde(default)]
  telemetry: LoggingConfig,

  #[serde(default)]
  client: relink_client::Config,

  #[serde(default)]
  transport: TransportConfig,
}

/// A line typed by the user.
#[derive(Debug, PartialEq, Eq)]
enum Command {
  Send(String),
  Whisper(String),
  Reconnect,
  Quit,
  Empty,
}

// === impl Command ===

impl Command {
  fn parse(line: &str) -> Command {
    let line = line.trim_end_matches(['\r', '\n']);

    match line.trim() {
      "" => Command::Empty,
      "/quit" => Command::Quit,
      "/reconnect" => Command::Reconnect,
      _ => match line.strip_prefix("/w ") {
        Some(text) => Command::Whisper(text.to_string()),
        None => Command::Send(line.to_string()),
      },
    }
  }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let cli = Cli::parse();

  let mut cfg = load_config(&cli.config)?;
  if let Some(address) = cli.address {
    cfg.transport.address = address;
  }

  telemetry::init(&cfg.telemetry)?;

  match run(cfg).await {
    Ok(()) => Ok(()),
    Err(e) => {
      error!("relink failed: {}", e);
      Err(e)
    },
  }
}

async fn run(cfg: Config) -> anyhow::Result<()> {
  cfg.transport.validate()?;

  let factory = LineTransportFactory::new(cfg.transport.clone())?;
  let controller = Controller::new(cfg.client, factory)?;

  let mut events = controller.event_stream();
  let printer = tokio::spawn(async move {
    while let Some(event) = events.next().await {
      print_event(&event);
    }
  });

  info!(client_id = controller.client_id(), address = cfg.transport.address.as_str(), "connecting");
  if !controller.open().await {
    controller.shutdown().await;
    printer.abort();
    return Err(anyhow!("unable to connect to {}", cfg.transport.address));
  }

  let mut lines = BufReader::new(tokio::io::stdin()).lines();

  loop {
    let line = tokio::select! {
      _ = signal::ctrl_c() => break,
      line = lines.next_line() => line?,
    };
    let Some(line) = line else {
      break;
    };

    match Command::parse(&line) {
      Command::Empty => {},
      Command::Quit => break,
      Command::Reconnect => {
        if !controller.reconnect().await {
          eprintln!("! reconnect failed");
        }
      },
      Command::Whisper(text) => {
        if !controller.whisper(text) {
          eprintln!("! whisper rejected");
        }
      },
      Command::Send(text) => {
        if !controller.send(text) {
          eprintln!("! message rejected");
        }
      },
    }
  }

  info!("shutting down");
  controller.shutdown().await;
  printer.abort();

  Ok(())
}

fn print_event(event: &Event) {
  match event {
    Event::Message(payload) => println!("{}", payload),
    Event::Connected => eprintln!("* connected"),
    Event::Reconnected => eprintln!("* reconnected"),
    Event::Disconnected => eprintln!("* disconnected"),
    Event::Error(e) => eprintln!("! error: {}", e),
    Event::Fatal(reason) => eprintln!("! fatal: {}", reason),
    Event::SendFailed { payload, error } => eprintln!("! failed to send {:?}: {}", payload, error),
    Event::MessageThrottled(throttled) | Event::WhisperThrottled(throttled) => eprintln!(
      "! throttled {:?}: {}/{} sent within {:?}",
      throttled.payload, throttled.sent_count, throttled.allowed_in_period, throttled.period
    ),
    Event::StateChanged { .. } => {},
  }
}

fn load_config(config_file: &str) -> anyhow::Result<Config> {
  let config: Config = match fs::read_to_string(config_file) {
    Ok(config_content) => parse_config(&config_content)
      .map_err(|err| anyhow!("failed to parse config file: {}, {}", config_file, err))?,
    Err(_) => Config::default(),
  };

  Ok(config)
}

fn parse_config(content: &str) -> anyhow::Result<Config> {
  let config: Config = toml::from_str(content)?;
  config.telemetry.validate()?;
  config.client.validate()?;
  Ok(config)
}

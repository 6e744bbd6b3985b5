// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use laudspeaker::{Config, ConnectListener, Delivery, Laudspeaker, Properties};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Sends a few events through the Laudspeaker SDK.
#[derive(Debug, Parser)]
#[command(name = "laudspeaker-demo", version)]
struct Args {
	/// Project API key
	#[arg(long, env = "LAUDSPEAKER_API_KEY")]
	api_key: Option<String>,

	/// API host
	#[arg(long, env = "LAUDSPEAKER_HOST")]
	host: Option<String>,

	/// TOML configuration file
	#[arg(long, short = 'c')]
	config: Option<PathBuf>,

	/// Deliver over the real-time channel instead of batches
	#[arg(long)]
	realtime: bool,

	/// Mark the real-time session as development traffic
	#[arg(long)]
	development: bool,

	/// Identify as this user before capturing
	#[arg(long, short = 'u')]
	user: Option<String>,

	/// Event to capture
	#[arg(long, short = 'e', default_value = "demo_event")]
	event: String,

	/// Event property as key=value; values are parsed as JSON when possible
	#[arg(long = "property", short = 'p', value_parser = parse_property)]
	properties: Vec<(String, Value)>,

	/// Seconds to keep the real-time channel open before closing
	#[arg(long, default_value = "2")]
	linger: u64,

	/// Verbose SDK diagnostics
	#[arg(long)]
	debug: bool,
}

fn parse_property(raw: &str) -> std::result::Result<(String, Value), String> {
	let (key, value) = raw
		.split_once('=')
		.ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
	let key = key.trim();
	if key.is_empty() {
		return Err("property key is empty".to_string());
	}
	let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
	Ok((key.to_string(), value))
}

struct LoggingListener;

impl ConnectListener for LoggingListener {
	fn on_connected(&self) {
		info!("Real-time channel up");
	}

	fn on_disconnected(&self) {
		warn!("Real-time channel down");
	}

	fn on_error(&self, message: &str) {
		warn!(reason = %message, "Real-time channel reported an error");
	}
}

fn build_config(args: &Args) -> Result<Config> {
	let mut config = match &args.config {
		Some(path) => Config::load(path)
			.with_context(|| format!("failed to load config from {}", path.display()))?,
		None => Config::default().with_env_overrides(),
	};

	if let Some(key) = &args.api_key {
		config.api_key = key.as_str().into();
	}
	if let Some(host) = &args.host {
		config = config.with_host(host);
	}
	if args.realtime {
		config = config.with_delivery(Delivery::Realtime);
	}
	if args.development {
		config = config.with_development(true);
	}
	if args.debug {
		config = config.with_debug(true);
	}

	if config.api_key.is_blank() {
		bail!("an API key is required (--api-key or LAUDSPEAKER_API_KEY)");
	}
	Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::registry()
		.with(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| "info".into()),
		)
		.with(tracing_subscriber::fmt::layer())
		.init();

	let args = Args::parse();
	let config = build_config(&args)?;
	let realtime = config.delivery == Delivery::Realtime;

	let sdk = Laudspeaker::new();
	sdk.setup(config);
	if !sdk.is_enabled() {
		bail!("Laudspeaker setup failed, see the log for details");
	}
	if realtime {
		sdk.add_connect_listener(Arc::new(LoggingListener));
	}

	if let Some(user) = &args.user {
		sdk.identify(user, Properties::new());
	}

	let properties = args
		.properties
		.iter()
		.fold(Properties::new(), |props, (key, value)| props.insert(key.as_str(), value.clone()));
	sdk.capture(&args.event, properties);
	info!(
		event = %args.event,
		distinct_id = %sdk.distinct_id().unwrap_or_default(),
		"Captured event"
	);

	if realtime && args.linger > 0 {
		tokio::time::sleep(Duration::from_secs(args.linger)).await;
	}
	sdk.flush().await;
	sdk.close().await;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn property_values_parse_as_json_when_possible() {
		assert_eq!(parse_property("amount=10").unwrap(), ("amount".to_string(), Value::from(10)));
		assert_eq!(parse_property("vip=true").unwrap().1, Value::Bool(true));
		assert_eq!(parse_property("plan=pro").unwrap().1, Value::String("pro".into()));
		assert_eq!(parse_property("note=a=b").unwrap().1, Value::String("a=b".into()));
	}

	#[test]
	fn malformed_properties_are_rejected() {
		assert!(parse_property("novalue").is_err());
		assert!(parse_property(" =1").is_err());
	}

	#[test]
	fn flags_override_configuration() {
		let args = Args::parse_from([
			"laudspeaker-demo",
			"--api-key",
			"k",
			"--host",
			"https://events.example.com",
			"--realtime",
			"-p",
			"amount=10",
		]);
		let config = build_config(&args).unwrap();
		assert_eq!(config.api_key.expose(), "k");
		assert_eq!(config.host, "https://events.example.com");
		assert_eq!(config.delivery, Delivery::Realtime);
		assert_eq!(args.properties.len(), 1);
	}
}

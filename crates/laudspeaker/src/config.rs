// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! SDK configuration.
//!
//! A [`Config`] can be built in code, parsed from TOML, or loaded from a file.
//! A small set of environment variables override whatever the file says:
//!
//! | Variable              | Field     |
//! |-----------------------|-----------|
//! | `LAUDSPEAKER_API_KEY` | `api_key` |
//! | `LAUDSPEAKER_HOST`    | `host`    |
//! | `LAUDSPEAKER_DEBUG`   | `debug`   |

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use laudspeaker_core::Properties;
use serde::Deserialize;
use url::Url;
use zeroize::Zeroize;

use crate::error::{LaudspeakerError, Result};

pub const DEFAULT_HOST: &str = "https://laudspeaker.com";
pub const DEFAULT_SDK_NAME: &str = "laudspeaker-rust";
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const ENV_API_KEY: &str = "LAUDSPEAKER_API_KEY";
pub const ENV_HOST: &str = "LAUDSPEAKER_HOST";
pub const ENV_DEBUG: &str = "LAUDSPEAKER_DEBUG";

/// API key wrapper that never prints its value and is wiped on drop.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct ApiKey(String);

impl ApiKey {
	pub fn new(key: impl Into<String>) -> Self {
		Self(key.into())
	}

	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_blank(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl Drop for ApiKey {
	fn drop(&mut self) {
		self.0.zeroize();
	}
}

impl std::fmt::Debug for ApiKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("ApiKey([REDACTED])")
	}
}

impl From<&str> for ApiKey {
	fn from(s: &str) -> Self {
		Self::new(s)
	}
}

impl From<String> for ApiKey {
	fn from(s: String) -> Self {
		Self::new(s)
	}
}

/// Which transport carries `capture`, `identify` and `set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
	/// Buffered events posted to the batch endpoint.
	#[default]
	Batch,
	/// Messages sent over the persistent real-time channel.
	Realtime,
}

/// Hook applied to merged event properties before they are queued.
pub trait PropertiesSanitizer: Send + Sync {
	fn sanitize(&self, properties: Properties) -> Properties;
}

impl<F> PropertiesSanitizer for F
where
	F: Fn(Properties) -> Properties + Send + Sync,
{
	fn sanitize(&self, properties: Properties) -> Properties {
		self(properties)
	}
}

/// Configuration for the Laudspeaker SDK.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
	pub api_key: ApiKey,
	/// Endpoint base URL.
	pub host: String,
	/// Buffered event count that triggers a flush.
	pub flush_at: usize,
	/// Periodic flush interval.
	pub flush_interval_seconds: u64,
	/// Buffer cap; the oldest events are dropped beyond it.
	pub max_queue_size: usize,
	/// Upper bound on events per outgoing batch.
	pub max_batch_size: usize,
	/// Raises SDK diagnostics from `debug` to `info`.
	pub debug: bool,
	/// Namespace for persisted keys and the outbox file.
	pub storage_prefix: Option<String>,
	/// Directory for persisted state. Defaults to the platform data dir.
	pub storage_dir: Option<PathBuf>,
	/// Send the push token at setup and after a server customer id change.
	pub automated_push: bool,
	/// Marks the real-time session as a development session.
	pub development: bool,
	pub delivery: Delivery,
	pub request_timeout_secs: u64,
	pub reconnect_initial_delay_ms: u64,
	pub reconnect_max_delay_ms: u64,
	/// Platform tag sent with push tokens.
	pub push_platform: String,
	pub sdk_name: String,
	pub sdk_version: String,
	#[serde(skip)]
	pub sanitizer: Option<Arc<dyn PropertiesSanitizer>>,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			api_key: ApiKey::default(),
			host: DEFAULT_HOST.to_string(),
			flush_at: 1,
			flush_interval_seconds: 1,
			max_queue_size: 1000,
			max_batch_size: 50,
			debug: false,
			storage_prefix: None,
			storage_dir: None,
			automated_push: false,
			development: false,
			delivery: Delivery::Batch,
			request_timeout_secs: 30,
			reconnect_initial_delay_ms: 1_000,
			reconnect_max_delay_ms: 32_000,
			push_platform: "Android".to_string(),
			sdk_name: DEFAULT_SDK_NAME.to_string(),
			sdk_version: SDK_VERSION.to_string(),
			sanitizer: None,
		}
	}
}

impl std::fmt::Debug for Config {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Config")
			.field("api_key", &self.api_key)
			.field("host", &self.host)
			.field("flush_at", &self.flush_at)
			.field("flush_interval_seconds", &self.flush_interval_seconds)
			.field("max_queue_size", &self.max_queue_size)
			.field("max_batch_size", &self.max_batch_size)
			.field("debug", &self.debug)
			.field("storage_prefix", &self.storage_prefix)
			.field("storage_dir", &self.storage_dir)
			.field("automated_push", &self.automated_push)
			.field("development", &self.development)
			.field("delivery", &self.delivery)
			.field("sanitizer", &self.sanitizer.is_some())
			.finish_non_exhaustive()
	}
}

impl Config {
	pub fn new(api_key: impl Into<ApiKey>) -> Self {
		Self {
			api_key: api_key.into(),
			..Self::default()
		}
	}

	pub fn from_toml_str(s: &str) -> Result<Self> {
		Ok(toml::from_str(s)?)
	}

	/// Reads a TOML file, then applies environment overrides.
	pub fn load(path: impl AsRef<Path>) -> Result<Self> {
		let contents = std::fs::read_to_string(path.as_ref())?;
		Ok(Self::from_toml_str(&contents)?.with_env_overrides())
	}

	pub fn with_env_overrides(self) -> Self {
		self.with_overrides_from(|name| std::env::var(name).ok())
	}

	fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
		if let Some(key) = lookup(ENV_API_KEY) {
			self.api_key = ApiKey::new(key);
		}
		if let Some(host) = lookup(ENV_HOST) {
			self.host = host;
		}
		if let Some(debug) = lookup(ENV_DEBUG) {
			self.debug = matches!(debug.trim().to_lowercase().as_str(), "1" | "true" | "yes");
		}
		self
	}

	pub fn with_host(mut self, host: impl Into<String>) -> Self {
		self.host = host.into();
		self
	}

	pub fn with_flush_at(mut self, flush_at: usize) -> Self {
		self.flush_at = flush_at;
		self
	}

	pub fn with_flush_interval_seconds(mut self, seconds: u64) -> Self {
		self.flush_interval_seconds = seconds;
		self
	}

	pub fn with_max_queue_size(mut self, size: usize) -> Self {
		self.max_queue_size = size;
		self
	}

	pub fn with_max_batch_size(mut self, size: usize) -> Self {
		self.max_batch_size = size;
		self
	}

	pub fn with_debug(mut self, debug: bool) -> Self {
		self.debug = debug;
		self
	}

	pub fn with_storage_prefix(mut self, prefix: impl Into<String>) -> Self {
		self.storage_prefix = Some(prefix.into());
		self
	}

	pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
		self.storage_dir = Some(dir.into());
		self
	}

	pub fn with_automated_push(mut self, enabled: bool) -> Self {
		self.automated_push = enabled;
		self
	}

	pub fn with_development(mut self, development: bool) -> Self {
		self.development = development;
		self
	}

	pub fn with_delivery(mut self, delivery: Delivery) -> Self {
		self.delivery = delivery;
		self
	}

	pub fn with_reconnect_delays(mut self, initial: Duration, max: Duration) -> Self {
		self.reconnect_initial_delay_ms = initial.as_millis() as u64;
		self.reconnect_max_delay_ms = max.as_millis() as u64;
		self
	}

	pub fn with_sdk(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
		self.sdk_name = name.into();
		self.sdk_version = version.into();
		self
	}

	pub fn with_sanitizer(mut self, sanitizer: impl PropertiesSanitizer + 'static) -> Self {
		self.sanitizer = Some(Arc::new(sanitizer));
		self
	}

	pub fn flush_interval(&self) -> Duration {
		Duration::from_secs(self.flush_interval_seconds)
	}

	pub fn request_timeout(&self) -> Duration {
		Duration::from_secs(self.request_timeout_secs)
	}

	pub fn reconnect_initial_delay(&self) -> Duration {
		Duration::from_millis(self.reconnect_initial_delay_ms)
	}

	pub fn reconnect_max_delay(&self) -> Duration {
		Duration::from_millis(self.reconnect_max_delay_ms)
	}

	pub fn prefix(&self) -> Option<&str> {
		self.storage_prefix.as_deref()
	}

	/// Directory holding persisted identity and the outbox.
	pub fn resolved_storage_dir(&self) -> PathBuf {
		self.storage_dir.clone().unwrap_or_else(|| {
			dirs::data_dir()
				.unwrap_or_else(std::env::temp_dir)
				.join("laudspeaker")
		})
	}

	/// Prefixed file name inside the storage directory.
	pub fn storage_file(&self, name: &str) -> PathBuf {
		let file = match self.prefix() {
			Some(p) if !p.is_empty() => format!("{p}{name}"),
			_ => name.to_string(),
		};
		self.resolved_storage_dir().join(file)
	}

	/// Host without trailing slashes.
	pub fn base_url(&self) -> &str {
		self.host.trim_end_matches('/')
	}

	pub fn validate(&self) -> Result<()> {
		if self.api_key.is_blank() {
			return Err(LaudspeakerError::InvalidApiKey);
		}

		let url = Url::parse(self.host.trim())
			.map_err(|e| LaudspeakerError::InvalidHost(format!("{}: {e}", self.host)))?;
		if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
			return Err(LaudspeakerError::InvalidHost(self.host.clone()));
		}

		if self.flush_at == 0 {
			return Err(LaudspeakerError::configuration("flush_at must be greater than 0"));
		}
		if self.max_batch_size == 0 {
			return Err(LaudspeakerError::configuration(
				"max_batch_size must be greater than 0",
			));
		}
		if self.max_queue_size == 0 {
			return Err(LaudspeakerError::configuration(
				"max_queue_size must be greater than 0",
			));
		}
		if self.flush_interval_seconds == 0 {
			return Err(LaudspeakerError::configuration(
				"flush_interval_seconds must be greater than 0",
			));
		}
		if self.reconnect_initial_delay_ms == 0
			|| self.reconnect_initial_delay_ms > self.reconnect_max_delay_ms
		{
			return Err(LaudspeakerError::configuration(
				"reconnect delays must satisfy 0 < initial <= max",
			));
		}
		Ok(())
	}
}

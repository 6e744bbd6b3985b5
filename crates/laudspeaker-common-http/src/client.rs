// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Shared HTTP client with the SDK User-Agent header.

use reqwest::{Client, ClientBuilder};
use std::time::Duration;

/// Formats the SDK User-Agent: `{sdk_name}/{sdk_version}`.
///
/// Example: `laudspeaker-rust/0.1.0`
pub fn user_agent(sdk_name: &str, sdk_version: &str) -> String {
	format!("{sdk_name}/{sdk_version}")
}

/// Creates a client builder with the given User-Agent.
///
/// Use this when you need to customize the client further.
///
/// # Example
/// ```ignore
/// let client = laudspeaker_common_http::builder("laudspeaker-rust/0.1.0")
///     .timeout(Duration::from_secs(30))
///     .build()?;
/// ```
pub fn builder(user_agent: impl Into<String>) -> ClientBuilder {
	Client::builder().user_agent(user_agent.into())
}

/// Creates a client with the given User-Agent and request timeout.
pub fn new_client_with_timeout(
	user_agent: impl Into<String>,
	timeout: Duration,
) -> Result<Client, reqwest::Error> {
	builder(user_agent).timeout(timeout).build()
}

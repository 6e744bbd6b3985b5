// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! HTTP delivery to the ingestion endpoints.

use chrono::Utc;
use laudspeaker_core::{BatchPayload, Event, Properties, SingleEventPayload};
use reqwest::{Client, Response};
use tracing::{debug, error};

use crate::config::{ApiKey, Config};
use crate::error::{LaudspeakerError, Result};
use crate::queue::BatchSender;

const BATCH_PATH: &str = "/events/batch/";
const SINGLE_EVENT_PATH: &str = "/events";

/// Posts event batches, and single events, with the API-key header.
///
/// Failures are classified and returned; this type never retries.
#[derive(Clone)]
pub struct BatchTransport {
	http: Client,
	api_key: ApiKey,
	base_url: String,
	verbose: bool,
}

impl BatchTransport {
	pub fn new(config: &Config) -> Result<Self> {
		let user_agent = laudspeaker_common_http::user_agent(&config.sdk_name, &config.sdk_version);
		let http = laudspeaker_common_http::new_client_with_timeout(&user_agent, config.request_timeout())?;
		Ok(Self::with_client(http, config))
	}

	pub fn with_client(http: Client, config: &Config) -> Self {
		Self {
			http,
			api_key: config.api_key.clone(),
			base_url: config.base_url().to_string(),
			verbose: config.debug,
		}
	}

	pub fn batch_url(&self) -> String {
		format!("{}{BATCH_PATH}", self.base_url)
	}

	pub fn single_event_url(&self) -> String {
		format!("{}{SINGLE_EVENT_PATH}", self.base_url)
	}

	fn authorization(&self) -> String {
		format!("Api-Key {}", self.api_key.expose())
	}

	/// Sends one batch stamped with the current time as `sentAt`.
	pub async fn send(&self, events: Vec<Event>) -> Result<()> {
		let count = events.len();
		let payload = BatchPayload::new(events, Utc::now());
		let url = self.batch_url();

		if self.verbose {
			let body = serde_json::to_string(&payload)?;
			crate::diag!(true, url = %url, count, body = %body, "Sending event batch");
		} else {
			debug!(url = %url, count, "Sending event batch");
		}

		let response = self
			.http
			.post(&url)
			.header("Authorization", self.authorization())
			.json(&payload)
			.send()
			.await?;

		check_status(response).await.map(|_| ())
	}

	/// Posts a single event to `{host}/events` and returns the status code.
	pub async fn fire_api(
		&self,
		event: &str,
		correlation_value: &str,
		payload: Properties,
	) -> Result<u16> {
		let body = SingleEventPayload::new(event, correlation_value, payload);
		let url = self.single_event_url();
		debug!(url = %url, event = %event, "Sending single event");

		let response = self
			.http
			.post(&url)
			.header("Authorization", self.authorization())
			.json(&body)
			.send()
			.await?;

		check_status(response).await
	}
}

async fn check_status(response: Response) -> Result<u16> {
	let status = response.status();
	if status.is_success() {
		return Ok(status.as_u16());
	}

	let message = status.canonical_reason().unwrap_or("unknown status").to_string();
	let body = response.text().await.unwrap_or_default();
	error!(status = status.as_u16(), message = %message, body = %body, "Laudspeaker API request failed");
	Err(LaudspeakerError::Api {
		status: status.as_u16(),
		message,
		body,
	})
}

#[async_trait::async_trait]
impl BatchSender for BatchTransport {
	async fn send_batch(&self, events: Vec<Event>) -> Result<()> {
		self.send(events).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::Value;
	use wiremock::matchers::{header, method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	fn transport(server: &MockServer) -> BatchTransport {
		let config = Config::new("test-key")
			.with_host(format!("{}/", server.uri()))
			.with_sdk("laudspeaker-test", "9.9.9");
		BatchTransport::new(&config).unwrap()
	}

	#[tokio::test]
	async fn send_posts_batch_with_headers() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/events/batch/"))
			.and(header("Authorization", "Api-Key test-key"))
			.and(header("User-Agent", "laudspeaker-test/9.9.9"))
			.and(header("Content-Type", "application/json"))
			.respond_with(ResponseTemplate::new(200))
			.expect(1)
			.mount(&server)
			.await;

		let events = vec![
			Event::new("$identify", "anon-1", Properties::new().insert("distinct_id", "u")),
			Event::new("purchase", "u", Properties::new().insert("amount", 10)),
		];
		transport(&server).send(events).await.unwrap();

		let requests = server.received_requests().await.unwrap();
		let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
		assert!(body["sentAt"].is_string());
		assert_eq!(body["events"][0]["event"], "$identify");
		assert_eq!(body["events"][1]["correlationKey"], "_id");
		assert_eq!(body["events"][1]["correlationValue"], "u");
		assert_eq!(body["events"][1]["source"], "mobile");
		assert_eq!(body["events"][1]["payload"]["amount"], 10);
	}

	#[tokio::test]
	async fn non_success_status_is_classified() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/events/batch/"))
			.respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
			.mount(&server)
			.await;

		let err = transport(&server)
			.send(vec![Event::new("e", "u", Properties::new())])
			.await
			.unwrap_err();

		match err {
			LaudspeakerError::Api {
				status,
				message,
				body,
			} => {
				assert_eq!(status, 503);
				assert_eq!(message, "Service Unavailable");
				assert_eq!(body, "maintenance");
			}
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[tokio::test]
	async fn unreachable_host_is_a_request_failure() {
		let config = Config::new("k").with_host("http://127.0.0.1:1");
		let err = BatchTransport::new(&config)
			.unwrap()
			.send(vec![Event::new("e", "u", Properties::new())])
			.await
			.unwrap_err();
		assert!(matches!(err, LaudspeakerError::RequestFailed(_)));
	}

	#[tokio::test]
	async fn fire_api_posts_single_event() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/events"))
			.and(header("Authorization", "Api-Key test-key"))
			.respond_with(ResponseTemplate::new(201))
			.expect(1)
			.mount(&server)
			.await;

		let status = transport(&server)
			.fire_api("signup", "user-7", Properties::new().insert("plan", "free"))
			.await
			.unwrap();
		assert_eq!(status, 201);

		let requests = server.received_requests().await.unwrap();
		let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
		assert_eq!(
			body,
			serde_json::json!({
				"correlationKey": "_id",
				"correlationValue": "user-7",
				"source": "mobile",
				"event": "signup",
				"payload": {"plan": "free"}
			})
		);
	}

	#[test]
	fn urls_strip_trailing_slash() {
		let config = Config::new("k").with_host("https://api.laudspeaker.com///");
		let transport = BatchTransport::with_client(Client::new(), &config);
		assert_eq!(transport.batch_url(), "https://api.laudspeaker.com/events/batch/");
		assert_eq!(transport.single_event_url(), "https://api.laudspeaker.com/events");
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Captured events and the batch ingestion payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::properties::Properties;

/// Field name identifying the subject of an event on the backend.
pub const CORRELATION_KEY: &str = "_id";
/// Source tag attached to every event produced by this SDK.
pub const EVENT_SOURCE: &str = "mobile";

/// Event name emitted by `identify`.
pub const IDENTIFY_EVENT: &str = "$identify";
/// Event name emitted by `set`.
pub const SET_EVENT: &str = "$set";
/// Event name carrying the device push token.
pub const PUSH_TOKEN_EVENT: &str = "$fcm";

/// Unique identifier generated for every captured event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}
}

impl Default for EventId {
	fn default() -> Self {
		Self::new()
	}
}

impl std::fmt::Display for EventId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl std::str::FromStr for EventId {
	type Err = uuid::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(Self(Uuid::parse_str(s)?))
	}
}

/// A user-attributed event waiting for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
	pub event: String,
	pub correlation_key: String,
	pub correlation_value: String,
	pub payload: Properties,
	pub timestamp: DateTime<Utc>,
	pub event_id: EventId,
	pub source: String,
}

impl Event {
	/// Builds an event attributed to `correlation_value`, stamped with the
	/// current time and a fresh event id.
	pub fn new(
		event: impl Into<String>,
		correlation_value: impl Into<String>,
		payload: Properties,
	) -> Self {
		Self {
			event: event.into(),
			correlation_key: CORRELATION_KEY.to_string(),
			correlation_value: correlation_value.into(),
			payload,
			timestamp: Utc::now(),
			event_id: EventId::new(),
			source: EVENT_SOURCE.to_string(),
		}
	}

	/// Overrides the capture timestamp (builder pattern).
	pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
		self.timestamp = timestamp;
		self
	}

	/// Returns the reason this event must not enter a queue, if any.
	pub fn validate(&self) -> Result<(), &'static str> {
		if self.event.trim().is_empty() {
			return Err("event name is empty");
		}
		if self.correlation_value.trim().is_empty() {
			return Err("correlation value is empty");
		}
		Ok(())
	}
}

/// Body of `POST {host}/events/batch/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPayload {
	pub events: Vec<Event>,
	pub sent_at: DateTime<Utc>,
}

impl BatchPayload {
	pub fn new(events: Vec<Event>, sent_at: DateTime<Utc>) -> Self {
		Self { events, sent_at }
	}
}

/// Body of `POST {host}/events`, the single-event delivery endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleEventPayload {
	pub correlation_key: String,
	pub correlation_value: String,
	pub source: String,
	pub event: String,
	pub payload: Properties,
}

impl SingleEventPayload {
	pub fn new(event: impl Into<String>, correlation_value: impl Into<String>, payload: Properties) -> Self {
		Self {
			correlation_key: CORRELATION_KEY.to_string(),
			correlation_value: correlation_value.into(),
			source: EVENT_SOURCE.to_string(),
			event: event.into(),
			payload,
		}
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Real-time channel messages.
//!
//! Every websocket frame is a JSON envelope `{"event": <channel>, "data": <json>}`.
//!
//! # Outbound
//!
//! | Channel     | Data                                               |
//! |-------------|----------------------------------------------------|
//! | `identify`  | `{"__PrimaryKey", "optionalProperties"?}`          |
//! | `set`       | `{"optionalProperties"}`                           |
//! | `fire`      | `{"eventName", "customerId", "payload": <string>}` |
//! | `fcm_token` | `{"type", "token"}`                                |
//! | `ping`      | `null`                                             |
//!
//! # Inbound
//!
//! `log` (string), `error` (any), `customerId` (string), `flush` (no data).

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::properties::Properties;

/// Name of the handshake frame carrying [`AuthParams`].
pub const AUTH_EVENT: &str = "auth";

/// Logical outbound message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
	Identify,
	Set,
	Fire,
	PushToken,
	Ping,
}

impl Channel {
	pub fn as_str(&self) -> &'static str {
		match self {
			Channel::Identify => "identify",
			Channel::Set => "set",
			Channel::Fire => "fire",
			Channel::PushToken => "fcm_token",
			Channel::Ping => "ping",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"identify" => Some(Channel::Identify),
			"set" => Some(Channel::Set),
			"fire" => Some(Channel::Fire),
			"fcm_token" => Some(Channel::PushToken),
			"ping" => Some(Channel::Ping),
			_ => None,
		}
	}
}

impl std::fmt::Display for Channel {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// A message the SDK sends over the real-time channel.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
	Identify {
		primary_key: String,
		optional_properties: Option<Properties>,
	},
	Set {
		optional_properties: Properties,
	},
	Fire {
		event_name: String,
		customer_id: String,
		payload: Properties,
	},
	PushToken {
		platform: String,
		token: String,
	},
	Ping,
}

#[derive(Serialize)]
struct IdentifyData<'a> {
	#[serde(rename = "__PrimaryKey")]
	primary_key: &'a str,
	#[serde(rename = "optionalProperties", skip_serializing_if = "Option::is_none")]
	optional_properties: Option<&'a Properties>,
}

#[derive(Serialize)]
struct SetData<'a> {
	#[serde(rename = "optionalProperties")]
	optional_properties: &'a Properties,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FireData<'a> {
	event_name: &'a str,
	customer_id: &'a str,
	payload: String,
}

#[derive(Serialize)]
struct PushTokenData<'a> {
	#[serde(rename = "type")]
	platform: &'a str,
	token: &'a str,
}

impl OutboundMessage {
	pub fn channel(&self) -> Channel {
		match self {
			OutboundMessage::Identify { .. } => Channel::Identify,
			OutboundMessage::Set { .. } => Channel::Set,
			OutboundMessage::Fire { .. } => Channel::Fire,
			OutboundMessage::PushToken { .. } => Channel::PushToken,
			OutboundMessage::Ping => Channel::Ping,
		}
	}

	/// Serializes the message body carried in the frame's `data` field.
	///
	/// The `fire` payload travels as a JSON string, not a nested object.
	pub fn to_data(&self) -> serde_json::Result<Value> {
		match self {
			OutboundMessage::Identify {
				primary_key,
				optional_properties,
			} => serde_json::to_value(IdentifyData {
				primary_key,
				optional_properties: optional_properties.as_ref(),
			}),
			OutboundMessage::Set {
				optional_properties,
			} => serde_json::to_value(SetData {
				optional_properties,
			}),
			OutboundMessage::Fire {
				event_name,
				customer_id,
				payload,
			} => serde_json::to_value(FireData {
				event_name,
				customer_id,
				payload: serde_json::to_string(payload)?,
			}),
			OutboundMessage::PushToken { platform, token } => {
				serde_json::to_value(PushTokenData { platform, token })
			}
			OutboundMessage::Ping => Ok(Value::Null),
		}
	}
}

/// Wire envelope for every real-time frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
	pub event: String,
	#[serde(default)]
	pub data: Value,
}

impl Frame {
	pub fn new(event: impl Into<String>, data: Value) -> Self {
		Self {
			event: event.into(),
			data,
		}
	}

	pub fn from_message(message: &OutboundMessage) -> serde_json::Result<Self> {
		Ok(Self::new(message.channel().as_str(), message.to_data()?))
	}

	pub fn auth(params: &AuthParams) -> serde_json::Result<Self> {
		Ok(Self::new(AUTH_EVENT, serde_json::to_value(params)?))
	}
}

/// A server-pushed message on the real-time channel.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
	/// Informational text from the backend.
	Log(String),
	/// Backend-reported error.
	Error(Value),
	/// Server-assigned customer id to adopt as the distinct id.
	CustomerId(String),
	/// Request to replay the durable outbox.
	Flush,
	/// Anything this SDK does not understand.
	Unknown { event: String, data: Value },
}

impl InboundMessage {
	pub fn event_type(&self) -> &str {
		match self {
			InboundMessage::Log(_) => "log",
			InboundMessage::Error(_) => "error",
			InboundMessage::CustomerId(_) => "customerId",
			InboundMessage::Flush => "flush",
			InboundMessage::Unknown { event, .. } => event,
		}
	}
}

impl From<Frame> for InboundMessage {
	fn from(frame: Frame) -> Self {
		let Frame { event, data } = frame;
		match event.as_str() {
			"log" => match data {
				Value::String(text) => InboundMessage::Log(text),
				other => InboundMessage::Log(other.to_string()),
			},
			"error" => InboundMessage::Error(data),
			"customerId" => match data {
				Value::String(id) => InboundMessage::CustomerId(id),
				data => InboundMessage::Unknown { event, data },
			},
			"flush" => InboundMessage::Flush,
			_ => InboundMessage::Unknown { event, data },
		}
	}
}

/// Handshake parameters sent when the real-time channel opens.
///
/// Rebuilt on every connect so a changed customer id is picked up.
#[derive(Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthParams {
	pub api_key: String,
	pub customer_id: String,
	#[serde(serialize_with = "serialize_development")]
	pub development: bool,
}

fn serialize_development<S: Serializer>(development: &bool, s: S) -> Result<S::Ok, S::Error> {
	s.serialize_str(if *development { "true" } else { "" })
}

impl std::fmt::Debug for AuthParams {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("AuthParams")
			.field("api_key", &"[REDACTED]")
			.field("customer_id", &self.customer_id)
			.field("development", &self.development)
			.finish()
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Line codec for the durable outbox.
//!
//! Each record is one line: `channel + ":" + message`. Channel names never
//! contain `:` and messages are compact JSON (no raw newlines), so the first
//! `:` on a line is always the separator.

use serde_json::Value;
use thiserror::Error;

use crate::message::{Channel, Frame, OutboundMessage};

#[derive(Debug, Error, PartialEq)]
pub enum OutboxDecodeError {
	#[error("record has no channel separator")]
	MissingSeparator,

	#[error("unknown channel: {0}")]
	UnknownChannel(String),

	#[error("record message is not valid JSON: {0}")]
	InvalidMessage(String),
}

/// A message persisted while the real-time channel was disconnected.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
	pub channel: Channel,
	/// Compact JSON of the frame's `data` field.
	pub message: String,
}

impl OutboxRecord {
	pub fn new(channel: Channel, message: impl Into<String>) -> Self {
		Self {
			channel,
			message: message.into(),
		}
	}

	pub fn from_message(message: &OutboundMessage) -> serde_json::Result<Self> {
		let data = message.to_data()?;
		Ok(Self::new(message.channel(), serde_json::to_string(&data)?))
	}

	/// Encodes the record as one outbox line, without the trailing newline.
	pub fn encode(&self) -> String {
		format!("{}:{}", self.channel.as_str(), self.message)
	}

	pub fn decode(line: &str) -> Result<Self, OutboxDecodeError> {
		let (channel, message) = line
			.split_once(':')
			.ok_or(OutboxDecodeError::MissingSeparator)?;
		let channel = Channel::parse(channel)
			.ok_or_else(|| OutboxDecodeError::UnknownChannel(channel.to_string()))?;
		serde_json::from_str::<Value>(message)
			.map_err(|e| OutboxDecodeError::InvalidMessage(e.to_string()))?;
		Ok(Self::new(channel, message))
	}

	/// Rebuilds the frame to re-emit on the real-time channel.
	pub fn to_frame(&self) -> serde_json::Result<Frame> {
		let data: Value = serde_json::from_str(&self.message)?;
		Ok(Frame::new(self.channel.as_str(), data))
	}
}

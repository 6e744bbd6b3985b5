// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the Laudspeaker SDK.

use laudspeaker_common_http::{is_retryable_status, RetryableError};
use thiserror::Error;

/// Laudspeaker SDK errors.
#[derive(Debug, Error)]
pub enum LaudspeakerError {
	/// API key is missing or blank.
	#[error("invalid API key: must not be empty")]
	InvalidApiKey,

	/// Host is missing or not an http(s) URL.
	#[error("invalid host: {0}")]
	InvalidHost(String),

	/// Any other configuration problem.
	#[error("configuration error: {0}")]
	Configuration(String),

	/// Configuration file could not be parsed.
	#[error("config parse error: {0}")]
	ConfigParse(#[from] toml::de::Error),

	/// `setup` was called on an SDK that is already set up.
	#[error("SDK is already set up")]
	AlreadySetUp,

	/// An operation was attempted before `setup`.
	#[error("SDK is not set up")]
	NotSetUp,

	/// Event or identity failed validation.
	#[error("validation failed: {0}")]
	Validation(String),

	/// HTTP request failed before a response arrived.
	#[error("HTTP request failed: {0}")]
	RequestFailed(#[from] reqwest::Error),

	/// Server answered outside the success range.
	#[error("API error ({status}): {message}")]
	Api {
		status: u16,
		message: String,
		body: String,
	},

	/// Opening the real-time channel failed.
	#[error("real-time connect failed: {0}")]
	ConnectFailed(String),

	/// The real-time channel is gone.
	#[error("real-time channel closed")]
	ChannelClosed,

	/// Event or message could not be serialized.
	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	/// Durable storage failed.
	#[error("storage error: {0}")]
	Storage(#[from] std::io::Error),

	/// Push token retrieval failed.
	#[error("push token unavailable: {0}")]
	PushToken(String),

	/// Client has been shut down.
	#[error("client has been shut down")]
	ClientShutdown,
}

/// Coarse error classes used for logging and handling decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
	Configuration,
	Validation,
	Transport,
	Serialization,
	Storage,
	Lifecycle,
}

impl LaudspeakerError {
	pub fn category(&self) -> ErrorCategory {
		match self {
			LaudspeakerError::InvalidApiKey
			| LaudspeakerError::InvalidHost(_)
			| LaudspeakerError::Configuration(_)
			| LaudspeakerError::ConfigParse(_)
			| LaudspeakerError::AlreadySetUp => ErrorCategory::Configuration,
			LaudspeakerError::Validation(_) => ErrorCategory::Validation,
			LaudspeakerError::RequestFailed(_)
			| LaudspeakerError::Api { .. }
			| LaudspeakerError::ConnectFailed(_)
			| LaudspeakerError::ChannelClosed
			| LaudspeakerError::PushToken(_) => ErrorCategory::Transport,
			LaudspeakerError::Serialization(_) => ErrorCategory::Serialization,
			LaudspeakerError::Storage(_) => ErrorCategory::Storage,
			LaudspeakerError::NotSetUp | LaudspeakerError::ClientShutdown => ErrorCategory::Lifecycle,
		}
	}

	pub(crate) fn validation(msg: impl Into<String>) -> Self {
		Self::Validation(msg.into())
	}

	pub(crate) fn configuration(msg: impl Into<String>) -> Self {
		Self::Configuration(msg.into())
	}
}

impl RetryableError for LaudspeakerError {
	fn is_retryable(&self) -> bool {
		match self {
			LaudspeakerError::RequestFailed(e) => e.is_retryable(),
			LaudspeakerError::Api { status, .. } => is_retryable_status(*status),
			LaudspeakerError::ConnectFailed(_) | LaudspeakerError::ChannelClosed => true,
			_ => false,
		}
	}
}

/// Result type alias for SDK operations.
pub type Result<T> = std::result::Result<T, LaudspeakerError>;

#[cfg(test)]
mod tests {
	use super::*;

	fn api_error(status: u16) -> LaudspeakerError {
		LaudspeakerError::Api {
			status,
			message: "test".to_string(),
			body: String::new(),
		}
	}

	#[test]
	fn api_error_retryable_statuses() {
		for status in [408, 429, 500, 502, 503, 504] {
			assert!(api_error(status).is_retryable(), "status {status} should be retryable");
		}
	}

	#[test]
	fn api_error_non_retryable_statuses() {
		for status in [400, 401, 403, 404, 422] {
			assert!(!api_error(status).is_retryable(), "status {status} should not be retryable");
		}
	}

	#[test]
	fn validation_and_serialization_are_not_retryable() {
		assert!(!LaudspeakerError::validation("empty event").is_retryable());
		let ser = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
		assert!(!LaudspeakerError::from(ser).is_retryable());
	}

	#[test]
	fn categories_follow_taxonomy() {
		assert_eq!(LaudspeakerError::AlreadySetUp.category(), ErrorCategory::Configuration);
		assert_eq!(LaudspeakerError::InvalidApiKey.category(), ErrorCategory::Configuration);
		assert_eq!(LaudspeakerError::validation("x").category(), ErrorCategory::Validation);
		assert_eq!(api_error(500).category(), ErrorCategory::Transport);
		assert_eq!(LaudspeakerError::ChannelClosed.category(), ErrorCategory::Transport);
		assert_eq!(LaudspeakerError::ClientShutdown.category(), ErrorCategory::Lifecycle);
	}

	#[test]
	fn api_error_display_includes_status() {
		let err = LaudspeakerError::Api {
			status: 503,
			message: "Service Unavailable".to_string(),
			body: "down".to_string(),
		};
		assert_eq!(err.to_string(), "API error (503): Service Unavailable");
	}
}

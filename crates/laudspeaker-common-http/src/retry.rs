// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Failure classification for delivery errors.
//!
//! The SDK never retries a request in place. Callers use this classification
//! to decide whether a failed batch is worth keeping for the next flush.

/// Errors that can tell whether a later attempt might succeed.
pub trait RetryableError {
	fn is_retryable(&self) -> bool;
}

/// HTTP statuses that indicate a transient server-side condition.
pub fn is_retryable_status(status: u16) -> bool {
	matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

impl RetryableError for reqwest::Error {
	fn is_retryable(&self) -> bool {
		if self.is_timeout() || self.is_connect() || self.is_request() {
			return true;
		}
		match self.status() {
			Some(status) => is_retryable_status(status.as_u16()),
			None => false,
		}
	}
}

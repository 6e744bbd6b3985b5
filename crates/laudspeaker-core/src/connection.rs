// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

/// State of the real-time transport.
///
/// `Disconnected -> Connecting -> Connected`. A failed connect attempt goes
/// back to `Disconnected`; a live link that fails with a transport error goes
/// to `Error`. Both non-connected states route emits to the outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
	#[default]
	Disconnected,
	Connecting,
	Connected,
	Error,
}

impl ConnectionState {
	pub fn is_connected(&self) -> bool {
		matches!(self, ConnectionState::Connected)
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			ConnectionState::Disconnected => "disconnected",
			ConnectionState::Connecting => "connecting",
			ConnectionState::Connected => "connected",
			ConnectionState::Error => "error",
		}
	}
}

impl std::fmt::Display for ConnectionState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Identity storage keys and typed lookups.

use serde_json::Value;

/// Keys persisted by the identity store.
///
/// `Version` and `Build` are internal markers that survive a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
	AnonymousId,
	DistinctId,
	PushToken,
	Version,
	Build,
}

impl StorageKey {
	pub const ALL: [StorageKey; 5] = [
		StorageKey::AnonymousId,
		StorageKey::DistinctId,
		StorageKey::PushToken,
		StorageKey::Version,
		StorageKey::Build,
	];

	pub fn as_str(&self) -> &'static str {
		match self {
			StorageKey::AnonymousId => "anonymousId",
			StorageKey::DistinctId => "distinctId",
			StorageKey::PushToken => "pushToken",
			StorageKey::Version => "version",
			StorageKey::Build => "build",
		}
	}

	/// Returns true for keys that `reset` must keep.
	pub fn survives_reset(&self) -> bool {
		matches!(self, StorageKey::Version | StorageKey::Build)
	}

	/// Storage key namespaced by an optional prefix.
	pub fn with_prefix(&self, prefix: Option<&str>) -> String {
		match prefix {
			Some(p) if !p.is_empty() => format!("{p}{}", self.as_str()),
			_ => self.as_str().to_string(),
		}
	}
}

impl std::fmt::Display for StorageKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Outcome of reading a string field from a key/value store.
///
/// Stores hold arbitrary JSON values, so a lookup distinguishes a missing
/// key from a key holding something other than a string.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredValue {
	Present(String),
	Absent,
	WrongType(Value),
}

impl StoredValue {
	pub fn from_value(value: Option<Value>) -> Self {
		match value {
			None | Some(Value::Null) => StoredValue::Absent,
			Some(Value::String(s)) => StoredValue::Present(s),
			Some(other) => StoredValue::WrongType(other),
		}
	}

	/// Returns the string when present and not blank.
	pub fn non_empty(self) -> Option<String> {
		match self {
			StoredValue::Present(s) if !s.trim().is_empty() => Some(s),
			_ => None,
		}
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Anonymous and identified user state.
//!
//! [`IdentityStore`] maps [`StorageKey`]s onto a [`KeyValueStore`] namespace.
//! [`IdentityManager`] caches those values and owns reconciliation: when a
//! caller identifies as a new user, the previous distinct id becomes the
//! anonymous baseline so the backend can link the two.

use std::sync::{Arc, Mutex};

use laudspeaker_core::{Properties, StorageKey, StoredValue};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::error::{LaudspeakerError, Result};
use crate::lock;
use crate::store::KeyValueStore;

/// Property carrying the identified user on `$identify`.
pub const DISTINCT_ID_PROPERTY: &str = "distinct_id";
/// Property carrying the anonymous id on `$identify`.
pub const ANON_DISTINCT_ID_PROPERTY: &str = "$anon_distinct_id";

/// Identity fields in a prefixed key/value namespace.
#[derive(Clone)]
pub struct IdentityStore {
	store: Arc<dyn KeyValueStore>,
	prefix: Option<String>,
}

impl IdentityStore {
	pub fn new(store: Arc<dyn KeyValueStore>, prefix: Option<String>) -> Self {
		Self { store, prefix }
	}

	fn key(&self, key: StorageKey) -> String {
		key.with_prefix(self.prefix.as_deref())
	}

	pub fn get(&self, key: StorageKey) -> StoredValue {
		StoredValue::from_value(self.store.get(&self.key(key)))
	}

	pub fn set(&self, key: StorageKey, value: &str) -> Result<()> {
		self.store.set(&self.key(key), Value::String(value.to_string()))
	}

	pub fn remove(&self, key: StorageKey) -> Result<()> {
		self.store.remove(&self.key(key))
	}

	/// Removes every identity key except the internal markers.
	///
	/// Without a prefix the namespace is the whole store, so everything else
	/// goes. With one, only this namespace's keys are touched.
	pub fn clear(&self) -> Result<()> {
		match self.prefix.as_deref() {
			Some(p) if !p.is_empty() => {
				for key in StorageKey::ALL.iter().filter(|k| !k.survives_reset()) {
					self.remove(*key)?;
				}
				Ok(())
			}
			_ => {
				let keep: Vec<String> = StorageKey::ALL
					.iter()
					.filter(|k| k.survives_reset())
					.map(|k| self.key(*k))
					.collect();
				self.store.clear(&keep)
			}
		}
	}
}

/// Cached identity with anonymous to identified reconciliation.
///
/// Each cached field has its own lock. When both distinct and anonymous
/// locks are needed they are taken in that order.
pub struct IdentityManager {
	store: IdentityStore,
	anonymous_id: Mutex<Option<String>>,
	distinct_id: Mutex<Option<String>>,
	push_token: Mutex<Option<String>>,
	identify_lock: Mutex<()>,
	verbose: bool,
}

impl IdentityManager {
	pub fn new(store: IdentityStore, verbose: bool) -> Self {
		Self {
			store,
			anonymous_id: Mutex::new(None),
			distinct_id: Mutex::new(None),
			push_token: Mutex::new(None),
			identify_lock: Mutex::new(()),
			verbose,
		}
	}

	/// Returns the anonymous id, generating and persisting one on first use.
	pub fn anonymous_id(&self) -> String {
		let mut cached = lock(&self.anonymous_id);
		if let Some(id) = cached.as_ref() {
			return id.clone();
		}

		let id = match self.store.get(StorageKey::AnonymousId).non_empty() {
			Some(id) => id,
			None => {
				let id = Uuid::new_v4().to_string();
				if let Err(e) = self.store.set(StorageKey::AnonymousId, &id) {
					warn!(error = %e, "Failed to persist anonymous id");
				}
				crate::diag!(self.verbose, anonymous_id = %id, "Generated anonymous id");
				id
			}
		};

		*cached = Some(id.clone());
		id
	}

	/// Returns the identified user, falling back to the anonymous id.
	///
	/// A stored value that is not a string resolves to `""`, which capture
	/// treats as "no identity".
	pub fn distinct_id(&self) -> String {
		let mut cached = lock(&self.distinct_id);
		if let Some(id) = cached.as_ref() {
			return id.clone();
		}

		let id = match self.store.get(StorageKey::DistinctId) {
			StoredValue::Present(id) if !id.trim().is_empty() => id,
			StoredValue::Present(_) | StoredValue::Absent => self.anonymous_id(),
			StoredValue::WrongType(value) => {
				warn!(stored = %value, "Stored distinct id is not a string, ignoring");
				String::new()
			}
		};

		*cached = Some(id.clone());
		id
	}

	/// The persisted identified id, without the anonymous fallback.
	pub fn stored_distinct_id(&self) -> Option<String> {
		self.store.get(StorageKey::DistinctId).non_empty()
	}

	/// Runs the identify sequence.
	///
	/// `capture` receives the `$identify` properties while the previous
	/// identity is still current; the new distinct id is persisted after it
	/// returns.
	pub fn identify<F>(&self, distinct_id: &str, properties: Properties, capture: F) -> Result<()>
	where
		F: FnOnce(Properties),
	{
		if distinct_id.trim().is_empty() {
			return Err(LaudspeakerError::validation("distinct id is empty"));
		}

		let _guard = lock(&self.identify_lock);
		let previous = self.distinct_id();
		let properties = properties
			.insert(DISTINCT_ID_PROPERTY, distinct_id)
			.insert(ANON_DISTINCT_ID_PROPERTY, self.anonymous_id());

		capture(properties);

		if previous != distinct_id {
			self.rotate(&previous, distinct_id)?;
			crate::diag!(
				self.verbose,
				previous = %previous,
				distinct_id = %distinct_id,
				"Identity changed"
			);
		}
		Ok(())
	}

	fn rotate(&self, previous: &str, next: &str) -> Result<()> {
		if !previous.is_empty() {
			let mut anonymous = lock(&self.anonymous_id);
			self.store.set(StorageKey::AnonymousId, previous)?;
			*anonymous = Some(previous.to_string());
		}

		let mut distinct = lock(&self.distinct_id);
		self.store.set(StorageKey::DistinctId, next)?;
		*distinct = Some(next.to_string());
		Ok(())
	}

	/// Adopts a server-assigned id without rotating the anonymous id.
	pub fn set_distinct_id(&self, distinct_id: &str) -> Result<()> {
		if distinct_id.trim().is_empty() {
			return Err(LaudspeakerError::validation("distinct id is empty"));
		}
		let mut cached = lock(&self.distinct_id);
		self.store.set(StorageKey::DistinctId, distinct_id)?;
		*cached = Some(distinct_id.to_string());
		Ok(())
	}

	pub fn push_token(&self) -> Option<String> {
		let mut cached = lock(&self.push_token);
		if cached.is_none() {
			*cached = self.store.get(StorageKey::PushToken).non_empty();
		}
		cached.clone()
	}

	pub fn set_push_token(&self, token: &str) -> Result<()> {
		let mut cached = lock(&self.push_token);
		self.store.set(StorageKey::PushToken, token)?;
		*cached = Some(token.to_string());
		Ok(())
	}

	/// Stamps the SDK version marker.
	pub fn record_version(&self, version: &str) -> Result<()> {
		match self.store.get(StorageKey::Version) {
			StoredValue::Present(v) if v == version => Ok(()),
			_ => self.store.set(StorageKey::Version, version),
		}
	}

	/// Forgets the user. The next read regenerates an anonymous id.
	pub fn reset(&self) -> Result<()> {
		let _guard = lock(&self.identify_lock);
		let mut distinct = lock(&self.distinct_id);
		let mut anonymous = lock(&self.anonymous_id);
		let mut push_token = lock(&self.push_token);

		self.store.clear()?;
		*distinct = None;
		*anonymous = None;
		*push_token = None;
		Ok(())
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Key/value backends for persisted identity state.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::Result;
use crate::lock;

/// Durable string-keyed store of JSON values.
///
/// Implementations must be safe to share between the caller's thread and the
/// SDK's background tasks.
pub trait KeyValueStore: Send + Sync {
	fn get(&self, key: &str) -> Option<Value>;

	fn set(&self, key: &str, value: Value) -> Result<()>;

	fn remove(&self, key: &str) -> Result<()>;

	/// Removes every key not listed in `keep`.
	fn clear(&self, keep: &[String]) -> Result<()>;
}

/// In-process store; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
	values: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

impl KeyValueStore for MemoryStore {
	fn get(&self, key: &str) -> Option<Value> {
		lock(&self.values).get(key).cloned()
	}

	fn set(&self, key: &str, value: Value) -> Result<()> {
		lock(&self.values).insert(key.to_string(), value);
		Ok(())
	}

	fn remove(&self, key: &str) -> Result<()> {
		lock(&self.values).remove(key);
		Ok(())
	}

	fn clear(&self, keep: &[String]) -> Result<()> {
		lock(&self.values).retain(|k, _| keep.contains(k));
		Ok(())
	}
}

/// Store backed by a single JSON document.
///
/// The document is loaded once on open and rewritten on every mutation via
/// a temp file and rename.
#[derive(Debug)]
pub struct FileStore {
	path: PathBuf,
	values: Mutex<Map<String, Value>>,
}

impl FileStore {
	pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
		let path = path.into();
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent)?;
		}

		let values = match fs::read_to_string(&path) {
			Ok(contents) if contents.trim().is_empty() => Map::new(),
			Ok(contents) => match serde_json::from_str::<Value>(&contents) {
				Ok(Value::Object(map)) => map,
				Ok(_) | Err(_) => {
					warn!(path = %path.display(), "Identity store is corrupt, starting empty");
					Map::new()
				}
			},
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
			Err(e) => return Err(e.into()),
		};

		debug!(path = %path.display(), keys = values.len(), "Opened identity store");
		Ok(Self {
			path,
			values: Mutex::new(values),
		})
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	fn persist(&self, values: &Map<String, Value>) -> Result<()> {
		let tmp = self.path.with_extension("tmp");
		let bytes = serde_json::to_vec_pretty(values)?;

		let mut options = OpenOptions::new();
		options.write(true).create(true).truncate(true);
		#[cfg(unix)]
		{
			use std::os::unix::fs::OpenOptionsExt;
			options.mode(0o600);
		}

		let mut file = options.open(&tmp)?;
		file.write_all(&bytes)?;
		file.sync_all()?;
		fs::rename(&tmp, &self.path)?;
		Ok(())
	}

	/// Applies `change` to a copy of the map and swaps it in once the copy is
	/// on disk. `change` returns false when nothing changed.
	fn update(&self, change: impl FnOnce(&mut Map<String, Value>) -> bool) -> Result<()> {
		let mut values = lock(&self.values);
		let mut next = values.clone();
		if !change(&mut next) {
			return Ok(());
		}
		self.persist(&next)?;
		*values = next;
		Ok(())
	}
}

impl KeyValueStore for FileStore {
	fn get(&self, key: &str) -> Option<Value> {
		lock(&self.values).get(key).cloned()
	}

	fn set(&self, key: &str, value: Value) -> Result<()> {
		self.update(|values| {
			values.insert(key.to_string(), value);
			true
		})
	}

	fn remove(&self, key: &str) -> Result<()> {
		self.update(|values| values.remove(key).is_some())
	}

	fn clear(&self, keep: &[String]) -> Result<()> {
		self.update(|values| {
			values.retain(|k, _| keep.contains(k));
			true
		})
	}
}

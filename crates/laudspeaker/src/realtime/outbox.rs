// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Durable log of real-time messages produced while disconnected.
//!
//! One record per line, `channel:json`. Replay re-emits records in the order
//! they were written and then truncates the log by renaming an empty file
//! over it. A crash between emitting and truncating re-sends those records on
//! the next replay: delivery is at-least-once.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use laudspeaker_core::OutboxRecord;
use tracing::warn;

use crate::error::Result;
use crate::lock;

/// Outcome of one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
	pub sent: usize,
	/// Malformed lines discarded.
	pub dropped: usize,
	/// Records kept because emitting stopped early.
	pub remaining: usize,
}

pub struct PersistentOutbox {
	path: PathBuf,
	lock: Mutex<()>,
	verbose: bool,
}

fn options() -> OpenOptions {
	let mut opts = OpenOptions::new();
	#[cfg(unix)]
	opts.mode(0o600);
	opts
}

impl PersistentOutbox {
	pub fn open(path: impl Into<PathBuf>, verbose: bool) -> Result<Self> {
		let path = path.into();
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent)?;
		}
		Ok(Self {
			path,
			lock: Mutex::new(()),
			verbose,
		})
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Appends one record after everything already in the log.
	pub fn append(&self, record: &OutboxRecord) -> Result<()> {
		let _guard = lock(&self.lock);
		let mut file = options().create(true).append(true).open(&self.path)?;
		writeln!(file, "{}", record.encode())?;
		crate::diag!(self.verbose, channel = %record.channel, "Persisted real-time message to outbox");
		Ok(())
	}

	/// Reads every well-formed record in log order.
	pub fn records(&self) -> Result<Vec<OutboxRecord>> {
		let _guard = lock(&self.lock);
		Ok(self.read()?.0)
	}

	pub fn len(&self) -> Result<usize> {
		Ok(self.records()?.len())
	}

	pub fn is_empty(&self) -> Result<bool> {
		Ok(self.len()? == 0)
	}

	/// Emits every record in order, then truncates the log.
	///
	/// If `emit` fails, the failed record and everything after it are kept
	/// for the next replay. Malformed lines are logged and discarded.
	pub fn replay<F>(&self, mut emit: F) -> Result<ReplayReport>
	where
		F: FnMut(&OutboxRecord) -> Result<()>,
	{
		let _guard = lock(&self.lock);
		let (records, dropped) = self.read()?;
		if records.is_empty() && dropped == 0 {
			return Ok(ReplayReport::default());
		}

		let mut report = ReplayReport {
			dropped,
			..ReplayReport::default()
		};

		for (i, record) in records.iter().enumerate() {
			if let Err(e) = emit(record) {
				report.remaining = records.len() - i;
				warn!(
					error = %e,
					sent = report.sent,
					remaining = report.remaining,
					"Outbox replay interrupted"
				);
				self.rewrite(&records[i..])?;
				return Ok(report);
			}
			report.sent += 1;
			crate::diag!(self.verbose, channel = %record.channel, "Replayed outbox message");
		}

		self.rewrite(&[])?;
		Ok(report)
	}

	fn read(&self) -> Result<(Vec<OutboxRecord>, usize)> {
		let file = match File::open(&self.path) {
			Ok(file) => file,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
			Err(e) => return Err(e.into()),
		};

		let mut records = Vec::new();
		let mut dropped = 0;
		for line in BufReader::new(file).lines() {
			let line = line?;
			if line.trim().is_empty() {
				continue;
			}
			match OutboxRecord::decode(&line) {
				Ok(record) => records.push(record),
				Err(e) => {
					dropped += 1;
					warn!(error = %e, "Discarding malformed outbox record");
				}
			}
		}
		Ok((records, dropped))
	}

	fn rewrite(&self, records: &[OutboxRecord]) -> Result<()> {
		let tmp = self.path.with_extension("tmp");
		{
			let file = options().write(true).create(true).truncate(true).open(&tmp)?;
			let mut writer = BufWriter::new(file);
			for record in records {
				writeln!(writer, "{}", record.encode())?;
			}
			writer.flush()?;
		}
		fs::rename(&tmp, &self.path)?;
		Ok(())
	}
}

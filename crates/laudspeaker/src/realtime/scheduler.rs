// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Reconnection with capped exponential backoff.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::lock;

/// Capped exponential delay: `min(initial * 2^failures, max)`. No jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
	initial: Duration,
	max: Duration,
	failures: u32,
}

impl Backoff {
	pub fn new(initial: Duration, max: Duration) -> Self {
		Self {
			initial,
			max,
			failures: 0,
		}
	}

	pub fn delay(&self) -> Duration {
		let factor = 2u32.saturating_pow(self.failures.min(20));
		self.initial.saturating_mul(factor).min(self.max)
	}

	pub fn failures(&self) -> u32 {
		self.failures
	}

	pub fn record_failure(&mut self) {
		self.failures = self.failures.saturating_add(1);
	}

	pub fn reset(&mut self) {
		self.failures = 0;
	}
}

/// Something the scheduler can reconnect.
#[async_trait::async_trait]
pub trait Reconnect: Send + Sync {
	fn is_connected(&self) -> bool;

	async fn reconnect(&self) -> Result<()>;
}

/// Drives reconnect attempts. At most one retry task exists at a time.
pub struct ReconnectionScheduler {
	backoff: Arc<Mutex<Backoff>>,
	task: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectionScheduler {
	pub fn new(initial: Duration, max: Duration) -> Self {
		Self {
			backoff: Arc::new(Mutex::new(Backoff::new(initial, max))),
			task: Mutex::new(None),
		}
	}

	/// Cancels any outstanding retry task, resets the backoff and starts a
	/// new retry loop against `target`.
	///
	/// The loop ends when an attempt succeeds, the target reports connected,
	/// or the target is dropped.
	pub fn arm(&self, target: Weak<dyn Reconnect>) {
		let mut task = lock(&self.task);
		if let Some(previous) = task.take() {
			previous.abort();
		}
		lock(&self.backoff).reset();

		let backoff = Arc::clone(&self.backoff);
		*task = Some(tokio::spawn(async move {
			loop {
				let delay = lock(&backoff).delay();
				tokio::time::sleep(delay).await;

				let Some(target) = target.upgrade() else {
					break;
				};
				if target.is_connected() {
					debug!("Channel already connected, stopping reconnection");
					break;
				}

				let attempt = lock(&backoff).failures() + 1;
				info!(attempt, delay_ms = delay.as_millis() as u64, "Attempting to reconnect");
				match target.reconnect().await {
					Ok(()) => break,
					Err(e) => {
						let mut backoff = lock(&backoff);
						backoff.record_failure();
						warn!(
							error = %e,
							attempt,
							next_delay_ms = backoff.delay().as_millis() as u64,
							"Reconnect attempt failed"
						);
					}
				}
			}
		}));
	}

	/// Aborts the outstanding retry task, if any.
	pub fn cancel(&self) {
		if let Some(task) = lock(&self.task).take() {
			task.abort();
		}
	}

	pub fn is_armed(&self) -> bool {
		lock(&self.task)
			.as_ref()
			.is_some_and(|task| !task.is_finished())
	}

	pub fn reset_backoff(&self) {
		lock(&self.backoff).reset();
	}

	/// Delay before the next attempt.
	pub fn current_delay(&self) -> Duration {
		lock(&self.backoff).delay()
	}

	pub fn failures(&self) -> u32 {
		lock(&self.backoff).failures()
	}

	#[cfg(test)]
	pub(crate) fn record_failure(&self) {
		lock(&self.backoff).record_failure();
	}
}

impl Drop for ReconnectionScheduler {
	fn drop(&mut self) {
		self.cancel();
	}
}

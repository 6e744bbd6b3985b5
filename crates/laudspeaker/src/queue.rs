// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Event buffering and background flush.
//!
//! A single worker task owns the buffer. Callers talk to it through an
//! unbounded command channel, so `enqueue` never blocks and no two flushes
//! ever overlap.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use laudspeaker_common_http::RetryableError;
use laudspeaker_core::Event;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{LaudspeakerError, Result};

/// Flush and backpressure policy for the event queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
	/// Buffered event count that triggers a flush.
	pub flush_at: usize,
	/// Maximum number of events per outgoing batch.
	pub max_batch_size: usize,
	/// Maximum number of events to buffer before dropping the oldest.
	pub max_queue_size: usize,
	/// Interval between timer-driven flushes.
	pub flush_interval: Duration,
	pub verbose: bool,
}

impl Default for QueueConfig {
	fn default() -> Self {
		Self {
			flush_at: 1,
			max_batch_size: 50,
			max_queue_size: 1000,
			flush_interval: Duration::from_secs(1),
			verbose: false,
		}
	}
}

impl From<&Config> for QueueConfig {
	fn from(config: &Config) -> Self {
		Self {
			flush_at: config.flush_at,
			max_batch_size: config.max_batch_size,
			max_queue_size: config.max_queue_size,
			flush_interval: config.flush_interval(),
			verbose: config.debug,
		}
	}
}

/// Delivers a batch of events to the backend.
#[async_trait::async_trait]
pub trait BatchSender: Send + Sync {
	async fn send_batch(&self, events: Vec<Event>) -> Result<()>;
}

#[derive(Debug)]
enum QueueCommand {
	Enqueue(Event),
	Flush(oneshot::Sender<Result<()>>),
	Clear,
	Len(oneshot::Sender<usize>),
	Shutdown(oneshot::Sender<()>),
}

/// Handle to the queue worker.
pub struct EventQueue {
	tx: mpsc::UnboundedSender<QueueCommand>,
	closed: AtomicBool,
}

impl EventQueue {
	/// Spawns the worker on the current Tokio runtime.
	pub fn start(config: QueueConfig, sender: Arc<dyn BatchSender>) -> Self {
		let (tx, rx) = mpsc::unbounded_channel();
		let worker = QueueWorker {
			buffer: VecDeque::new(),
			config,
			sender,
			rx,
		};
		tokio::spawn(worker.run());
		Self {
			tx,
			closed: AtomicBool::new(false),
		}
	}

	/// Hands an event to the worker without waiting.
	pub fn enqueue(&self, event: Event) -> Result<()> {
		if self.is_closed() {
			return Err(LaudspeakerError::ClientShutdown);
		}
		event.validate().map_err(LaudspeakerError::validation)?;
		self
			.tx
			.send(QueueCommand::Enqueue(event))
			.map_err(|_| LaudspeakerError::ClientShutdown)
	}

	/// Sends everything buffered so far, one batch at a time.
	///
	/// Stops at the first failed batch and returns its error.
	pub async fn flush(&self) -> Result<()> {
		if self.is_closed() {
			return Err(LaudspeakerError::ClientShutdown);
		}
		let (reply, rx) = oneshot::channel();
		self
			.tx
			.send(QueueCommand::Flush(reply))
			.map_err(|_| LaudspeakerError::ClientShutdown)?;
		rx.await.map_err(|_| LaudspeakerError::ClientShutdown)?
	}

	/// Discards buffered events.
	pub fn clear(&self) {
		let _ = self.tx.send(QueueCommand::Clear);
	}

	pub async fn len(&self) -> usize {
		let (reply, rx) = oneshot::channel();
		if self.tx.send(QueueCommand::Len(reply)).is_err() {
			return 0;
		}
		rx.await.unwrap_or(0)
	}

	pub async fn is_empty(&self) -> bool {
		self.len().await == 0
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	/// Flushes what is left and stops the worker. Safe to call twice.
	pub async fn shutdown(&self) {
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		let (reply, rx) = oneshot::channel();
		if self.tx.send(QueueCommand::Shutdown(reply)).is_ok() {
			let _ = rx.await;
		}
	}
}

struct QueueWorker {
	config: QueueConfig,
	sender: Arc<dyn BatchSender>,
	buffer: VecDeque<Event>,
	rx: mpsc::UnboundedReceiver<QueueCommand>,
}

impl QueueWorker {
	async fn run(mut self) {
		debug!(
			flush_at = self.config.flush_at,
			flush_interval_secs = self.config.flush_interval.as_secs(),
			max_batch_size = self.config.max_batch_size,
			"Starting event queue"
		);

		let mut ticker = interval_at(
			Instant::now() + self.config.flush_interval,
			self.config.flush_interval,
		);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				command = self.rx.recv() => {
					let Some(command) = command else {
						let _ = self.flush_all().await;
						break;
					};

					let mut stop = self.handle(command).await;
					while !stop {
						match self.rx.try_recv() {
							Ok(command) => stop = self.handle(command).await,
							Err(_) => break,
						}
					}
					if stop {
						break;
					}

					if self.buffer.len() >= self.config.flush_at {
						let _ = self.flush_batch().await;
					}
				}
				_ = ticker.tick() => {
					if !self.buffer.is_empty() {
						let _ = self.flush_batch().await;
					}
				}
			}
		}

		debug!("Event queue stopped");
	}

	/// Returns true when the worker should stop.
	async fn handle(&mut self, command: QueueCommand) -> bool {
		match command {
			QueueCommand::Enqueue(event) => {
				self.push(event);
				false
			}
			QueueCommand::Flush(reply) => {
				let _ = reply.send(self.flush_all().await);
				false
			}
			QueueCommand::Clear => {
				let count = self.buffer.len();
				self.buffer.clear();
				crate::diag!(self.config.verbose, count, "Cleared event queue");
				false
			}
			QueueCommand::Len(reply) => {
				let _ = reply.send(self.buffer.len());
				false
			}
			QueueCommand::Shutdown(reply) => {
				if let Err(e) = self.flush_all().await {
					error!(error = %e, remaining = self.buffer.len(), "Failed to flush events on shutdown");
				}
				let _ = reply.send(());
				true
			}
		}
	}

	fn push(&mut self, event: Event) {
		while self.buffer.len() >= self.config.max_queue_size {
			if let Some(dropped) = self.buffer.pop_front() {
				warn!(
					event = %dropped.event,
					event_id = %dropped.event_id,
					"Dropped event due to queue overflow"
				);
			}
		}
		crate::diag!(self.config.verbose, event = %event.event, queued = self.buffer.len() + 1, "Queued event");
		self.buffer.push_back(event);
	}

	async fn flush_all(&mut self) -> Result<()> {
		while !self.buffer.is_empty() {
			self.flush_batch().await?;
		}
		Ok(())
	}

	/// Sends the oldest `max_batch_size` events.
	///
	/// A retryable failure puts the batch back at the front of the buffer.
	async fn flush_batch(&mut self) -> Result<()> {
		let take = self.buffer.len().min(self.config.max_batch_size);
		if take == 0 {
			return Ok(());
		}
		let batch: Vec<Event> = self.buffer.drain(..take).collect();
		let count = batch.len();

		crate::diag!(self.config.verbose, count, remaining = self.buffer.len(), "Flushing event batch");

		match self.sender.send_batch(batch.clone()).await {
			Ok(()) => {
				if self.config.verbose {
					info!(count, "Delivered event batch");
				}
				Ok(())
			}
			Err(e) if e.is_retryable() => {
				warn!(error = %e, count, "Failed to deliver event batch, keeping it for the next flush");
				self.requeue(batch);
				Err(e)
			}
			Err(e) => {
				error!(error = %e, count, "Failed to deliver event batch, dropping it");
				Err(e)
			}
		}
	}

	fn requeue(&mut self, batch: Vec<Event>) {
		for event in batch.into_iter().rev() {
			self.buffer.push_front(event);
		}
		while self.buffer.len() > self.config.max_queue_size {
			if let Some(dropped) = self.buffer.pop_front() {
				warn!(event = %dropped.event, "Dropped event due to queue overflow");
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use laudspeaker_core::Properties;
	use std::sync::atomic::AtomicU16;
	use tokio::sync::Mutex;

	struct MockSender {
		sent: Mutex<Vec<Vec<Event>>>,
		fail_status: AtomicU16,
	}

	impl MockSender {
		fn new() -> Arc<Self> {
			Arc::new(Self {
				sent: Mutex::new(Vec::new()),
				fail_status: AtomicU16::new(0),
			})
		}

		fn fail_with(&self, status: u16) {
			self.fail_status.store(status, Ordering::SeqCst);
		}

		async fn batches(&self) -> Vec<Vec<String>> {
			self
				.sent
				.lock()
				.await
				.iter()
				.map(|batch| batch.iter().map(|e| e.event.clone()).collect())
				.collect()
		}

		async fn wait_for_batches(&self, n: usize) -> Vec<Vec<String>> {
			for _ in 0..200 {
				if self.sent.lock().await.len() >= n {
					break;
				}
				tokio::time::sleep(Duration::from_millis(5)).await;
			}
			self.batches().await
		}
	}

	#[async_trait::async_trait]
	impl BatchSender for MockSender {
		async fn send_batch(&self, events: Vec<Event>) -> Result<()> {
			let status = self.fail_status.load(Ordering::SeqCst);
			if status != 0 {
				return Err(LaudspeakerError::Api {
					status,
					message: "mock failure".to_string(),
					body: String::new(),
				});
			}
			self.sent.lock().await.push(events);
			Ok(())
		}
	}

	fn event(name: &str) -> Event {
		Event::new(name, "user-1", Properties::new())
	}

	fn config(flush_at: usize, max_batch_size: usize, max_queue_size: usize) -> QueueConfig {
		QueueConfig {
			flush_at,
			max_batch_size,
			max_queue_size,
			flush_interval: Duration::from_secs(60),
			verbose: false,
		}
	}

	#[tokio::test]
	async fn explicit_flush_sends_buffered_events() {
		let sender = MockSender::new();
		let queue = EventQueue::start(config(100, 50, 1000), sender.clone());

		queue.enqueue(event("a")).unwrap();
		queue.enqueue(event("b")).unwrap();
		queue.flush().await.unwrap();

		assert_eq!(sender.batches().await, vec![vec!["a", "b"]]);
		assert!(queue.is_empty().await);
	}

	#[tokio::test]
	async fn threshold_flush_coalesces_pending_events() {
		let sender = MockSender::new();
		let queue = EventQueue::start(config(1, 50, 1000), sender.clone());

		queue.enqueue(event("$identify")).unwrap();
		queue.enqueue(event("purchase")).unwrap();

		let batches = sender.wait_for_batches(1).await;
		assert_eq!(batches, vec![vec!["$identify", "purchase"]]);
	}

	#[tokio::test]
	async fn threshold_flush_sends_one_batch_per_cycle() {
		let sender = MockSender::new();
		let queue = EventQueue::start(config(3, 2, 1000), sender.clone());

		for name in ["a", "b", "c"] {
			queue.enqueue(event(name)).unwrap();
		}

		let batches = sender.wait_for_batches(1).await;
		assert_eq!(batches, vec![vec!["a", "b"]]);
		assert_eq!(queue.len().await, 1);
	}

	#[tokio::test]
	async fn flush_splits_by_max_batch_size() {
		let sender = MockSender::new();
		let queue = EventQueue::start(config(100, 2, 1000), sender.clone());

		for i in 0..5 {
			queue.enqueue(event(&format!("e{i}"))).unwrap();
		}
		queue.flush().await.unwrap();

		let sizes: Vec<usize> = sender.batches().await.iter().map(Vec::len).collect();
		assert_eq!(sizes, vec![2, 2, 1]);
	}

	#[tokio::test]
	async fn overflow_drops_oldest() {
		let sender = MockSender::new();
		let queue = EventQueue::start(config(100, 100, 3), sender.clone());

		for i in 0..5 {
			queue.enqueue(event(&format!("event{i}"))).unwrap();
		}
		assert_eq!(queue.len().await, 3);

		queue.flush().await.unwrap();
		assert_eq!(
			sender.batches().await,
			vec![vec!["event2", "event3", "event4"]]
		);
	}

	#[tokio::test(start_paused = true)]
	async fn timer_flushes_below_threshold() {
		let sender = MockSender::new();
		let mut cfg = config(100, 50, 1000);
		cfg.flush_interval = Duration::from_secs(5);
		let queue = EventQueue::start(cfg, sender.clone());

		queue.enqueue(event("slow")).unwrap();
		assert_eq!(queue.len().await, 1);

		tokio::time::sleep(Duration::from_secs(6)).await;
		assert_eq!(sender.wait_for_batches(1).await, vec![vec!["slow"]]);
	}

	#[tokio::test]
	async fn retryable_failure_keeps_batch_in_order() {
		let sender = MockSender::new();
		let queue = EventQueue::start(config(100, 50, 1000), sender.clone());
		sender.fail_with(503);

		queue.enqueue(event("a")).unwrap();
		queue.enqueue(event("b")).unwrap();
		let err = queue.flush().await.unwrap_err();
		assert!(matches!(err, LaudspeakerError::Api { status: 503, .. }));
		assert_eq!(queue.len().await, 2);

		sender.fail_with(0);
		queue.enqueue(event("c")).unwrap();
		queue.flush().await.unwrap();
		assert_eq!(sender.batches().await, vec![vec!["a", "b", "c"]]);
	}

	#[tokio::test]
	async fn non_retryable_failure_drops_batch() {
		let sender = MockSender::new();
		let queue = EventQueue::start(config(100, 50, 1000), sender.clone());
		sender.fail_with(400);

		queue.enqueue(event("bad")).unwrap();
		assert!(queue.flush().await.is_err());
		assert_eq!(queue.len().await, 0);
	}

	#[tokio::test]
	async fn shutdown_flushes_and_rejects_new_events() {
		let sender = MockSender::new();
		let queue = EventQueue::start(config(100, 50, 1000), sender.clone());

		queue.enqueue(event("last")).unwrap();
		queue.shutdown().await;
		queue.shutdown().await;

		assert_eq!(sender.batches().await, vec![vec!["last"]]);
		assert!(matches!(
			queue.enqueue(event("late")),
			Err(LaudspeakerError::ClientShutdown)
		));
		assert!(matches!(
			queue.flush().await,
			Err(LaudspeakerError::ClientShutdown)
		));
	}

	#[tokio::test]
	async fn clear_discards_buffer() {
		let sender = MockSender::new();
		let queue = EventQueue::start(config(100, 50, 1000), sender.clone());

		for name in ["a", "b", "c"] {
			queue.enqueue(event(name)).unwrap();
		}
		queue.clear();
		assert_eq!(queue.len().await, 0);
		queue.flush().await.unwrap();
		assert!(sender.batches().await.is_empty());
	}

	#[tokio::test]
	async fn invalid_events_never_enter_the_queue() {
		let sender = MockSender::new();
		let queue = EventQueue::start(config(100, 50, 1000), sender.clone());

		let result = queue.enqueue(Event::new("purchase", "", Properties::new()));
		assert!(matches!(result, Err(LaudspeakerError::Validation(_))));
		assert_eq!(queue.len().await, 0);
	}
}

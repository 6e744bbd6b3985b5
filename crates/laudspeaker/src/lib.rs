// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Laudspeaker event-delivery SDK.
//!
//! Records user-attributed events with `identify`, `set` and `capture`, and
//! delivers them without blocking the caller:
//!
//! - **Batch delivery**: events are buffered by a single worker and posted
//!   to `{host}/events/batch/` when `flush_at` events are queued or the flush
//!   interval elapses.
//! - **Real-time delivery**: messages go over a persistent channel. While it
//!   is down they are written to a durable outbox and replayed, in order,
//!   once it reconnects.
//!
//! # Example
//!
//! ```no_run
//! use laudspeaker::{Config, Laudspeaker, Properties};
//!
//! # async fn example() {
//! let sdk = Laudspeaker::new();
//! sdk.setup(Config::new("your-api-key"));
//!
//! sdk.identify("user-42", Properties::new().insert("plan", "pro"));
//! sdk.capture("purchase", Properties::new().insert("amount", 10));
//!
//! sdk.close().await;
//! # }
//! ```
//!
//! Public facade methods never return errors; failures are logged through
//! `tracing`. The component types underneath return [`Result`].

use std::sync::{Mutex, MutexGuard};

/// Logs at `info` when verbose diagnostics are enabled, `debug` otherwise.
macro_rules! diag {
	($verbose:expr, $($arg:tt)+) => {
		if $verbose {
			::tracing::info!($($arg)+)
		} else {
			::tracing::debug!($($arg)+)
		}
	};
}
pub(crate) use diag;

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod identity;
pub mod push;
pub mod queue;
pub mod realtime;
pub mod store;

pub use api::BatchTransport;
pub use client::{Components, Laudspeaker};
pub use config::{ApiKey, Config, Delivery, PropertiesSanitizer, SDK_VERSION};
pub use error::{ErrorCategory, LaudspeakerError, Result};
pub use identity::{IdentityManager, IdentityStore};
pub use push::{PushTokenError, PushTokenProvider, StaticTokenProvider};
pub use queue::{BatchSender, EventQueue, QueueConfig};
pub use realtime::{
	ChannelConnector, ConnectListener, PersistentOutbox, RealtimeOptions, RealtimeTransport,
	ReconnectionScheduler, WebSocketConnector,
};
pub use store::{FileStore, KeyValueStore, MemoryStore};

pub use laudspeaker_core::{ConnectionState, Event, Properties};

/// Locks a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The `Laudspeaker` facade.
//!
//! Every public method here swallows its errors: failures are logged and the
//! host application carries on. Components are wired up by [`Laudspeaker::setup`]
//! and torn down by [`Laudspeaker::close`].

use std::sync::{Arc, Mutex, RwLock};

use laudspeaker_core::{Event, Properties, IDENTIFY_EVENT, PUSH_TOKEN_EVENT, SET_EVENT};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::api::BatchTransport;
use crate::config::{Config, Delivery};
use crate::error::{ErrorCategory, LaudspeakerError, Result};
use crate::identity::{IdentityManager, IdentityStore};
use crate::lock;
use crate::push::{self, PushTokenProvider};
use crate::queue::{BatchSender, EventQueue, QueueConfig};
use crate::realtime::{
	ChannelConnector, ConnectListener, PersistentOutbox, RealtimeOptions, RealtimeTransport,
	WebSocketConnector,
};
use crate::store::{FileStore, KeyValueStore};

const PUSH_TOKEN_PROPERTY: &str = "androidDeviceToken";

const PREFERENCES_FILE: &str = "preferences.json";
const OUTBOX_FILE: &str = "message_queue.txt";

/// Replaceable collaborators. Anything left as `None` gets the default
/// implementation at setup.
#[derive(Clone, Default)]
pub struct Components {
	/// Identity storage. Defaults to a [`FileStore`] in the storage dir.
	pub store: Option<Arc<dyn KeyValueStore>>,
	/// Real-time channel. Defaults to [`WebSocketConnector`].
	pub connector: Option<Arc<dyn ChannelConnector>>,
	/// Source of device push tokens. There is no default.
	pub push_provider: Option<Arc<dyn PushTokenProvider>>,
	/// Batch delivery. Defaults to [`BatchTransport`].
	pub batch_sender: Option<Arc<dyn BatchSender>>,
}

impl Components {
	pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
		self.store = Some(store);
		self
	}

	pub fn with_connector(mut self, connector: Arc<dyn ChannelConnector>) -> Self {
		self.connector = Some(connector);
		self
	}

	pub fn with_push_provider(mut self, provider: Arc<dyn PushTokenProvider>) -> Self {
		self.push_provider = Some(provider);
		self
	}

	pub fn with_batch_sender(mut self, sender: Arc<dyn BatchSender>) -> Self {
		self.batch_sender = Some(sender);
		self
	}
}

struct ClientInner {
	config: Config,
	runtime: Handle,
	identity: Arc<IdentityManager>,
	queue: EventQueue,
	transport: BatchTransport,
	realtime: Option<RealtimeTransport>,
	push_provider: Option<Arc<dyn PushTokenProvider>>,
}

/// Client entry point.
///
/// Create one per process, call [`setup`](Self::setup) once, and
/// [`close`](Self::close) before exiting so buffered events are delivered.
pub struct Laudspeaker {
	components: Components,
	inner: RwLock<Option<Arc<ClientInner>>>,
	setup_lock: Mutex<()>,
}

impl Default for Laudspeaker {
	fn default() -> Self {
		Self::new()
	}
}

impl Laudspeaker {
	pub fn new() -> Self {
		Self::with_components(Components::default())
	}

	pub fn with_components(components: Components) -> Self {
		Self {
			components,
			inner: RwLock::new(None),
			setup_lock: Mutex::new(()),
		}
	}

	/// Validates `config` and starts the background workers.
	///
	/// Must be called from within a Tokio runtime. A second call is logged
	/// and ignored.
	pub fn setup(&self, config: Config) {
		if let Err(e) = self.try_setup(config) {
			error!(error = %e, "Laudspeaker setup failed");
		}
	}

	fn try_setup(&self, config: Config) -> Result<()> {
		let _guard = lock(&self.setup_lock);
		if self.current().is_some() {
			return Err(LaudspeakerError::AlreadySetUp);
		}
		config.validate()?;
		let runtime = Handle::try_current()
			.map_err(|_| LaudspeakerError::configuration("setup must be called inside a Tokio runtime"))?;

		let store: Arc<dyn KeyValueStore> = match &self.components.store {
			Some(store) => Arc::clone(store),
			None => Arc::new(FileStore::open(config.storage_file(PREFERENCES_FILE))?),
		};
		let identity = Arc::new(IdentityManager::new(
			IdentityStore::new(store, config.prefix().map(str::to_string)),
			config.debug,
		));
		if let Err(e) = identity.record_version(&config.sdk_version) {
			warn!(error = %e, "Failed to record SDK version");
		}

		let transport = BatchTransport::new(&config)?;
		let sender: Arc<dyn BatchSender> = match &self.components.batch_sender {
			Some(sender) => Arc::clone(sender),
			None => Arc::new(transport.clone()),
		};

		let realtime = match config.delivery {
			Delivery::Batch => None,
			Delivery::Realtime => {
				let outbox = PersistentOutbox::open(config.storage_file(OUTBOX_FILE), config.debug)?;
				let connector: Arc<dyn ChannelConnector> = match &self.components.connector {
					Some(connector) => Arc::clone(connector),
					None => Arc::new(WebSocketConnector),
				};
				Some(RealtimeTransport::new(
					RealtimeOptions::from(&config),
					connector,
					Arc::clone(&identity),
					outbox,
					self.components.push_provider.clone(),
				))
			}
		};

		let queue = EventQueue::start(QueueConfig::from(&config), sender);
		let inner = Arc::new(ClientInner {
			runtime,
			identity,
			queue,
			transport,
			realtime,
			push_provider: self.components.push_provider.clone(),
			config,
		});

		if let Some(realtime) = &inner.realtime {
			realtime.start();
		}
		if inner.config.automated_push {
			inner.spawn_push_token();
		}

		info!(
			host = %inner.config.base_url(),
			delivery = ?inner.config.delivery,
			"Laudspeaker set up"
		);
		*self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(inner);
		Ok(())
	}

	fn current(&self) -> Option<Arc<ClientInner>> {
		self
			.inner
			.read()
			.unwrap_or_else(|poisoned| poisoned.into_inner())
			.clone()
	}

	fn require(&self, operation: &'static str) -> Option<Arc<ClientInner>> {
		let inner = self.current();
		if inner.is_none() {
			warn!(operation, "Laudspeaker is not set up, ignoring call");
		}
		inner
	}

	/// True between a successful `setup` and `close`.
	pub fn is_enabled(&self) -> bool {
		self.current().is_some()
	}

	/// Records an event for the current user.
	pub fn capture(&self, event: &str, properties: Properties) {
		if let Some(inner) = self.require("capture") {
			inner.report("capture", inner.capture(event, properties));
		}
	}

	/// Associates this device with `distinct_id`, emitting `$identify`.
	pub fn identify(&self, distinct_id: &str, properties: Properties) {
		if let Some(inner) = self.require("identify") {
			inner.report("identify", inner.identify(distinct_id, properties));
		}
	}

	/// Sets user properties.
	pub fn set(&self, properties: Properties) {
		if let Some(inner) = self.require("set") {
			inner.report("set", inner.set(properties));
		}
	}

	/// Resolves the device push token and sends it in the background.
	pub fn send_push_token(&self) {
		if let Some(inner) = self.require("send_push_token") {
			inner.spawn_push_token();
		}
	}

	/// Cached, stored or freshly fetched push token.
	pub async fn push_token(&self) -> Option<String> {
		let inner = self.require("push_token")?;
		match push::resolve_token(&inner.identity, inner.push_provider.as_ref()).await {
			Ok(token) => Some(token),
			Err(e) => {
				inner.report("push_token", Err(e));
				None
			}
		}
	}

	/// Forgets the current user and discards buffered events.
	pub fn reset(&self) {
		if let Some(inner) = self.require("reset") {
			inner.report("reset", inner.identity.reset());
			inner.queue.clear();
			crate::diag!(inner.config.debug, "Identity reset");
		}
	}

	/// Delivers buffered events now and replays the real-time outbox.
	pub async fn flush(&self) {
		let Some(inner) = self.require("flush") else {
			return;
		};
		inner.report("flush", inner.queue.flush().await);
		if let Some(realtime) = &inner.realtime {
			inner.report("flush", realtime.replay_outbox().map(|_| ()));
		}
	}

	/// Flushes, stops every background task and returns to the
	/// not-set-up state. Safe to call repeatedly, or before `setup`.
	pub async fn close(&self) {
		let inner = self
			.inner
			.write()
			.unwrap_or_else(|poisoned| poisoned.into_inner())
			.take();
		let Some(inner) = inner else {
			debug!("Laudspeaker already closed");
			return;
		};

		inner.queue.shutdown().await;
		if let Some(realtime) = &inner.realtime {
			realtime.close().await;
		}
		info!("Laudspeaker closed");
	}

	pub fn distinct_id(&self) -> Option<String> {
		self.current().map(|inner| inner.identity.distinct_id())
	}

	pub fn anonymous_id(&self) -> Option<String> {
		self.current().map(|inner| inner.identity.anonymous_id())
	}

	/// Sends one event straight to `{host}/events`, bypassing the queue.
	///
	/// Returns the response status, or `None` if the request failed.
	pub async fn fire_api(&self, event: &str, properties: Properties) -> Option<u16> {
		let inner = self.require("fire_api")?;
		let result = inner.fire_api(event, properties).await;
		match result {
			Ok(status) => Some(status),
			Err(e) => {
				inner.report("fire_api", Err(e));
				None
			}
		}
	}

	/// The real-time transport, when running with [`Delivery::Realtime`].
	pub fn realtime(&self) -> Option<RealtimeTransport> {
		self.current().and_then(|inner| inner.realtime.clone())
	}

	pub fn add_connect_listener(&self, listener: Arc<dyn ConnectListener>) {
		match self.realtime() {
			Some(realtime) => realtime.add_listener(listener),
			None => warn!("Connect listeners need real-time delivery, ignoring"),
		}
	}
}

impl ClientInner {
	fn verbose(&self) -> bool {
		self.config.debug
	}

	fn sanitize(&self, properties: Properties) -> Properties {
		match &self.config.sanitizer {
			Some(sanitizer) => sanitizer.sanitize(properties),
			None => properties,
		}
	}

	fn report(&self, operation: &'static str, result: Result<()>) {
		let Err(e) = result else {
			return;
		};
		match e.category() {
			ErrorCategory::Validation => {
				crate::diag!(self.verbose(), operation, reason = %e, "Dropped invalid call");
			}
			ErrorCategory::Lifecycle => debug!(operation, error = %e, "Ignoring call after shutdown"),
			_ => error!(operation, error = %e, "Laudspeaker operation failed"),
		}
	}

	fn enqueue(&self, event: &str, properties: Properties) -> Result<()> {
		let distinct_id = self.identity.distinct_id();
		if distinct_id.is_empty() {
			return Err(LaudspeakerError::validation("no identity to attribute the event to"));
		}
		crate::diag!(self.verbose(), event, distinct_id = %distinct_id, "Captured event");
		self.queue.enqueue(Event::new(event, distinct_id, properties))
	}

	fn capture(&self, event: &str, properties: Properties) -> Result<()> {
		if event.trim().is_empty() {
			return Err(LaudspeakerError::validation("event name is empty"));
		}
		let properties = self.sanitize(properties);
		match &self.realtime {
			Some(realtime) => realtime.fire(event, Some(properties)),
			None => self.enqueue(event, properties),
		}
	}

	fn identify(&self, distinct_id: &str, properties: Properties) -> Result<()> {
		let properties = self.sanitize(properties);
		let mut sent = Ok(());
		match &self.realtime {
			Some(realtime) => {
				let user_properties = (!properties.is_empty()).then(|| properties.clone());
				self.identity.identify(distinct_id, properties, |_| {
					sent = realtime.identify(distinct_id, user_properties);
				})?;
			}
			None => {
				self.identity.identify(distinct_id, properties, |merged| {
					sent = self.enqueue(IDENTIFY_EVENT, merged);
				})?;
			}
		}
		sent
	}

	fn set(&self, properties: Properties) -> Result<()> {
		let properties = self.sanitize(properties);
		match &self.realtime {
			Some(realtime) => realtime.set(properties),
			None => self.enqueue(SET_EVENT, properties),
		}
	}

	async fn send_push_token(&self) -> Result<()> {
		let token = push::resolve_token(&self.identity, self.push_provider.as_ref()).await?;
		if token.trim().is_empty() {
			return Err(LaudspeakerError::validation("push token is empty"));
		}
		match &self.realtime {
			Some(realtime) => realtime.send_push_token(&token),
			None => self.enqueue(
				PUSH_TOKEN_EVENT,
				Properties::new().insert(PUSH_TOKEN_PROPERTY, token),
			),
		}
	}

	fn spawn_push_token(self: &Arc<Self>) {
		let inner = Arc::clone(self);
		self.runtime.spawn(async move {
			let result = inner.send_push_token().await;
			inner.report("send_push_token", result);
		});
	}

	async fn fire_api(&self, event: &str, properties: Properties) -> Result<u16> {
		if event.trim().is_empty() {
			return Err(LaudspeakerError::validation("event name is empty"));
		}
		let distinct_id = self.identity.distinct_id();
		if distinct_id.is_empty() {
			return Err(LaudspeakerError::validation("no identity to attribute the event to"));
		}
		self
			.transport
			.fire_api(event, &distinct_id, self.sanitize(properties))
			.await
	}
}

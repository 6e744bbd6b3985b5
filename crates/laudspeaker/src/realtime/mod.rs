// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Persistent real-time delivery.
//!
//! [`RealtimeTransport`] keeps one live channel open, sends messages over it
//! while connected, and writes them to the [`PersistentOutbox`] otherwise.
//! Lost connections are retried by the [`ReconnectionScheduler`]; the outbox
//! is replayed whenever the channel connects or the server sends `flush`.

pub mod channel;
pub mod outbox;
pub mod scheduler;
pub mod websocket;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use laudspeaker_core::{
	AuthParams, ConnectionState, Frame, InboundMessage, OutboundMessage, OutboxRecord, Properties,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use channel::{ChannelConnector, ChannelEvent, ChannelLink, ChannelPeer};
pub use outbox::{PersistentOutbox, ReplayReport};
pub use scheduler::{Backoff, Reconnect, ReconnectionScheduler};
pub use websocket::{realtime_url, WebSocketConnector};

use crate::config::{ApiKey, Config};
use crate::error::{LaudspeakerError, Result};
use crate::identity::IdentityManager;
use crate::lock;
use crate::push::{self, PushTokenProvider};

/// Observer of real-time connection changes.
pub trait ConnectListener: Send + Sync {
	fn on_connected(&self) {}

	fn on_disconnected(&self) {}

	/// Connect failures plus server `log` and `error` messages.
	fn on_error(&self, _message: &str) {}
}

/// Settings for [`RealtimeTransport`].
#[derive(Debug, Clone)]
pub struct RealtimeOptions {
	pub api_key: ApiKey,
	pub host: String,
	pub development: bool,
	pub automated_push: bool,
	pub push_platform: String,
	pub reconnect_initial_delay: Duration,
	pub reconnect_max_delay: Duration,
	/// Upper bound on a single connect attempt.
	pub connect_timeout: Duration,
	pub verbose: bool,
}

impl From<&Config> for RealtimeOptions {
	fn from(config: &Config) -> Self {
		Self {
			api_key: config.api_key.clone(),
			host: config.host.clone(),
			development: config.development,
			automated_push: config.automated_push,
			push_platform: config.push_platform.clone(),
			reconnect_initial_delay: config.reconnect_initial_delay(),
			reconnect_max_delay: config.reconnect_max_delay(),
			connect_timeout: config.request_timeout(),
			verbose: config.debug,
		}
	}
}

struct Endpoint {
	api_key: ApiKey,
	host: String,
	development: bool,
}

struct LiveLink {
	outbound: mpsc::UnboundedSender<Frame>,
	reader: JoinHandle<()>,
}

struct RealtimeInner {
	me: Weak<RealtimeInner>,
	connector: Arc<dyn ChannelConnector>,
	identity: Arc<IdentityManager>,
	outbox: PersistentOutbox,
	push_provider: Option<Arc<dyn PushTokenProvider>>,
	endpoint: Mutex<Endpoint>,
	state: watch::Sender<ConnectionState>,
	link: Mutex<Option<LiveLink>>,
	generation: AtomicU64,
	last_auth: Mutex<Option<AuthParams>>,
	scheduler: ReconnectionScheduler,
	listeners: RwLock<Vec<Arc<dyn ConnectListener>>>,
	connect_lock: tokio::sync::Mutex<()>,
	/// Serializes live sends, outbox appends and outbox replay so persisted
	/// messages always go out ahead of newer ones.
	send_lock: Mutex<()>,
	connect_timeout: Duration,
	closed: AtomicBool,
	automated_push: bool,
	push_platform: String,
	verbose: bool,
}

/// Handle to the real-time transport. Clones share one connection.
#[derive(Clone)]
pub struct RealtimeTransport {
	inner: Arc<RealtimeInner>,
}

impl RealtimeTransport {
	pub fn new(
		options: RealtimeOptions,
		connector: Arc<dyn ChannelConnector>,
		identity: Arc<IdentityManager>,
		outbox: PersistentOutbox,
		push_provider: Option<Arc<dyn PushTokenProvider>>,
	) -> Self {
		let (state, _) = watch::channel(ConnectionState::Disconnected);
		let inner = Arc::new_cyclic(|me| RealtimeInner {
			me: me.clone(),
			connector,
			identity,
			outbox,
			push_provider,
			endpoint: Mutex::new(Endpoint {
				api_key: options.api_key,
				host: options.host,
				development: options.development,
			}),
			state,
			link: Mutex::new(None),
			generation: AtomicU64::new(0),
			last_auth: Mutex::new(None),
			scheduler: ReconnectionScheduler::new(
				options.reconnect_initial_delay,
				options.reconnect_max_delay,
			),
			listeners: RwLock::new(Vec::new()),
			connect_lock: tokio::sync::Mutex::new(()),
			send_lock: Mutex::new(()),
			connect_timeout: options.connect_timeout,
			closed: AtomicBool::new(false),
			automated_push: options.automated_push,
			push_platform: options.push_platform,
			verbose: options.verbose,
		});
		Self { inner }
	}

	/// Replaces the endpoint and opens a fresh channel.
	///
	/// Any live channel is torn down first. On failure the reconnection
	/// scheduler is armed and the error is returned.
	pub async fn connect(
		&self,
		api_key: impl Into<ApiKey>,
		host: impl Into<String>,
		development: bool,
	) -> Result<()> {
		{
			let mut endpoint = lock(&self.inner.endpoint);
			endpoint.api_key = api_key.into();
			endpoint.host = host.into();
			endpoint.development = development;
		}
		self.reconnect().await
	}

	/// Opens a fresh channel to the current endpoint.
	pub async fn reconnect(&self) -> Result<()> {
		let result = self.inner.open_link(true).await;
		if let Err(e) = &result {
			if !matches!(e, LaudspeakerError::ClientShutdown) {
				self.inner.arm_scheduler();
			}
		}
		result
	}

	/// Connects in the background.
	pub fn start(&self) {
		let transport = self.clone();
		tokio::spawn(async move {
			if let Err(e) = transport.reconnect().await {
				debug!(error = %e, "Initial real-time connect failed, retrying in background");
			}
		});
	}

	/// Closes the live channel without scheduling a reconnect.
	pub fn disconnect(&self) {
		self.inner.scheduler.cancel();
		let had_link = self.inner.teardown();
		self.inner.set_state(ConnectionState::Disconnected);
		if had_link {
			info!("Real-time channel disconnected");
			self.inner.notify(|l| l.on_disconnected());
		}
	}

	/// Stops the transport for good. Safe to call more than once.
	///
	/// Does not wait for an in-flight connect; that attempt drops its channel
	/// when it completes.
	pub async fn close(&self) {
		if self.inner.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		self.inner.scheduler.cancel();
		self.inner.teardown();
		self.inner.set_state(ConnectionState::Disconnected);
		debug!("Real-time transport closed");
	}

	pub fn is_closed(&self) -> bool {
		self.inner.closed.load(Ordering::SeqCst)
	}

	/// Sends the message now, or persists it to the outbox when not connected.
	pub fn emit(&self, message: OutboundMessage) -> Result<()> {
		self.inner.emit(message)
	}

	pub fn identify(&self, primary_key: &str, properties: Option<Properties>) -> Result<()> {
		if primary_key.trim().is_empty() {
			return Err(LaudspeakerError::validation("primary key is empty"));
		}
		self.emit(OutboundMessage::Identify {
			primary_key: primary_key.to_string(),
			optional_properties: properties,
		})
	}

	pub fn set(&self, properties: Properties) -> Result<()> {
		self.emit(OutboundMessage::Set {
			optional_properties: properties,
		})
	}

	/// Fires an event attributed to the current distinct id.
	pub fn fire(&self, event: &str, payload: Option<Properties>) -> Result<()> {
		if event.trim().is_empty() {
			return Err(LaudspeakerError::validation("event name is empty"));
		}
		let customer_id = self.inner.identity.distinct_id();
		if customer_id.is_empty() {
			return Err(LaudspeakerError::validation("no identity to attribute the event to"));
		}
		self.emit(OutboundMessage::Fire {
			event_name: event.to_string(),
			customer_id,
			payload: payload.unwrap_or_default(),
		})
	}

	pub fn send_push_token(&self, token: &str) -> Result<()> {
		if token.trim().is_empty() {
			return Err(LaudspeakerError::validation("push token is empty"));
		}
		self.emit(OutboundMessage::PushToken {
			platform: self.inner.push_platform.clone(),
			token: token.to_string(),
		})
	}

	pub fn ping(&self) -> Result<()> {
		self.emit(OutboundMessage::Ping)
	}

	/// Resolves the push token and sends it.
	pub async fn push_token(&self) -> Result<()> {
		self.inner.send_resolved_push_token().await
	}

	/// Replays the outbox if connected.
	pub fn replay_outbox(&self) -> Result<ReplayReport> {
		self.inner.replay_outbox()
	}

	pub fn state(&self) -> ConnectionState {
		self.inner.state()
	}

	pub fn is_connected(&self) -> bool {
		self.state().is_connected()
	}

	/// Watches state transitions.
	pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
		self.inner.state.subscribe()
	}

	pub fn add_listener(&self, listener: Arc<dyn ConnectListener>) {
		self
			.inner
			.listeners
			.write()
			.unwrap_or_else(|poisoned| poisoned.into_inner())
			.push(listener);
	}

	/// Handshake parameters used by the most recent connect attempt.
	pub fn auth_params(&self) -> Option<AuthParams> {
		lock(&self.inner.last_auth).clone()
	}

	pub fn outbox(&self) -> &PersistentOutbox {
		&self.inner.outbox
	}

	pub fn scheduler(&self) -> &ReconnectionScheduler {
		&self.inner.scheduler
	}
}

impl RealtimeInner {
	fn state(&self) -> ConnectionState {
		*self.state.borrow()
	}

	fn set_state(&self, next: ConnectionState) {
		let previous = self.state.send_replace(next);
		if previous != next {
			debug!(from = %previous, to = %next, "Real-time state changed");
		}
	}

	fn is_current(&self, generation: u64) -> bool {
		self.generation.load(Ordering::SeqCst) == generation
	}

	fn notify(&self, f: impl Fn(&dyn ConnectListener)) {
		let listeners = self
			.listeners
			.read()
			.unwrap_or_else(|poisoned| poisoned.into_inner())
			.clone();
		for listener in &listeners {
			f(listener.as_ref());
		}
	}

	fn arm_scheduler(&self) {
		if self.closed.load(Ordering::SeqCst) {
			return;
		}
		let target: Weak<dyn Reconnect> = self.me.clone();
		self.scheduler.arm(target);
	}

	fn build_auth(&self) -> (AuthParams, String) {
		let endpoint = lock(&self.endpoint);
		let auth = AuthParams {
			api_key: endpoint.api_key.expose().to_string(),
			customer_id: self.identity.distinct_id(),
			development: endpoint.development,
		};
		(auth, endpoint.host.clone())
	}

	/// Drops the live link, if any. Returns whether there was one.
	fn teardown(&self) -> bool {
		self.generation.fetch_add(1, Ordering::SeqCst);
		match lock(&self.link).take() {
			Some(link) => {
				link.reader.abort();
				true
			}
			None => false,
		}
	}

	/// Tears down the old channel and opens a new one with fresh auth.
	///
	/// `cancel_retry` is false when called from the scheduler's own task.
	async fn open_link(&self, cancel_retry: bool) -> Result<()> {
		if self.closed.load(Ordering::SeqCst) {
			return Err(LaudspeakerError::ClientShutdown);
		}
		let _guard = self.connect_lock.lock().await;
		if self.closed.load(Ordering::SeqCst) {
			return Err(LaudspeakerError::ClientShutdown);
		}

		self.teardown();
		self.set_state(ConnectionState::Connecting);
		if self.closed.load(Ordering::SeqCst) {
			self.set_state(ConnectionState::Disconnected);
			return Err(LaudspeakerError::ClientShutdown);
		}

		let (auth, host) = self.build_auth();
		*lock(&self.last_auth) = Some(auth.clone());

		let connected = match realtime_url(&host) {
			Ok(url) => {
				let attempt = self.connector.connect(url.as_str(), &auth);
				match tokio::time::timeout(self.connect_timeout, attempt).await {
					Ok(result) => result,
					Err(_) => Err(LaudspeakerError::ConnectFailed(format!(
						"timed out after {:?}",
						self.connect_timeout
					))),
				}
			}
			Err(e) => Err(e),
		};

		let link = match connected {
			Ok(link) => link,
			Err(e) => {
				self.set_state(ConnectionState::Disconnected);
				if self.closed.load(Ordering::SeqCst) {
					return Err(LaudspeakerError::ClientShutdown);
				}
				warn!(error = %e, host = %host, "Real-time connect failed");
				let message = e.to_string();
				self.notify(|l| l.on_error(&message));
				return Err(e);
			}
		};

		// Install the link and drain the outbox before publishing `Connected`,
		// all under the send lock, so no emit can overtake a persisted message.
		let replayed = {
			let _sending = lock(&self.send_lock);
			let (generation, outbound) = {
				let mut slot = lock(&self.link);
				if self.closed.load(Ordering::SeqCst) {
					self.set_state(ConnectionState::Disconnected);
					debug!("Transport closed while connecting, dropping channel");
					return Err(LaudspeakerError::ClientShutdown);
				}
				let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
				let ChannelLink { outbound, inbound } = link;
				let reader = tokio::spawn(read_loop(self.me.clone(), generation, inbound));
				*slot = Some(LiveLink {
					outbound: outbound.clone(),
					reader,
				});
				(generation, outbound)
			};

			let replayed = self.replay_into(&outbound);
			let slot = lock(&self.link);
			if self.is_current(generation) && slot.is_some() {
				self.set_state(ConnectionState::Connected);
			}
			replayed
		};
		if let Err(e) = replayed {
			warn!(error = %e, "Failed to replay outbox after connect");
		}

		self.scheduler.reset_backoff();
		if cancel_retry {
			self.scheduler.cancel();
		}
		info!(host = %host, customer_id = %auth.customer_id, "Real-time channel connected");
		self.notify(|l| l.on_connected());
		Ok(())
	}

	fn current_outbound(&self) -> Option<mpsc::UnboundedSender<Frame>> {
		if !self.state().is_connected() {
			return None;
		}
		lock(&self.link)
			.as_ref()
			.map(|link| link.outbound.clone())
			.filter(|outbound| !outbound.is_closed())
	}

	fn emit(&self, message: OutboundMessage) -> Result<()> {
		if self.closed.load(Ordering::SeqCst) {
			return Err(LaudspeakerError::ClientShutdown);
		}
		let channel = message.channel();
		let frame = Frame::from_message(&message)?;

		let _sending = lock(&self.send_lock);
		if let Some(outbound) = self.current_outbound() {
			if outbound.send(frame).is_ok() {
				self.scheduler.reset_backoff();
				crate::diag!(self.verbose, channel = %channel, "Sent real-time message");
				return Ok(());
			}
		}

		let record = OutboxRecord::from_message(&message)?;
		self.outbox.append(&record)
	}

	fn replay_outbox(&self) -> Result<ReplayReport> {
		let _sending = lock(&self.send_lock);
		match self.current_outbound() {
			Some(outbound) => self.replay_into(&outbound),
			None => Ok(ReplayReport::default()),
		}
	}

	/// Sends every outbox record over `outbound`. Caller holds `send_lock`.
	fn replay_into(&self, outbound: &mpsc::UnboundedSender<Frame>) -> Result<ReplayReport> {
		let report = self.outbox.replay(|record| {
			let frame = record.to_frame()?;
			outbound
				.send(frame)
				.map_err(|_| LaudspeakerError::ChannelClosed)
		})?;

		if report != ReplayReport::default() {
			crate::diag!(
				self.verbose,
				sent = report.sent,
				dropped = report.dropped,
				remaining = report.remaining,
				"Replayed outbox"
			);
		}
		Ok(report)
	}

	fn handle_message(&self, message: InboundMessage) {
		match message {
			InboundMessage::Log(text) => {
				info!(message = %text, "Real-time server log");
				self.notify(|l| l.on_error(&text));
			}
			InboundMessage::Error(data) => {
				warn!(error = %data, "Real-time server error");
				let message = data.to_string();
				self.notify(|l| l.on_error(&message));
			}
			InboundMessage::CustomerId(id) => self.adopt_customer_id(id),
			InboundMessage::Flush => {
				if let Err(e) = self.replay_outbox() {
					warn!(error = %e, "Failed to replay outbox on server request");
				}
			}
			InboundMessage::Unknown { event, .. } => {
				debug!(event = %event, "Ignoring unknown real-time message");
			}
		}
	}

	fn adopt_customer_id(&self, customer_id: String) {
		if let Err(e) = self.identity.set_distinct_id(&customer_id) {
			warn!(error = %e, "Ignoring server customer id");
			return;
		}
		info!(customer_id = %customer_id, "Server assigned customer id");

		let me = self.me.clone();
		tokio::spawn(async move {
			let Some(inner) = me.upgrade() else {
				return;
			};
			if let Err(e) = inner.open_link(true).await {
				warn!(error = %e, "Reconnect after customer id change failed");
				inner.arm_scheduler();
				return;
			}
			if inner.automated_push {
				if let Err(e) = inner.send_resolved_push_token().await {
					warn!(error = %e, "Failed to send push token");
				}
			}
		});
	}

	fn handle_closed(&self, generation: u64, error: Option<String>) {
		{
			let mut slot = lock(&self.link);
			if !self.is_current(generation) {
				return;
			}
			slot.take();
		}

		match &error {
			Some(e) => {
				self.set_state(ConnectionState::Error);
				warn!(error = %e, "Real-time channel failed");
			}
			None => {
				self.set_state(ConnectionState::Disconnected);
				info!("Real-time channel closed by server");
			}
		}

		self.notify(|l| l.on_disconnected());
		if let Some(e) = &error {
			self.notify(|l| l.on_error(e));
		}
		self.arm_scheduler();
	}

	async fn send_resolved_push_token(&self) -> Result<()> {
		let token = push::resolve_token(&self.identity, self.push_provider.as_ref()).await?;
		self.emit(OutboundMessage::PushToken {
			platform: self.push_platform.clone(),
			token,
		})
	}
}

#[async_trait::async_trait]
impl Reconnect for RealtimeInner {
	fn is_connected(&self) -> bool {
		self.state().is_connected()
	}

	async fn reconnect(&self) -> Result<()> {
		self.open_link(false).await
	}
}

async fn read_loop(
	weak: Weak<RealtimeInner>,
	generation: u64,
	mut inbound: mpsc::UnboundedReceiver<ChannelEvent>,
) {
	while let Some(event) = inbound.recv().await {
		let Some(inner) = weak.upgrade() else {
			return;
		};
		if !inner.is_current(generation) {
			return;
		}
		match event {
			ChannelEvent::Message(message) => inner.handle_message(message),
			ChannelEvent::Closed { error } => {
				inner.handle_closed(generation, error);
				return;
			}
		}
	}

	if let Some(inner) = weak.upgrade() {
		inner.handle_closed(generation, None);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::identity::IdentityStore;
	use crate::push::StaticTokenProvider;
	use crate::store::MemoryStore;
	use std::sync::atomic::AtomicUsize;
	use tempfile::TempDir;

	#[derive(Default)]
	struct MockConnector {
		peers: Mutex<Vec<ChannelPeer>>,
		auths: Mutex<Vec<AuthParams>>,
		urls: Mutex<Vec<String>>,
		fail: AtomicBool,
		stall: AtomicBool,
		connects: AtomicUsize,
	}

	impl MockConnector {
		fn next_peer(&self) -> ChannelPeer {
			lock(&self.peers).remove(0)
		}

		fn connects(&self) -> usize {
			self.connects.load(Ordering::SeqCst)
		}
	}

	#[async_trait::async_trait]
	impl ChannelConnector for MockConnector {
		async fn connect(&self, url: &str, auth: &AuthParams) -> Result<ChannelLink> {
			self.connects.fetch_add(1, Ordering::SeqCst);
			lock(&self.auths).push(auth.clone());
			lock(&self.urls).push(url.to_string());
			if self.stall.load(Ordering::SeqCst) {
				futures::future::pending::<()>().await;
			}
			if self.fail.load(Ordering::SeqCst) {
				return Err(LaudspeakerError::ConnectFailed("connection refused".into()));
			}
			let (link, peer) = ChannelLink::pair();
			lock(&self.peers).push(peer);
			Ok(link)
		}
	}

	#[derive(Default)]
	struct CountingListener {
		connected: AtomicUsize,
		disconnected: AtomicUsize,
		errors: Mutex<Vec<String>>,
	}

	impl ConnectListener for CountingListener {
		fn on_connected(&self) {
			self.connected.fetch_add(1, Ordering::SeqCst);
		}

		fn on_disconnected(&self) {
			self.disconnected.fetch_add(1, Ordering::SeqCst);
		}

		fn on_error(&self, message: &str) {
			lock(&self.errors).push(message.to_string());
		}
	}

	struct Harness {
		transport: RealtimeTransport,
		connector: Arc<MockConnector>,
		identity: Arc<IdentityManager>,
		_dir: TempDir,
	}

	fn harness_with(configure: impl FnOnce(Config) -> Config) -> Harness {
		let dir = TempDir::new().unwrap();
		let config = configure(
			Config::new("test-key")
				.with_host("https://api.laudspeaker.test/v1")
				.with_reconnect_delays(Duration::from_secs(1), Duration::from_secs(8)),
		);
		let identity = Arc::new(IdentityManager::new(
			IdentityStore::new(Arc::new(MemoryStore::new()), None),
			false,
		));
		let connector = Arc::new(MockConnector::default());
		let outbox = PersistentOutbox::open(dir.path().join("message_queue.txt"), false).unwrap();
		let transport = RealtimeTransport::new(
			RealtimeOptions::from(&config),
			connector.clone(),
			identity.clone(),
			outbox,
			Some(Arc::new(StaticTokenProvider::new("fcm-token-1"))),
		);
		Harness {
			transport,
			connector,
			identity,
			_dir: dir,
		}
	}

	fn harness() -> Harness {
		harness_with(|c| c)
	}

	fn drain(peer: &mut ChannelPeer) -> Vec<Frame> {
		let mut frames = Vec::new();
		while let Ok(frame) = peer.frames.try_recv() {
			frames.push(frame);
		}
		frames
	}

	async fn eventually(mut condition: impl FnMut() -> bool) {
		for _ in 0..200 {
			if condition() {
				return;
			}
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
		panic!("condition not reached");
	}

	#[tokio::test]
	async fn disconnected_emits_are_persisted_then_replayed_in_order() {
		let h = harness();
		h.transport
			.identify("user-1", Some(Properties::new().insert("plan", "pro")))
			.unwrap();
		h.transport.set(Properties::new().insert("age", 30)).unwrap();
		h.transport.fire("purchase", None).unwrap();
		assert_eq!(h.transport.outbox().len().unwrap(), 3);

		h.transport.reconnect().await.unwrap();

		let mut peer = h.connector.next_peer();
		let events: Vec<String> = drain(&mut peer).into_iter().map(|f| f.event).collect();
		assert_eq!(events, vec!["identify", "set", "fire"]);
		assert!(h.transport.outbox().is_empty().unwrap());
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn emits_during_reconnect_queue_behind_the_outbox() {
		let expected: Vec<String> = std::iter::once("old".to_string())
			.chain((0..20).map(|i| format!("new{i}")))
			.collect();

		for round in 0..50 {
			let h = harness();
			h.transport.fire("old", None).unwrap();

			let emitter = h.transport.clone();
			let fired = std::thread::spawn(move || {
				for i in 0..20 {
					emitter.fire(&format!("new{i}"), None).unwrap();
					std::thread::yield_now();
				}
			});
			h.transport.reconnect().await.unwrap();
			tokio::task::spawn_blocking(move || fired.join().unwrap())
				.await
				.unwrap();

			assert!(h.transport.is_connected());
			assert!(h.transport.outbox().is_empty().unwrap(), "round {round}");
			let mut peer = h.connector.next_peer();
			let names: Vec<String> = drain(&mut peer)
				.iter()
				.map(|f| f.data["eventName"].as_str().unwrap().to_string())
				.collect();
			assert_eq!(names, expected, "round {round}");
		}
	}

	#[tokio::test]
	async fn connected_emit_goes_straight_to_channel() {
		let h = harness();
		h.transport.reconnect().await.unwrap();
		assert!(h.transport.is_connected());

		h.transport.ping().unwrap();
		h.transport.send_push_token("tok").unwrap();

		let mut peer = h.connector.next_peer();
		let frames = drain(&mut peer);
		assert_eq!(frames[0].event, "ping");
		assert_eq!(frames[1].event, "fcm_token");
		assert_eq!(frames[1].data, serde_json::json!({"type": "Android", "token": "tok"}));
		assert!(h.transport.outbox().is_empty().unwrap());
	}

	#[tokio::test]
	async fn auth_is_rebuilt_on_every_connect() {
		let h = harness();
		let anon = h.identity.anonymous_id();

		h.transport.reconnect().await.unwrap();
		h.identity.set_distinct_id("user-9").unwrap();
		h.transport
			.connect("other-key", "http://localhost:3001", true)
			.await
			.unwrap();

		let auths = lock(&h.connector.auths).clone();
		assert_eq!(auths[0].customer_id, anon);
		assert_eq!(auths[0].api_key, "test-key");
		assert!(!auths[0].development);
		assert_eq!(auths[1].customer_id, "user-9");
		assert_eq!(auths[1].api_key, "other-key");
		assert!(auths[1].development);

		let urls = lock(&h.connector.urls).clone();
		assert_eq!(urls, vec!["wss://api.laudspeaker.test/", "ws://localhost:3001/"]);
		assert_eq!(h.transport.auth_params().unwrap().customer_id, "user-9");
	}

	#[tokio::test]
	async fn server_customer_id_updates_identity_and_reconnects() {
		let h = harness_with(|c| c.with_automated_push(true));
		h.transport.reconnect().await.unwrap();
		let first = h.connector.next_peer();

		first.deliver(InboundMessage::CustomerId("cust-7".into()));
		eventually(|| h.connector.connects() == 2 && lock(&h.connector.peers).len() == 1).await;

		assert_eq!(h.identity.distinct_id(), "cust-7");
		assert_eq!(lock(&h.connector.auths)[1].customer_id, "cust-7");

		let mut second = h.connector.next_peer();
		let frame = tokio::time::timeout(Duration::from_secs(1), second.frames.recv())
			.await
			.unwrap()
			.unwrap();
		assert_eq!(frame.event, "fcm_token");
		assert_eq!(frame.data["token"], "fcm-token-1");
	}

	#[tokio::test]
	async fn server_flush_replays_outbox() {
		let h = harness();
		h.transport.reconnect().await.unwrap();
		let mut peer = h.connector.next_peer();

		let record = OutboxRecord::from_message(&OutboundMessage::Set {
			optional_properties: Properties::new().insert("k", "v"),
		})
		.unwrap();
		h.transport.outbox().append(&record).unwrap();

		peer.deliver(InboundMessage::Flush);
		let frame = tokio::time::timeout(Duration::from_secs(1), peer.frames.recv())
			.await
			.unwrap()
			.unwrap();
		assert_eq!(frame.event, "set");
		assert!(h.transport.outbox().is_empty().unwrap());
	}

	#[tokio::test(start_paused = true)]
	async fn lost_channel_is_retried() {
		let h = harness();
		let listener = Arc::new(CountingListener::default());
		h.transport.add_listener(listener.clone());
		let mut state = h.transport.subscribe();

		h.transport.reconnect().await.unwrap();
		let peer = h.connector.next_peer();
		peer.close(Some("connection reset".into()));

		state.wait_for(|s| *s == ConnectionState::Error).await.unwrap();
		assert!(h.transport.scheduler().is_armed());
		h.transport.fire("offline", None).unwrap();
		assert_eq!(h.transport.outbox().len().unwrap(), 1);

		tokio::time::sleep(Duration::from_millis(1_500)).await;
		state.wait_for(|s| s.is_connected()).await.unwrap();

		assert_eq!(h.connector.connects(), 2);
		assert_eq!(listener.connected.load(Ordering::SeqCst), 2);
		assert_eq!(listener.disconnected.load(Ordering::SeqCst), 1);
		assert!(lock(&listener.errors).contains(&"connection reset".to_string()));

		let mut second = h.connector.next_peer();
		assert_eq!(drain(&mut second)[0].event, "fire");
		assert!(h.transport.outbox().is_empty().unwrap());
	}

	#[tokio::test(start_paused = true)]
	async fn connect_failure_backs_off_then_resets() {
		let h = harness();
		h.connector.fail.store(true, Ordering::SeqCst);

		assert!(h.transport.reconnect().await.is_err());
		assert_eq!(h.transport.state(), ConnectionState::Disconnected);
		assert!(h.transport.scheduler().is_armed());

		tokio::time::sleep(Duration::from_millis(1_100)).await;
		assert_eq!(h.connector.connects(), 2);
		tokio::time::sleep(Duration::from_millis(2_000)).await;
		assert_eq!(h.connector.connects(), 3);
		assert_eq!(h.transport.scheduler().current_delay(), Duration::from_secs(4));

		h.connector.fail.store(false, Ordering::SeqCst);
		tokio::time::sleep(Duration::from_millis(4_000)).await;
		assert!(h.transport.is_connected());
		assert_eq!(h.transport.scheduler().failures(), 0);
		assert_eq!(h.transport.scheduler().current_delay(), Duration::from_secs(1));
	}

	#[tokio::test]
	async fn successful_send_resets_backoff() {
		let h = harness();
		h.transport.reconnect().await.unwrap();
		h.transport.scheduler().record_failure();
		h.transport.scheduler().record_failure();
		assert_eq!(h.transport.scheduler().failures(), 2);
		assert_eq!(h.transport.scheduler().current_delay(), Duration::from_secs(4));

		h.transport.ping().unwrap();
		assert_eq!(h.transport.scheduler().failures(), 0);
		assert_eq!(h.transport.scheduler().current_delay(), Duration::from_secs(1));
	}

	#[tokio::test]
	async fn failed_send_keeps_backoff() {
		let h = harness();
		h.transport.scheduler().record_failure();

		h.transport.ping().unwrap();
		assert_eq!(h.transport.outbox().len().unwrap(), 1);
		assert_eq!(h.transport.scheduler().failures(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn stalled_connect_times_out() {
		let h = harness_with(|mut c| {
			c.request_timeout_secs = 5;
			c
		});
		h.connector.stall.store(true, Ordering::SeqCst);
		let started = tokio::time::Instant::now();

		let result = h.transport.reconnect().await;
		assert!(matches!(result, Err(LaudspeakerError::ConnectFailed(_))));
		assert!(started.elapsed() >= Duration::from_secs(5));
		assert_eq!(h.transport.state(), ConnectionState::Disconnected);
		assert!(h.transport.scheduler().is_armed());
		h.transport.close().await;
	}

	#[tokio::test]
	async fn close_does_not_wait_for_a_stalled_connect() {
		let h = harness();
		h.connector.stall.store(true, Ordering::SeqCst);
		h.transport.start();
		eventually(|| h.connector.connects() == 1).await;
		assert_eq!(h.transport.state(), ConnectionState::Connecting);

		let closed = tokio::time::timeout(Duration::from_secs(3), h.transport.close()).await;
		assert!(closed.is_ok());
		assert!(h.transport.is_closed());
		assert_eq!(h.transport.state(), ConnectionState::Disconnected);
	}

	#[tokio::test]
	async fn explicit_disconnect_does_not_reconnect() {
		let h = harness();
		let listener = Arc::new(CountingListener::default());
		h.transport.add_listener(listener.clone());
		h.transport.reconnect().await.unwrap();

		h.transport.disconnect();
		assert_eq!(h.transport.state(), ConnectionState::Disconnected);
		assert!(!h.transport.scheduler().is_armed());
		assert_eq!(listener.disconnected.load(Ordering::SeqCst), 1);

		h.transport.ping().unwrap();
		assert_eq!(h.transport.outbox().len().unwrap(), 1);
	}

	#[tokio::test]
	async fn close_is_idempotent_and_final() {
		let h = harness();
		h.connector.fail.store(true, Ordering::SeqCst);
		let _ = h.transport.reconnect().await;
		assert!(h.transport.scheduler().is_armed());

		h.transport.close().await;
		h.transport.close().await;

		assert!(h.transport.is_closed());
		assert!(!h.transport.scheduler().is_armed());
		assert!(matches!(h.transport.ping(), Err(LaudspeakerError::ClientShutdown)));
		assert!(matches!(
			h.transport.reconnect().await,
			Err(LaudspeakerError::ClientShutdown)
		));
	}

	#[tokio::test]
	async fn server_log_and_error_reach_listeners() {
		let h = harness();
		let listener = Arc::new(CountingListener::default());
		h.transport.add_listener(listener.clone());
		h.transport.reconnect().await.unwrap();
		let peer = h.connector.next_peer();

		peer.deliver(InboundMessage::Log("hello".into()));
		peer.deliver(InboundMessage::Error(serde_json::json!({"code": 4})));
		eventually(|| lock(&listener.errors).len() == 2).await;

		let errors = lock(&listener.errors).clone();
		assert_eq!(errors[0], "hello");
		assert!(errors[1].contains("\"code\":4"));
		assert!(h.transport.is_connected());
	}

	#[tokio::test]
	async fn invalid_messages_are_rejected() {
		let h = harness();
		assert!(matches!(
			h.transport.identify(" ", None),
			Err(LaudspeakerError::Validation(_))
		));
		assert!(matches!(
			h.transport.fire("", None),
			Err(LaudspeakerError::Validation(_))
		));
		assert!(matches!(
			h.transport.send_push_token(""),
			Err(LaudspeakerError::Validation(_))
		));
		assert!(h.transport.outbox().is_empty().unwrap());
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! WebSocket implementation of [`ChannelConnector`].
//!
//! Frames are JSON text messages `{"event", "data"}`. The first frame after
//! the handshake carries the auth parameters.

use futures::{SinkExt, StreamExt};
use laudspeaker_core::{AuthParams, Frame};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use super::channel::{ChannelConnector, ChannelEvent, ChannelLink, ChannelPeer};
use crate::error::{LaudspeakerError, Result};

/// Maps the configured host to the channel URL: scheme and authority only,
/// `http` to `ws` and `https` to `wss`.
pub fn realtime_url(host: &str) -> Result<Url> {
	let mut url =
		Url::parse(host.trim()).map_err(|e| LaudspeakerError::InvalidHost(format!("{host}: {e}")))?;

	let scheme = match url.scheme() {
		"http" | "ws" => "ws",
		"https" | "wss" => "wss",
		other => {
			return Err(LaudspeakerError::InvalidHost(format!(
				"unsupported scheme {other}"
			)))
		}
	};
	url
		.set_scheme(scheme)
		.map_err(|_| LaudspeakerError::InvalidHost(host.to_string()))?;
	url.set_path("/");
	url.set_query(None);
	url.set_fragment(None);
	Ok(url)
}

/// Connects over `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait::async_trait]
impl ChannelConnector for WebSocketConnector {
	async fn connect(&self, url: &str, auth: &AuthParams) -> Result<ChannelLink> {
		let (ws_stream, _) = connect_async(url)
			.await
			.map_err(|e| LaudspeakerError::ConnectFailed(e.to_string()))?;
		let (mut write, mut read) = ws_stream.split();

		let auth_frame = serde_json::to_string(&Frame::auth(auth)?)?;
		write
			.send(Message::Text(auth_frame))
			.await
			.map_err(|e| LaudspeakerError::ConnectFailed(e.to_string()))?;
		debug!(url = %url, customer_id = %auth.customer_id, "WebSocket channel open");

		let (link, peer) = ChannelLink::pair();
		let ChannelPeer { mut frames, events } = peer;
		let (pong_tx, mut pong_rx) = mpsc::channel::<Vec<u8>>(16);

		tokio::spawn(async move {
			loop {
				tokio::select! {
					frame = frames.recv() => {
						let Some(frame) = frame else {
							let _ = write.send(Message::Close(None)).await;
							break;
						};
						let text = match serde_json::to_string(&frame) {
							Ok(text) => text,
							Err(e) => {
								warn!(error = %e, event = %frame.event, "Dropping unserializable frame");
								continue;
							}
						};
						if let Err(e) = write.send(Message::Text(text)).await {
							debug!(error = %e, "WebSocket write failed");
							break;
						}
					}
					Some(data) = pong_rx.recv() => {
						if write.send(Message::Pong(data)).await.is_err() {
							break;
						}
					}
				}
			}
		});

		tokio::spawn(async move {
			let mut error = None;
			while let Some(msg) = read.next().await {
				match msg {
					Ok(Message::Text(text)) => match serde_json::from_str::<Frame>(&text) {
						Ok(frame) => {
							if events.send(ChannelEvent::Message(frame.into())).is_err() {
								return;
							}
						}
						Err(e) => warn!(error = %e, "Ignoring malformed real-time frame"),
					},
					Ok(Message::Ping(data)) => {
						let _ = pong_tx.send(data).await;
					}
					Ok(Message::Close(frame)) => {
						debug!(?frame, "WebSocket closed by server");
						break;
					}
					Ok(_) => {}
					Err(e) => {
						error = Some(e.to_string());
						break;
					}
				}
			}
			let _ = events.send(ChannelEvent::Closed { error });
		});

		Ok(link)
	}
}

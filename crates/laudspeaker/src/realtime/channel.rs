// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Transport-neutral view of a real-time connection.

use laudspeaker_core::{AuthParams, Frame, InboundMessage};
use tokio::sync::mpsc;

use crate::error::Result;

/// Something the live channel reports to the SDK.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
	Message(InboundMessage),
	/// The link ended. `error` is set when it ended because of a failure.
	Closed { error: Option<String> },
}

/// SDK side of an open channel.
///
/// Dropping `outbound` asks the connection to close.
#[derive(Debug)]
pub struct ChannelLink {
	pub outbound: mpsc::UnboundedSender<Frame>,
	pub inbound: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// Connection side of an open channel.
#[derive(Debug)]
pub struct ChannelPeer {
	pub frames: mpsc::UnboundedReceiver<Frame>,
	pub events: mpsc::UnboundedSender<ChannelEvent>,
}

impl ChannelPeer {
	pub fn deliver(&self, message: InboundMessage) -> bool {
		self.events.send(ChannelEvent::Message(message)).is_ok()
	}

	pub fn close(&self, error: Option<String>) -> bool {
		self.events.send(ChannelEvent::Closed { error }).is_ok()
	}
}

impl ChannelLink {
	/// Creates a connected link/peer pair.
	pub fn pair() -> (ChannelLink, ChannelPeer) {
		let (outbound, frames) = mpsc::unbounded_channel();
		let (events, inbound) = mpsc::unbounded_channel();
		(ChannelLink { outbound, inbound }, ChannelPeer { frames, events })
	}
}

/// Opens real-time channels.
///
/// `connect` resolves once the handshake, including the auth frame, is done.
#[async_trait::async_trait]
pub trait ChannelConnector: Send + Sync {
	async fn connect(&self, url: &str, auth: &AuthParams) -> Result<ChannelLink>;
}

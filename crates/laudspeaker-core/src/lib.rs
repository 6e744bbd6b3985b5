// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core types for the Laudspeaker event-delivery SDK.
//!
//! This crate holds the data model shared by the batch and real-time
//! delivery paths. It performs no I/O:
//!
//! - [`Event`] and [`BatchPayload`]: the batch ingestion wire format
//! - [`Properties`]: ordered property map builder
//! - [`identity`]: storage keys and the [`StoredValue`] lookup variant
//! - [`message`]: real-time channel names, outbound/inbound messages and framing
//! - [`OutboxRecord`]: durable outbox line codec
//! - [`ConnectionState`]: real-time transport state machine states

pub mod connection;
pub mod event;
pub mod identity;
pub mod message;
pub mod outbox;
pub mod properties;

pub use connection::ConnectionState;
pub use event::{
	BatchPayload, Event, EventId, SingleEventPayload, CORRELATION_KEY, EVENT_SOURCE, IDENTIFY_EVENT,
	PUSH_TOKEN_EVENT, SET_EVENT,
};
pub use identity::{StorageKey, StoredValue};
pub use message::{AuthParams, Channel, Frame, InboundMessage, OutboundMessage};
pub use outbox::{OutboxDecodeError, OutboxRecord};
pub use properties::Properties;

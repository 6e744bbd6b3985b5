// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Device push token retrieval.
//!
//! The host application registers a [`PushTokenProvider`]. The SDK asks it
//! only when no token is cached in memory or persisted.

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::error::{LaudspeakerError, Result};
use crate::identity::IdentityManager;

#[derive(Debug, Error)]
pub enum PushTokenError {
	#[error("push messaging is not available on this device")]
	Unavailable,

	#[error("{0}")]
	Failed(String),
}

impl From<PushTokenError> for LaudspeakerError {
	fn from(e: PushTokenError) -> Self {
		LaudspeakerError::PushToken(e.to_string())
	}
}

/// Source of the platform push token.
///
/// Each call resolves exactly once, with either a token or an error.
#[async_trait::async_trait]
pub trait PushTokenProvider: Send + Sync {
	async fn fetch_token(&self) -> std::result::Result<String, PushTokenError>;
}

/// Provider returning a fixed token.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider(String);

impl StaticTokenProvider {
	pub fn new(token: impl Into<String>) -> Self {
		Self(token.into())
	}
}

#[async_trait::async_trait]
impl PushTokenProvider for StaticTokenProvider {
	async fn fetch_token(&self) -> std::result::Result<String, PushTokenError> {
		Ok(self.0.clone())
	}
}

/// Resolves the push token: memory cache, then store, then provider.
///
/// A token fetched from the provider is persisted before it is returned.
pub async fn resolve_token(
	identity: &IdentityManager,
	provider: Option<&Arc<dyn PushTokenProvider>>,
) -> Result<String> {
	if let Some(token) = identity.push_token() {
		return Ok(token);
	}

	let provider =
		provider.ok_or_else(|| LaudspeakerError::PushToken("no push token provider registered".into()))?;
	let token = provider.fetch_token().await?;
	if token.trim().is_empty() {
		return Err(LaudspeakerError::PushToken("provider returned an empty token".into()));
	}

	identity.set_push_token(&token)?;
	debug!("Fetched push token from provider");
	Ok(token)
}

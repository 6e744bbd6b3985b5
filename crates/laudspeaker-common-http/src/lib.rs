// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Shared HTTP utilities for the Laudspeaker SDK.
//!
//! This crate provides:
//! - A pre-configured HTTP client carrying the SDK `User-Agent` header
//! - Classification of transport failures into retryable and permanent

mod client;
mod retry;

pub use client::{builder, new_client_with_timeout, user_agent};
pub use retry::{is_retryable_status, RetryableError};

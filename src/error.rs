// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Failure categories surfaced by the allocator.
//!
//! Errors travel as [`anyhow::Error`] throughout the crate; callers that need
//! to distinguish outcomes downcast to [`AllocatorError`]. The allocate retry
//! loop uses the same classification to decide whether an attempt is worth
//! repeating.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AllocatorError {
    /// Construction-time configuration problem, fatal.
    #[error("invalid allocator configuration: {0}")]
    Config(String),

    /// The caller's cancellation token fired mid-operation.
    #[error("operation cancelled while {0}")]
    Cancelled(String),

    /// Another participant or local task won a race; the operation is safe
    /// to retry.
    #[error("allocation contention: {0}")]
    Contention(String),

    /// Every identifier in the configured range is taken.
    #[error("no more available IDs in configured space")]
    PoolExhausted,

    /// The key-value store refused or failed an operation.
    #[error("kvstore operation failed: {0}")]
    Store(String),

    /// A master record carries a value the installed key type cannot parse.
    #[error("unparseable master record at {key}: {reason}")]
    Corruption { key: String, reason: String },
}

impl AllocatorError {
    /// Whether the allocate retry loop should try again after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Contention(_) | Self::Store(_))
    }
}

/// Classify an error travelling as `anyhow::Error`. Anything that is not a
/// known non-retryable category is treated as transient store trouble.
pub(crate) fn is_retryable(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<AllocatorError>() {
        Some(e) => e.is_retryable(),
        None => true,
    }
}

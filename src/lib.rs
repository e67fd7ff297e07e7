// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Distributed identifier allocator backed by a shared key-value store.
//!
//! The [`Allocator`] maps arbitrary application keys to numeric identifiers.
//! Participants on different machines request identifiers in parallel and
//! converge on the same identifier per key; identifiers whose last reference
//! disappears are reclaimed by a two-round garbage collector. Per-process
//! references live in lease-bound store records, so a crashed participant
//! releases its share automatically once the lease expires.
//!
//! Lookups are served from an eventually consistent local cache fed by a
//! store watch stream; only allocation and release touch the store.

pub use anyhow::{anyhow as error, bail as raise, Context as ErrorContext, Error, Result};

pub mod allocator;
pub mod backoff;
pub mod config;
pub mod error;
pub mod gc;
pub mod id_pool;
pub mod key;
pub mod logging;
pub mod store;

mod cache;
mod local_keys;

pub use allocator::{Allocator, AllocatorBuilder, AllocatorEvent, EventKind, RemoteCache};
pub use config::Settings;
pub use error::AllocatorError;
pub use gc::GarbageCollector;
pub use key::{AllocatorKey, Id, StringKey};
pub use tokio_util::sync::CancellationToken;

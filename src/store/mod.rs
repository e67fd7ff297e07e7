// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Narrow client interface over the shared key-value store.
//!
//! The allocator consumes the store exclusively through [`KvStore`]: plain
//! and conditional writes, prefix listing, advisory locks, and watch streams
//! that fuse an initial snapshot with live updates. Two implementations
//! exist: [`etcd::EtcdStore`] for production and [`memory::MemoryStore`] for
//! in-process use and tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::Result;

pub mod etcd;
pub mod memory;

/// Value plus the revision at which it was last modified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub value: Vec<u8>,
    pub mod_revision: u64,
}

/// What happened to a watched key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvEventKind {
    Create,
    Modify,
    Delete,
    /// The initial snapshot has been fully delivered; emitted exactly once
    /// per stream, after the snapshot's `Create` events and before any live
    /// update.
    ListDone,
}

/// One entry of a watch stream. `key` and `value` are empty for `ListDone`.
#[derive(Debug, Clone)]
pub struct KvEvent {
    pub kind: KvEventKind,
    pub key: String,
    pub value: Vec<u8>,
}

impl KvEvent {
    pub(crate) fn list_done() -> Self {
        KvEvent {
            kind: KvEventKind::ListDone,
            key: String::new(),
            value: Vec::new(),
        }
    }
}

/// Capability bits a backend may advertise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities(u32);

impl Capabilities {
    /// Conditional creation is atomic: `create_only` cannot race another
    /// writer into overwriting an existing key.
    pub const CREATE_IF_EXISTS: Capabilities = Capabilities(1 << 0);

    /// Keys can be deleted atomically on a reference count reaching zero.
    pub const DELETE_ON_ZERO_COUNT: Capabilities = Capabilities(1 << 1);

    pub fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }

    /// Both bits are required before allocation could skip the distributed
    /// lock.
    pub fn supports_lockless(self) -> bool {
        self.contains(Self::CREATE_IF_EXISTS) && self.contains(Self::DELETE_ON_ZERO_COUNT)
    }
}

impl std::ops::BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Capabilities) -> Capabilities {
        Capabilities(self.0 | rhs.0)
    }
}

/// A held advisory lock. Must be unlocked on every exit path; the `*_if_locked`
/// store operations verify the holder is still current where the backend can
/// express that.
#[async_trait]
pub trait KvLock: Send + Sync {
    async fn unlock(self: Box<Self>) -> Result<()>;

    /// Store key proving ownership of the lock, if the backend materializes
    /// one. Conditional operations compare against it.
    fn ownership_key(&self) -> Option<Vec<u8>>;
}

/// Client interface to the shared key-value store.
///
/// Keys written with `lease = true` are bound to the client's session lease
/// and disappear when the session dies.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Create `key` only if it does not exist yet. Returns false when the
    /// key was already present.
    async fn create_only(&self, key: &str, value: &[u8], lease: bool) -> Result<bool>;

    async fn create_only_if_locked(
        &self,
        key: &str,
        value: &[u8],
        lease: bool,
        lock: &dyn KvLock,
    ) -> Result<bool>;

    /// Write `key` unless it already holds `value` under the expected lease
    /// binding. Returns true when a write happened.
    async fn update_if_different(&self, key: &str, value: &[u8], lease: bool) -> Result<bool>;

    async fn update_if_different_if_locked(
        &self,
        key: &str,
        value: &[u8],
        lease: bool,
        lock: &dyn KvLock,
    ) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn delete_if_locked(&self, key: &str, lock: &dyn KvLock) -> Result<()>;

    async fn delete_prefix(&self, prefix: &str) -> Result<()>;

    async fn list_prefix(&self, prefix: &str) -> Result<BTreeMap<String, KvPair>>;

    async fn list_prefix_if_locked(
        &self,
        prefix: &str,
        lock: &dyn KvLock,
    ) -> Result<BTreeMap<String, KvPair>>;

    /// Subscribe to `prefix`. The stream opens with the current contents as
    /// `Create` events, then a single `ListDone`, then live updates until the
    /// token fires or the receiver is dropped.
    async fn watch(
        &self,
        prefix: &str,
        shutdown: CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<KvEvent>>;

    /// Acquire the advisory lock at `path`, waiting until it is free or the
    /// token fires.
    async fn lock_path(&self, token: &CancellationToken, path: &str) -> Result<Box<dyn KvLock>>;

    fn capabilities(&self) -> Capabilities;
}

// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process implementation of the store contract.
//!
//! One [`MemoryStore`] owns a hub of entries; [`MemoryStore::session`]
//! derives additional handles that share the hub but hold their own lease,
//! so several allocator participants can be simulated inside one process.
//! [`MemoryStore::revoke_lease`] drops every key bound to a handle's lease,
//! which is what a crashed participant looks like to everyone else.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use super::{Capabilities, KvEvent, KvEventKind, KvLock, KvPair, KvStore};
use crate::error::AllocatorError;
use crate::Result;

struct Entry {
    value: Vec<u8>,
    mod_revision: u64,
    lease: Option<u64>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<KvEvent>,
}

#[derive(Default)]
struct HubState {
    entries: BTreeMap<String, Entry>,
    revision: u64,
    watchers: Vec<Watcher>,
}

#[derive(Default)]
struct Hub {
    state: Mutex<HubState>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    next_lease: Mutex<u64>,
}

impl Hub {
    fn broadcast(state: &mut HubState, kind: KvEventKind, key: &str, value: &[u8]) {
        state.watchers.retain(|w| {
            if !key.starts_with(&w.prefix) {
                return true;
            }
            w.tx
                .send(KvEvent {
                    kind,
                    key: key.to_string(),
                    value: value.to_vec(),
                })
                .is_ok()
        });
    }
}

pub struct MemoryStore {
    hub: Arc<Hub>,
    lease_id: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        let hub = Arc::new(Hub::default());
        *hub.next_lease.lock() = 1;
        MemoryStore { hub, lease_id: 1 }
    }

    /// Another handle over the same hub with its own lease.
    pub fn session(&self) -> MemoryStore {
        let mut next = self.hub.next_lease.lock();
        *next += 1;
        MemoryStore {
            hub: self.hub.clone(),
            lease_id: *next,
        }
    }

    pub fn lease_id(&self) -> u64 {
        self.lease_id
    }

    /// Delete every key bound to this handle's lease, as the hub would after
    /// the lease TTL expired without renewal.
    pub fn revoke_lease(&self) {
        let mut state = self.hub.state.lock();
        let doomed: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.lease == Some(self.lease_id))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            if let Some(entry) = state.entries.remove(&key) {
                Hub::broadcast(&mut state, KvEventKind::Delete, &key, &entry.value);
            }
        }
    }

    fn put(&self, state: &mut HubState, key: &str, value: &[u8], lease: bool) {
        state.revision += 1;
        let kind = if state.entries.contains_key(key) {
            KvEventKind::Modify
        } else {
            KvEventKind::Create
        };
        let entry = Entry {
            value: value.to_vec(),
            mod_revision: state.revision,
            lease: lease.then_some(self.lease_id),
        };
        state.entries.insert(key.to_string(), entry);
        Hub::broadcast(state, kind, key, value);
    }

    fn list_under(state: &HubState, prefix: &str) -> BTreeMap<String, KvPair> {
        let mut out = BTreeMap::new();
        for (key, entry) in state.entries.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            out.insert(
                key.clone(),
                KvPair {
                    value: entry.value.clone(),
                    mod_revision: entry.mod_revision,
                },
            );
        }
        out
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

struct MemoryLock {
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl KvLock for MemoryLock {
    async fn unlock(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    fn ownership_key(&self) -> Option<Vec<u8>> {
        None
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let state = self.hub.state.lock();
        Ok(state.entries.get(key).map(|e| e.value.clone()))
    }

    async fn create_only(&self, key: &str, value: &[u8], lease: bool) -> Result<bool> {
        let mut state = self.hub.state.lock();
        if state.entries.contains_key(key) {
            return Ok(false);
        }
        self.put(&mut state, key, value, lease);
        Ok(true)
    }

    async fn create_only_if_locked(
        &self,
        key: &str,
        value: &[u8],
        lease: bool,
        _lock: &dyn KvLock,
    ) -> Result<bool> {
        self.create_only(key, value, lease).await
    }

    async fn update_if_different(&self, key: &str, value: &[u8], lease: bool) -> Result<bool> {
        let mut state = self.hub.state.lock();
        if let Some(entry) = state.entries.get(key) {
            let lease_matches = !lease || entry.lease == Some(self.lease_id);
            if entry.value == value && lease_matches {
                return Ok(false);
            }
        }
        self.put(&mut state, key, value, lease);
        Ok(true)
    }

    async fn update_if_different_if_locked(
        &self,
        key: &str,
        value: &[u8],
        lease: bool,
        _lock: &dyn KvLock,
    ) -> Result<bool> {
        self.update_if_different(key, value, lease).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.hub.state.lock();
        if let Some(entry) = state.entries.remove(key) {
            Hub::broadcast(&mut state, KvEventKind::Delete, key, &entry.value);
        }
        Ok(())
    }

    async fn delete_if_locked(&self, key: &str, _lock: &dyn KvLock) -> Result<()> {
        self.delete(key).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let mut state = self.hub.state.lock();
        let doomed: Vec<String> = state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            if let Some(entry) = state.entries.remove(&key) {
                Hub::broadcast(&mut state, KvEventKind::Delete, &key, &entry.value);
            }
        }
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<BTreeMap<String, KvPair>> {
        let state = self.hub.state.lock();
        Ok(Self::list_under(&state, prefix))
    }

    async fn list_prefix_if_locked(
        &self,
        prefix: &str,
        _lock: &dyn KvLock,
    ) -> Result<BTreeMap<String, KvPair>> {
        self.list_prefix(prefix).await
    }

    async fn watch(
        &self,
        prefix: &str,
        _shutdown: CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<KvEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        // Snapshot and registration happen under one lock so no event can
        // fall between them or arrive twice.
        let mut state = self.hub.state.lock();
        for (key, pair) in Self::list_under(&state, prefix) {
            let _ = tx.send(KvEvent {
                kind: KvEventKind::Create,
                key,
                value: pair.value,
            });
        }
        let _ = tx.send(KvEvent::list_done());
        state.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn lock_path(&self, token: &CancellationToken, path: &str) -> Result<Box<dyn KvLock>> {
        let mutex = {
            let mut locks = self.hub.locks.lock();
            locks.entry(path.to_string()).or_default().clone()
        };
        let guard = tokio::select! {
            biased;
            _ = token.cancelled() => {
                return Err(
                    AllocatorError::Cancelled(format!("acquiring lock at {path}")).into(),
                );
            }
            guard = mutex.lock_owned() => guard,
        };
        Ok(Box::new(MemoryLock { _guard: guard }))
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::CREATE_IF_EXISTS
    }
}

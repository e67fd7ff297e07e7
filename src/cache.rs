// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bidirectional key/identifier cache fed by a store watch stream.
//!
//! The cache keeps canonical key strings; typed keys are materialized on
//! demand through the installed key prototype. A watcher task consumes the
//! fused snapshot-plus-updates stream of the master record prefix and
//! signals the initial-snapshot-done latch when the `ListDone` sentinel
//! arrives. Event replay is harmless: re-observing the current `(key, id)`
//! pair does not change the maps.
//!
//! The allocator hands the watcher a [`CacheBacking`] at spawn time. The
//! main cache's backing feeds the identifier pool and the user event
//! channel; remote caches get a backing that does neither, which is what
//! makes them read-only views.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::allocator::EventKind;
use crate::key::{AllocatorKey, Id};
use crate::store::{KvEvent, KvEventKind, KvStore};

/// Callbacks the watcher invokes as master records come and go.
#[async_trait]
pub(crate) trait CacheBacking: Send + Sync {
    fn key_prototype(&self) -> &dyn AllocatorKey;

    /// An identifier appeared under the watched prefix.
    fn mark_id_taken(&self, id: Id);

    /// An identifier disappeared from the watched prefix.
    fn mark_id_free(&self, id: Id);

    /// Key string still locally referencing `id`, if its master record must
    /// be restored rather than forgotten.
    fn protected_key(&self, id: Id) -> Option<String>;

    async fn restore_master_key(&self, id: Id, raw: &str);

    async fn emit(&self, kind: EventKind, id: Id, key: Arc<dyn AllocatorKey>);
}

#[derive(Default)]
struct CacheMaps {
    by_key: HashMap<String, Id>,
    by_id: HashMap<Id, String>,
}

pub(crate) struct Cache {
    id_prefix: String,
    maps: Arc<RwLock<CacheMaps>>,
    initial_done: CancellationToken,
    shutdown: CancellationToken,
    /// Master records whose value the key type rejects are removed from the
    /// store. Only ever set on the main cache; remote caches must not write.
    delete_invalid: bool,
}

impl Cache {
    pub fn new(id_prefix: String, shutdown: CancellationToken, delete_invalid: bool) -> Self {
        Cache {
            id_prefix,
            maps: Arc::new(RwLock::new(CacheMaps::default())),
            initial_done: CancellationToken::new(),
            shutdown,
            delete_invalid,
        }
    }

    /// Subscribe to the master record prefix and spawn the watcher task.
    pub async fn start(
        &self,
        store: Arc<dyn KvStore>,
        backing: Arc<dyn CacheBacking>,
    ) -> crate::Result<()> {
        let events = store.watch(&self.id_prefix, self.shutdown.clone()).await?;
        let watcher = Watcher {
            maps: self.maps.clone(),
            initial_done: self.initial_done.clone(),
            shutdown: self.shutdown.clone(),
            delete_invalid: self.delete_invalid,
            store,
            backing,
        };
        tokio::spawn(watcher.run(events));
        Ok(())
    }

    /// Latch that fires once the initial snapshot has been observed.
    pub fn initial_done(&self) -> CancellationToken {
        self.initial_done.clone()
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn get(&self, raw: &str) -> Id {
        self.maps
            .read()
            .by_key
            .get(raw)
            .copied()
            .unwrap_or(Id::NONE)
    }

    pub fn get_by_id(&self, id: Id) -> Option<String> {
        self.maps.read().by_id.get(&id).cloned()
    }

    /// Record a locally authored claim without waiting for the watch stream
    /// to echo it.
    pub fn insert(&self, raw: &str, id: Id) {
        let mut maps = self.maps.write();
        if let Some(old) = maps.by_id.insert(id, raw.to_string()) {
            if old != raw {
                maps.by_key.remove(&old);
            }
        }
        maps.by_key.insert(raw.to_string(), id);
    }

    pub fn foreach(&self, cb: &mut dyn FnMut(Id, &str)) {
        let maps = self.maps.read();
        for (id, raw) in &maps.by_id {
            cb(*id, raw);
        }
    }
}

struct Watcher {
    maps: Arc<RwLock<CacheMaps>>,
    initial_done: CancellationToken,
    shutdown: CancellationToken,
    delete_invalid: bool,
    store: Arc<dyn KvStore>,
    backing: Arc<dyn CacheBacking>,
}

impl Watcher {
    async fn run(self, mut events: mpsc::UnboundedReceiver<KvEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event.kind {
                KvEventKind::ListDone => self.initial_done.cancel(),
                KvEventKind::Create | KvEventKind::Modify => self.upsert(event).await,
                KvEventKind::Delete => self.remove(event).await,
            }
        }
        debug!("cache watcher stopped");
    }

    async fn upsert(&self, event: KvEvent) {
        let Some(id) = id_from_master_key(&event.key) else {
            warn!(key = %event.key, "ignoring master record with malformed identifier");
            return;
        };
        let key = match std::str::from_utf8(&event.value)
            .map_err(|err| err.to_string())
            .and_then(|raw| {
                self.backing
                    .key_prototype()
                    .put_key(raw)
                    .map_err(|err| err.to_string())
            }) {
            Ok(key) => key,
            Err(reason) => {
                warn!(key = %event.key, reason = %reason, "master record value cannot be parsed");
                if self.delete_invalid {
                    if let Err(err) = self.store.delete(&event.key).await {
                        warn!(key = %event.key, error = %err, "unable to delete invalid master record");
                    }
                }
                return;
            }
        };

        let raw = key.get_key();
        {
            let mut maps = self.maps.write();
            if let Some(old) = maps.by_id.insert(id, raw.clone()) {
                if old != raw {
                    maps.by_key.remove(&old);
                }
            }
            maps.by_key.insert(raw, id);
        }
        self.backing.mark_id_taken(id);

        let kind = match event.kind {
            KvEventKind::Modify => EventKind::Modify,
            _ => EventKind::Create,
        };
        self.backing.emit(kind, id, Arc::from(key)).await;
    }

    async fn remove(&self, event: KvEvent) {
        let Some(id) = id_from_master_key(&event.key) else {
            return;
        };

        if let Some(raw) = self.backing.protected_key(id) {
            self.backing.restore_master_key(id, &raw).await;
            return;
        }

        let removed = {
            let mut maps = self.maps.write();
            match maps.by_id.remove(&id) {
                Some(raw) => {
                    maps.by_key.remove(&raw);
                    Some(raw)
                }
                None => None,
            }
        };
        self.backing.mark_id_free(id);

        if let Some(raw) = removed {
            match self.backing.key_prototype().put_key(&raw) {
                Ok(key) => self.backing.emit(EventKind::Delete, id, Arc::from(key)).await,
                Err(err) => debug!(id = %id, error = %err, "dropping delete event for undecodable key"),
            }
        }
    }
}

fn id_from_master_key(key: &str) -> Option<Id> {
    let last = key.rsplit('/').next()?;
    let id = last.parse::<u64>().ok()?;
    if id == 0 {
        return None;
    }
    Some(Id(id))
}

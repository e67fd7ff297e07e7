// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Distributed identifier allocator.
//!
//! Maps application keys to numeric identifiers through a shared key-value
//! store. Any number of participants on different machines can request the
//! identifier for a key in parallel and are guaranteed to converge on the
//! same one.
//!
//! Slave records are owned by individual participants:
//!
//! ```text
//! base/value/key1/node-a => 1001
//! base/value/key1/node-b => 1001
//! base/value/key2/node-a => 1002
//! ```
//!
//! As long as at least one record exists under `base/value/keyN`, the key is
//! in use. Slave records are bound to the participant's session lease and
//! disappear when the participant dies.
//!
//! Master records map identifiers back to keys:
//!
//! ```text
//! base/id/1001 => key1
//! base/id/1002 => key2
//! ```
//!
//! A master record keeps its identifier out of the pool. Once no slave
//! record backs it anymore, the garbage collector eventually deletes it and
//! the identifier becomes allocatable again.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backoff::Exponential;
use crate::cache::{Cache, CacheBacking};
use crate::error::{self, AllocatorError};
use crate::gc::GarbageCollector;
use crate::id_pool::IdPool;
use crate::key::{AllocatorKey, Id};
use crate::local_keys::LocalKeys;
use crate::store::{KvLock, KvStore};
use crate::{ErrorContext, Result};

/// Allocation attempts before giving up.
const MAX_ALLOC_ATTEMPTS: usize = 16;

/// Bound on waiting for the initial master record listing.
const LIST_TIMEOUT: Duration = Duration::from_secs(180);

const BACKOFF_MIN: Duration = Duration::from_millis(20);
const BACKOFF_MAX: Duration = Duration::from_secs(5);
const BACKOFF_FACTOR: f64 = 2.0;

/// Default interval between master record re-assertion rounds.
const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Kinds of changes surfaced on the event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Create,
    Modify,
    Delete,
}

/// A change to the set of known identifiers, delivered in watch order.
#[derive(Clone)]
pub struct AllocatorEvent {
    pub kind: EventKind,
    pub id: Id,
    pub key: Arc<dyn AllocatorKey>,
}

impl fmt::Debug for AllocatorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatorEvent")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("key", &self.key.get_key())
            .finish()
    }
}

/// Distributed identifier allocator over one base path of the store.
///
/// Construct with [`Allocator::builder`]. When an event channel is
/// installed, the receiver must be drained while the allocator is being
/// built, or the initial cache population blocks on the full channel.
pub struct Allocator {
    inner: Arc<Inner>,
}

impl fmt::Debug for Allocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator").finish_non_exhaustive()
    }
}

struct Inner {
    store: Arc<dyn KvStore>,
    key_type: Box<dyn AllocatorKey>,
    base_prefix: String,
    id_prefix: String,
    value_prefix: String,
    lock_prefix: String,
    prefix_mask: Id,
    /// Per-process token appended to slave record paths.
    suffix: String,
    local_keys: LocalKeys,
    id_pool: IdPool,
    /// Serializes local writers of slave records for the same key. Taken
    /// after the distributed lock, never before.
    slave_keys_mutex: AsyncMutex<()>,
    events: Mutex<Option<mpsc::Sender<AllocatorEvent>>>,
    main_cache: Cache,
    remote_caches: RwLock<Vec<Arc<Cache>>>,
    enable_master_key_protection: bool,
    shutdown: CancellationToken,
}

/// Configures and starts an [`Allocator`].
pub struct AllocatorBuilder {
    store: Arc<dyn KvStore>,
    base_path: String,
    key_type: Box<dyn AllocatorKey>,
    min: Id,
    max: Id,
    prefix_mask: Id,
    suffix: Option<String>,
    events: Option<mpsc::Sender<AllocatorEvent>>,
    master_key_protection: bool,
    disable_gc: bool,
    sync_interval: Duration,
}

impl AllocatorBuilder {
    /// Install a channel receiving create/modify/delete events.
    pub fn with_events(mut self, events: mpsc::Sender<AllocatorEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Override the per-process suffix attached to slave records.
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = Some(suffix.into());
        self
    }

    /// Lowest identifier ever allocated.
    pub fn with_min(mut self, min: Id) -> Self {
        self.min = min;
        self
    }

    /// Highest identifier ever allocated.
    pub fn with_max(mut self, max: Id) -> Self {
        self.max = max;
        self
    }

    /// Bits ORed into every freshly selected identifier. Must not overlap
    /// the bits used by `[min, max]`.
    pub fn with_prefix_mask(mut self, mask: Id) -> Self {
        self.prefix_mask = mask;
        self
    }

    /// Re-create master records that are deleted while still referenced
    /// locally.
    pub fn with_master_key_protection(mut self) -> Self {
        self.master_key_protection = true;
        self
    }

    /// Do not start the background master record sync task.
    pub fn without_gc(mut self) -> Self {
        self.disable_gc = true;
        self
    }

    /// Interval between master record re-assertion rounds.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Validate the configuration, start the cache watcher and background
    /// tasks, and return the allocator.
    pub async fn build(self) -> Result<Allocator> {
        if self.min < Id(1) {
            return Err(AllocatorError::Config("minimum ID must be 1 or greater".into()).into());
        }
        if self.max <= self.min {
            return Err(AllocatorError::Config(
                "maximum ID must be greater than minimum ID".into(),
            )
            .into());
        }
        let mask = self.prefix_mask.as_u64();
        if mask != 0 && mask & (u64::MAX >> self.max.as_u64().leading_zeros()) != 0 {
            return Err(AllocatorError::Config(
                "prefix mask overlaps the configured identifier range".into(),
            )
            .into());
        }
        let suffix = match self.suffix {
            Some(suffix) if suffix.is_empty() => {
                return Err(
                    AllocatorError::Config("allocator suffix must not be empty".into()).into(),
                );
            }
            Some(suffix) => suffix,
            None => {
                let mut suffix = Uuid::new_v4().to_string();
                suffix.truncate(10);
                suffix
            }
        };

        let shutdown = CancellationToken::new();
        let base_path = self.base_path;
        let id_prefix = format!("{base_path}/id");
        let inner = Arc::new(Inner {
            store: self.store,
            key_type: self.key_type,
            main_cache: Cache::new(id_prefix.clone(), shutdown.child_token(), true),
            id_prefix,
            value_prefix: format!("{base_path}/value"),
            lock_prefix: format!("{base_path}/locks"),
            base_prefix: base_path,
            prefix_mask: self.prefix_mask,
            suffix,
            local_keys: LocalKeys::new(),
            id_pool: IdPool::new(self.min, self.max),
            slave_keys_mutex: AsyncMutex::new(()),
            events: Mutex::new(self.events),
            remote_caches: RwLock::new(Vec::new()),
            enable_master_key_protection: self.master_key_protection,
            shutdown,
        });

        if !inner.store.capabilities().supports_lockless() {
            debug!("store does not support lockless allocation, using locked paths");
        }

        inner
            .main_cache
            .start(
                inner.store.clone(),
                Arc::new(MainCacheBacking {
                    inner: inner.clone(),
                }),
            )
            .await?;

        if !self.disable_gc {
            tokio::spawn(local_key_sync(inner.clone(), self.sync_interval));
        }

        Ok(Allocator { inner })
    }
}

impl Allocator {
    /// Start configuring an allocator over `base_path`. `key_type` is a
    /// prototype of the application key type; it decodes every canonical
    /// string the store hands back.
    pub fn builder(
        store: Arc<dyn KvStore>,
        base_path: impl Into<String>,
        key_type: Box<dyn AllocatorKey>,
    ) -> AllocatorBuilder {
        AllocatorBuilder {
            store,
            base_path: base_path.into(),
            key_type,
            min: Id(1),
            max: Id(u64::MAX),
            prefix_mask: Id::NONE,
            suffix: None,
            events: None,
            master_key_protection: false,
            disable_gc: false,
            sync_interval: DEFAULT_SYNC_INTERVAL,
        }
    }

    /// Wait until the initial master record listing has been observed.
    pub async fn wait_for_initial_sync(&self, token: &CancellationToken) -> Result<()> {
        let done = self.inner.main_cache.initial_done();
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(AllocatorError::Cancelled(
                "waiting for the initial master record listing".into(),
            )
            .into()),
            _ = done.cancelled() => Ok(()),
        }
    }

    /// Retrieve the identifier for `key`, allocating one if needed. Returns
    /// the identifier and whether it was newly allocated. Contended attempts
    /// are retried with exponential backoff.
    pub async fn allocate(
        &self,
        token: &CancellationToken,
        key: &dyn AllocatorKey,
    ) -> Result<(Id, bool)> {
        self.wait_for_initial_sync(token).await?;

        let raw = key.get_key();
        debug!(key = %key, "allocating identifier");

        // Fast path: the key is already referenced by this process; bump the
        // count without touching the store.
        if let Some(id) = self.inner.local_keys.use_key(&raw) {
            self.inner.main_cache.insert(&raw, id);
            return Ok((id, false));
        }

        let mut backoff = Exponential::new(BACKOFF_MIN, BACKOFF_MAX, BACKOFF_FACTOR);
        let mut last_err = None;
        for attempt in 0..MAX_ALLOC_ATTEMPTS {
            match self.inner.locked_allocate(token, key, &raw).await {
                Ok((id, is_new)) => {
                    self.inner.main_cache.insert(&raw, id);
                    debug!(key = %key, id = %id, "allocated identifier");
                    return Ok((id, is_new));
                }
                Err(err) => {
                    if token.is_cancelled() {
                        warn!(key = %key, "identifier allocation cancelled");
                        return Err(AllocatorError::Cancelled(format!(
                            "allocating identifier for {key}"
                        ))
                        .into());
                    }
                    if !error::is_retryable(&err) {
                        return Err(err);
                    }
                    warn!(key = %key, attempt, error = %err, "identifier allocation attempt failed");
                    last_err = Some(err);
                }
            }
            backoff.wait(token).await?;
        }

        Err(last_err.unwrap_or_else(|| {
            AllocatorError::Contention("allocation attempts exhausted".into()).into()
        }))
    }

    /// Identifier allocated to `key`, or `Id::NONE`.
    pub async fn get(&self, key: &dyn AllocatorKey) -> Result<Id> {
        let id = self.inner.main_cache.get(&key.get_key());
        if !id.is_none() {
            return Ok(id);
        }
        self.get_no_cache(key).await
    }

    /// Identifier allocated to `key` according to the store, bypassing the
    /// cache.
    pub async fn get_no_cache(&self, key: &dyn AllocatorKey) -> Result<Id> {
        self.inner.lookup_slave(&key.get_key(), None).await
    }

    /// Key associated with `id`, or `None`.
    pub async fn get_by_id(&self, id: Id) -> Result<Option<Box<dyn AllocatorKey>>> {
        if let Some(raw) = self.inner.main_cache.get_by_id(id) {
            return self.inner.key_type.put_key(&raw).map(Some);
        }
        let master = self.inner.master_path(id);
        match self.inner.store.get(&master).await? {
            None => Ok(None),
            Some(value) => {
                let raw = String::from_utf8(value).map_err(|_| AllocatorError::Corruption {
                    key: master,
                    reason: "master record value is not valid UTF-8".into(),
                })?;
                self.inner.key_type.put_key(&raw).map(Some)
            }
        }
    }

    /// Drop one local reference to `key`. When the last reference of this
    /// process goes, the slave record is deleted; the return value reports
    /// whether that removed the last reference cluster-wide. Master records
    /// are left for the garbage collector.
    pub async fn release(&self, token: &CancellationToken, key: &dyn AllocatorKey) -> Result<bool> {
        self.wait_for_initial_sync(token).await?;

        let raw = key.get_key();
        info!(key = %key, "releasing identifier reference");

        let inner = &self.inner;
        let _guard = inner.slave_keys_mutex.lock().await;

        let last_local_use = inner.local_keys.release(&raw)?;
        if !last_local_use {
            return Ok(false);
        }

        // The slave path is private to this process and the mutex serializes
        // local callers, so no distributed lock is needed here.
        let slave = inner.slave_path(&raw);
        info!(key = %key, "released last local reference, removing slave record");
        if let Err(err) = inner.store.delete(&slave).await {
            warn!(key = %key, error = %err, "unable to delete slave record");
        }

        match inner.lookup_slave(&raw, None).await {
            Ok(remaining) => Ok(remaining.is_none()),
            Err(err) => {
                warn!(key = %key, error = %err, "unable to check for remaining references");
                Ok(false)
            }
        }
    }

    /// Visit every cached `(identifier, key)` pair, including the contents
    /// of watched remote stores.
    pub fn foreach_cache(&self, cb: &mut dyn FnMut(Id, &dyn AllocatorKey)) {
        self.inner.foreach_decoded(&self.inner.main_cache, cb);
        let remotes = self.inner.remote_caches.read();
        for cache in remotes.iter() {
            self.inner.foreach_decoded(cache, cb);
        }
    }

    /// One garbage collection round over the master records of this
    /// allocator's base path. Feed the returned map into the next round.
    pub async fn run_gc(
        &self,
        stale_prev: &HashMap<String, u64>,
    ) -> Result<HashMap<String, u64>> {
        GarbageCollector::new(self.inner.store.clone(), &self.inner.base_prefix)
            .run(stale_prev)
            .await
    }

    /// Mirror the master records of another store below `prefix` into an
    /// additional read-only cache, included in [`Allocator::foreach_cache`].
    pub async fn watch_remote_kv_store(
        &self,
        backend: Arc<dyn KvStore>,
        prefix: &str,
    ) -> Result<RemoteCache> {
        let cache = Arc::new(Cache::new(
            format!("{prefix}/id"),
            self.inner.shutdown.child_token(),
            false,
        ));
        cache
            .start(
                backend,
                Arc::new(RemoteCacheBacking {
                    inner: self.inner.clone(),
                }),
            )
            .await?;
        self.inner.remote_caches.write().push(cache.clone());
        Ok(RemoteCache {
            cache,
            owner: self.inner.clone(),
        })
    }

    /// Remove everything below the allocator's base path.
    pub async fn delete_all_keys(&self) -> Result<()> {
        self.inner.store.delete_prefix(&self.inner.base_prefix).await
    }

    /// Stop the watcher and background tasks and close the event channel.
    /// Outstanding calls return through their cancellation tokens.
    pub fn delete(&self) {
        self.inner.shutdown.cancel();
        self.inner.main_cache.stop();
        self.inner.events.lock().take();
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    fn master_path(&self, id: Id) -> String {
        format!("{}/{}", self.id_prefix, id)
    }

    fn slave_path(&self, raw: &str) -> String {
        format!("{}/{}/{}", self.value_prefix, raw, self.suffix)
    }

    fn lock_name(&self, key: &str) -> String {
        let suffix = key
            .strip_prefix(&self.base_prefix)
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(key);
        format!("{}/{}", self.lock_prefix, suffix)
    }

    async fn emit(&self, kind: EventKind, id: Id, key: Arc<dyn AllocatorKey>) {
        let events = self.events.lock().clone();
        if let Some(events) = events {
            if events.send(AllocatorEvent { kind, id, key }).await.is_err() {
                debug!("allocator event receiver dropped");
            }
        }
    }

    /// First slave record matching `raw` exactly. Prefixes alias longer
    /// keys (`label;foo;` also prefixes `label;foo;bar;/node`), so only
    /// entries with exactly one extra path segment count.
    async fn lookup_slave(&self, raw: &str, lock: Option<&dyn KvLock>) -> Result<Id> {
        let prefix = format!("{}/{}", self.value_prefix, raw);
        let pairs = match lock {
            Some(lock) => self.store.list_prefix_if_locked(&prefix, lock).await?,
            None => self.store.list_prefix(&prefix).await?,
        };
        for (key, pair) in &pairs {
            if !prefix_matches_key(&prefix, key) {
                continue;
            }
            let Ok(text) = std::str::from_utf8(&pair.value) else {
                continue;
            };
            if let Ok(id) = text.parse::<u64>() {
                return Ok(Id(id));
            }
        }
        Ok(Id::NONE)
    }

    async fn get_if_locked(&self, raw: &str, lock: &dyn KvLock) -> Result<Id> {
        let id = self.main_cache.get(raw);
        if !id.is_none() {
            return Ok(id);
        }
        self.lookup_slave(raw, Some(lock)).await
    }

    async fn locked_allocate(
        &self,
        token: &CancellationToken,
        key: &dyn AllocatorKey,
        raw: &str,
    ) -> Result<(Id, bool)> {
        let lock = self.store.lock_path(token, &self.lock_name(raw)).await?;
        let result = self.locked_allocate_inner(key, raw, lock.as_ref()).await;
        if let Err(err) = lock.unlock().await {
            warn!(key = raw, error = %err, "unable to release distributed lock");
        }
        result
    }

    async fn locked_allocate_inner(
        &self,
        key: &dyn AllocatorKey,
        raw: &str,
        lock: &dyn KvLock,
    ) -> Result<(Id, bool)> {
        let mut value = self.get_if_locked(raw, lock).await?;

        let _guard = self.slave_keys_mutex.lock().await;

        if value.is_none() {
            // The store may have lost its contents while this process still
            // holds the identifier; the local table is authoritative then
            // and the master record is restored from it.
            let local = self.local_keys.lookup_key(raw);
            if !local.is_none() {
                let master = self.master_path(local);
                let created = self
                    .store
                    .create_only_if_locked(&master, raw.as_bytes(), false, lock)
                    .await
                    .with_context(|| format!("unable to re-create master record {master}"))?;
                if !created {
                    return Err(AllocatorError::Contention(format!(
                        "master record {master} re-appeared under another writer"
                    ))
                    .into());
                }
                value = local;
            }
        }

        if !value.is_none() {
            self.local_keys.allocate(raw, value);
            if let Err(err) = self.create_slave_key(raw, value, lock).await {
                if let Err(release_err) = self.local_keys.release(raw) {
                    error!(key = raw, error = %release_err, "BUG: unable to roll back local reference");
                }
                return Err(err);
            }
            info!(key = %key, id = %value, "reusing existing global identifier");
            return Ok((value, false));
        }

        let Some(unmasked) = self.id_pool.lease_available_id() else {
            return Err(AllocatorError::PoolExhausted.into());
        };
        let id = Id(unmasked.as_u64() | self.prefix_mask.as_u64());

        let effective = self.local_keys.allocate(raw, id);
        if effective != id {
            // Another local writer allocated this key since the fast path
            // ran; back out and let the retry loop pick up the winner.
            self.rollback_new_allocation(raw, unmasked);
            return Err(AllocatorError::Contention(format!(
                "another local writer allocated key {raw}"
            ))
            .into());
        }

        let master = self.master_path(id);
        let created = match self
            .store
            .create_only_if_locked(&master, raw.as_bytes(), false, lock)
            .await
        {
            Ok(created) => created,
            Err(err) => {
                self.rollback_new_allocation(raw, unmasked);
                return Err(err.context(format!("unable to create master record {master}")));
            }
        };
        if !created {
            // Another participant claimed this identifier since the listing.
            self.rollback_new_allocation(raw, unmasked);
            return Err(AllocatorError::Contention(format!(
                "identifier {id} was claimed by another participant"
            ))
            .into());
        }

        self.id_pool.use_id(unmasked);

        if let Err(err) = self.create_slave_key(raw, id, lock).await {
            // The master record is already visible to other participants and
            // may be in use; leave it for the garbage collector.
            self.rollback_new_allocation(raw, unmasked);
            return Err(err.context(format!("slave record creation failed for {raw}")));
        }

        info!(key = %key, id = %id, "allocated new global identifier");
        Ok((id, true))
    }

    fn rollback_new_allocation(&self, raw: &str, unmasked: Id) {
        if let Err(err) = self.local_keys.release(raw) {
            debug!(key = raw, error = %err, "no local reference to roll back");
        }
        self.id_pool.release(unmasked);
    }

    /// Write the slave record accounting for this process' use of `raw` and
    /// mark the local entry verified. The record is bound to the session
    /// lease; in the steady state the write is a no-op.
    async fn create_slave_key(&self, raw: &str, id: Id, lock: &dyn KvLock) -> Result<()> {
        let slave = self.slave_path(raw);
        self.store
            .update_if_different_if_locked(&slave, id.to_string().as_bytes(), true, lock)
            .await
            .with_context(|| format!("unable to create slave record {slave}"))?;
        if let Err(err) = self.local_keys.verify(raw) {
            error!(error = %err, "BUG: unable to mark local key as verified");
        }
        Ok(())
    }

    /// Re-create the master and slave records of a locally held identifier.
    /// `reliably_missing` selects create-only writes over update-if-different.
    async fn recreate_master_key(&self, id: Id, raw: &str, reliably_missing: bool) {
        let master = self.master_path(id);
        let result = if reliably_missing {
            self.store.create_only(&master, raw.as_bytes(), false).await
        } else {
            self.store
                .update_if_different(&master, raw.as_bytes(), false)
                .await
        };
        match result {
            Err(err) => warn!(key = %master, error = %err, "unable to re-create missing master record"),
            Ok(true) => warn!(key = %master, "re-created missing master record"),
            Ok(false) => {}
        }

        // Re-assert the slave record too so the next garbage collection
        // round of any participant does not take the master away again.
        let slave = self.slave_path(raw);
        let value = id.to_string();
        let result = if reliably_missing {
            self.store.create_only(&slave, value.as_bytes(), true).await
        } else {
            self.store
                .update_if_different(&slave, value.as_bytes(), true)
                .await
        };
        match result {
            Err(err) => warn!(key = %slave, error = %err, "unable to re-create missing slave record"),
            Ok(true) => warn!(key = %slave, "re-created missing slave record"),
            Ok(false) => {}
        }
    }

    /// Re-assert the master and slave records of every verified local entry.
    /// The snapshot is taken without holding table locks across store calls;
    /// worst case a record is restored for a reference released mid-sync and
    /// the garbage collector removes it again.
    async fn sync_local_keys(&self) {
        for (id, raw) in self.local_keys.verified_ids() {
            self.recreate_master_key(id, &raw, false).await;
        }
    }

    fn foreach_decoded(&self, cache: &Cache, cb: &mut dyn FnMut(Id, &dyn AllocatorKey)) {
        cache.foreach(&mut |id, raw| match self.key_type.put_key(raw) {
            Ok(key) => cb(id, key.as_ref()),
            Err(err) => debug!(id = %id, error = %err, "skipping undecodable cache entry"),
        });
    }
}

async fn local_key_sync(inner: Arc<Inner>, interval: Duration) {
    let initial_done = inner.main_cache.initial_done();
    tokio::select! {
        _ = initial_done.cancelled() => {}
        _ = inner.shutdown.cancelled() => return,
        _ = tokio::time::sleep(LIST_TIMEOUT) => {
            error!("timed out waiting for the initial master record listing, master record sync disabled");
            return;
        }
    }

    loop {
        inner.sync_local_keys().await;
        tokio::select! {
            _ = inner.shutdown.cancelled() => {
                debug!(prefix = %inner.id_prefix, "stopped master record sync task");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Backing of the main cache: feeds the identifier pool, the event channel,
/// and master key protection.
struct MainCacheBacking {
    inner: Arc<Inner>,
}

#[async_trait]
impl CacheBacking for MainCacheBacking {
    fn key_prototype(&self) -> &dyn AllocatorKey {
        self.inner.key_type.as_ref()
    }

    fn mark_id_taken(&self, id: Id) {
        self.inner.id_pool.remove(id);
    }

    fn mark_id_free(&self, id: Id) {
        self.inner.id_pool.insert(id);
    }

    fn protected_key(&self, id: Id) -> Option<String> {
        if !self.inner.enable_master_key_protection {
            return None;
        }
        self.inner.local_keys.lookup_id(id)
    }

    async fn restore_master_key(&self, id: Id, raw: &str) {
        self.inner.recreate_master_key(id, raw, true).await;
    }

    async fn emit(&self, kind: EventKind, id: Id, key: Arc<dyn AllocatorKey>) {
        self.inner.emit(kind, id, key).await;
    }
}

/// Backing of remote caches: read-only, no pool or event interaction.
struct RemoteCacheBacking {
    inner: Arc<Inner>,
}

#[async_trait]
impl CacheBacking for RemoteCacheBacking {
    fn key_prototype(&self) -> &dyn AllocatorKey {
        self.inner.key_type.as_ref()
    }

    fn mark_id_taken(&self, _id: Id) {}

    fn mark_id_free(&self, _id: Id) {}

    fn protected_key(&self, _id: Id) -> Option<String> {
        None
    }

    async fn restore_master_key(&self, _id: Id, _raw: &str) {}

    async fn emit(&self, _kind: EventKind, _id: Id, _key: Arc<dyn AllocatorKey>) {}
}

/// Handle on a watched remote store. Closing stops the watcher and removes
/// its contents from enumeration.
pub struct RemoteCache {
    cache: Arc<Cache>,
    owner: Arc<Inner>,
}

impl RemoteCache {
    pub fn close(&self) {
        self.owner
            .remote_caches
            .write()
            .retain(|cache| !Arc::ptr_eq(cache, &self.cache));
        self.cache.stop();
    }
}

/// Whether a listed key belongs to exactly the listed prefix rather than a
/// longer key sharing it: the final `/` must sit right after the prefix.
pub(crate) fn prefix_matches_key(prefix: &str, key: &str) -> bool {
    key.rfind('/').map_or(false, |idx| idx == prefix.len())
}

// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! etcd-backed implementation of the store contract.
//!
//! A session lease is granted at connect time and kept alive by a background
//! task; keys written with `lease = true` are attached to it so they expire
//! when this process dies. Conditional writes are etcd transactions, locks
//! use the etcd lock API, and watches fuse a snapshot `get` with a prefix
//! watch starting at the snapshot's revision.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, DeleteOptions, EventType, GetOptions, LockOptions,
    PutOptions, Txn, TxnOp, WatchOptions,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{Capabilities, KvEvent, KvEventKind, KvLock, KvPair, KvStore};
use crate::config::Settings;
use crate::error::AllocatorError;
use crate::{ErrorContext, Result};

pub struct EtcdStore {
    client: Client,
    lease_id: i64,
}

impl EtcdStore {
    /// Connect to the endpoints in `settings`, grant the session lease and
    /// start renewing it until `shutdown` fires.
    pub async fn connect(settings: &Settings, shutdown: CancellationToken) -> Result<EtcdStore> {
        let options = ConnectOptions::new().with_connect_timeout(Duration::from_secs(10));
        let client = Client::connect(settings.endpoints.clone(), Some(options))
            .await
            .with_context(|| {
                format!(
                    "unable to connect to etcd at {}",
                    settings.endpoints.join(", ")
                )
            })?;

        let ttl = settings.lease_ttl();
        let mut lease_client = client.clone();
        let lease = lease_client
            .lease_grant(ttl.as_secs() as i64, None)
            .await
            .context("unable to grant session lease")?;
        let lease_id = lease.id();
        debug!(lease_id, ttl_secs = ttl.as_secs(), "granted session lease");

        let (mut keeper, mut responses) = lease_client
            .lease_keep_alive(lease_id)
            .await
            .context("unable to start lease keepalive")?;
        let renew_every = ttl / 3;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!(lease_id, "stopping lease keepalive");
                        return;
                    }
                    _ = tokio::time::sleep(renew_every) => {}
                }
                if let Err(err) = keeper.keep_alive().await {
                    warn!(lease_id, error = %err, "lease keepalive request failed");
                    continue;
                }
                match responses.message().await {
                    Ok(Some(resp)) => trace!(lease_id, ttl = resp.ttl(), "lease renewed"),
                    Ok(None) => {
                        warn!(lease_id, "lease keepalive stream closed");
                        return;
                    }
                    Err(err) => warn!(lease_id, error = %err, "lease keepalive response failed"),
                }
            }
        });

        Ok(EtcdStore { client, lease_id })
    }

    pub fn lease_id(&self) -> i64 {
        self.lease_id
    }

    fn put_options(&self, lease: bool) -> Option<PutOptions> {
        lease.then(|| PutOptions::new().with_lease(self.lease_id))
    }

    /// Comparison asserting that `lock` is still held, when the backend
    /// materialized an ownership key for it.
    fn lock_compare(lock: &dyn KvLock) -> Option<Compare> {
        lock.ownership_key()
            .map(|key| Compare::create_revision(key, CompareOp::Greater, 0))
    }

    async fn txn_create(
        &self,
        key: &str,
        value: &[u8],
        lease: bool,
        extra: Option<Compare>,
    ) -> Result<bool> {
        let mut when = vec![Compare::create_revision(key, CompareOp::Equal, 0)];
        when.extend(extra);
        let txn = Txn::new()
            .when(when)
            .and_then(vec![TxnOp::put(key, value, self.put_options(lease))]);
        let resp = self
            .client
            .clone()
            .txn(txn)
            .await
            .with_context(|| format!("conditional create of {key} failed"))?;
        Ok(resp.succeeded())
    }
}

struct EtcdLock {
    client: Client,
    key: Vec<u8>,
}

#[async_trait]
impl KvLock for EtcdLock {
    async fn unlock(self: Box<Self>) -> Result<()> {
        self.client
            .clone()
            .unlock(self.key.clone())
            .await
            .context("unable to release etcd lock")?;
        Ok(())
    }

    fn ownership_key(&self) -> Option<Vec<u8>> {
        Some(self.key.clone())
    }
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let resp = self
            .client
            .clone()
            .get(key, None)
            .await
            .with_context(|| format!("get of {key} failed"))?;
        Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn create_only(&self, key: &str, value: &[u8], lease: bool) -> Result<bool> {
        self.txn_create(key, value, lease, None).await
    }

    async fn create_only_if_locked(
        &self,
        key: &str,
        value: &[u8],
        lease: bool,
        lock: &dyn KvLock,
    ) -> Result<bool> {
        self.txn_create(key, value, lease, Self::lock_compare(lock))
            .await
    }

    async fn update_if_different(&self, key: &str, value: &[u8], lease: bool) -> Result<bool> {
        let resp = self
            .client
            .clone()
            .get(key, None)
            .await
            .with_context(|| format!("get of {key} failed"))?;
        if let Some(kv) = resp.kvs().first() {
            let lease_matches = !lease || kv.lease() == self.lease_id;
            if kv.value() == value && lease_matches {
                return Ok(false);
            }
        }
        self.client
            .clone()
            .put(key, value, self.put_options(lease))
            .await
            .with_context(|| format!("put of {key} failed"))?;
        Ok(true)
    }

    async fn update_if_different_if_locked(
        &self,
        key: &str,
        value: &[u8],
        lease: bool,
        lock: &dyn KvLock,
    ) -> Result<bool> {
        let resp = self
            .client
            .clone()
            .get(key, None)
            .await
            .with_context(|| format!("get of {key} failed"))?;
        if let Some(kv) = resp.kvs().first() {
            let lease_matches = !lease || kv.lease() == self.lease_id;
            if kv.value() == value && lease_matches {
                return Ok(false);
            }
        }
        let Some(compare) = Self::lock_compare(lock) else {
            self.client
                .clone()
                .put(key, value, self.put_options(lease))
                .await
                .with_context(|| format!("put of {key} failed"))?;
            return Ok(true);
        };
        let txn = Txn::new()
            .when(vec![compare])
            .and_then(vec![TxnOp::put(key, value, self.put_options(lease))]);
        let resp = self
            .client
            .clone()
            .txn(txn)
            .await
            .with_context(|| format!("conditional put of {key} failed"))?;
        if !resp.succeeded() {
            return Err(AllocatorError::Store(format!(
                "lock no longer held while updating {key}"
            ))
            .into());
        }
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .clone()
            .delete(key, None)
            .await
            .with_context(|| format!("delete of {key} failed"))?;
        Ok(())
    }

    async fn delete_if_locked(&self, key: &str, lock: &dyn KvLock) -> Result<()> {
        let Some(compare) = Self::lock_compare(lock) else {
            return self.delete(key).await;
        };
        let txn = Txn::new()
            .when(vec![compare])
            .and_then(vec![TxnOp::delete(key, None)]);
        let resp = self
            .client
            .clone()
            .txn(txn)
            .await
            .with_context(|| format!("conditional delete of {key} failed"))?;
        if !resp.succeeded() {
            return Err(AllocatorError::Store(format!(
                "lock no longer held while deleting {key}"
            ))
            .into());
        }
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        self.client
            .clone()
            .delete(prefix, Some(DeleteOptions::new().with_prefix()))
            .await
            .with_context(|| format!("delete of prefix {prefix} failed"))?;
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<BTreeMap<String, KvPair>> {
        let resp = self
            .client
            .clone()
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .with_context(|| format!("list of prefix {prefix} failed"))?;
        let mut out = BTreeMap::new();
        for kv in resp.kvs() {
            out.insert(
                String::from_utf8_lossy(kv.key()).to_string(),
                KvPair {
                    value: kv.value().to_vec(),
                    mod_revision: kv.mod_revision() as u64,
                },
            );
        }
        Ok(out)
    }

    async fn list_prefix_if_locked(
        &self,
        prefix: &str,
        _lock: &dyn KvLock,
    ) -> Result<BTreeMap<String, KvPair>> {
        // The lock guards the writers; a snapshot read needs no transaction.
        self.list_prefix(prefix).await
    }

    async fn watch(
        &self,
        prefix: &str,
        shutdown: CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<KvEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            if let Err(err) = run_watch(client, &prefix, tx, shutdown).await {
                warn!(prefix = %prefix, error = %err, "watch stream terminated");
            }
        });
        Ok(rx)
    }

    async fn lock_path(&self, token: &CancellationToken, path: &str) -> Result<Box<dyn KvLock>> {
        let mut client = self.client.clone();
        let options = LockOptions::new().with_lease(self.lease_id);
        let resp = tokio::select! {
            biased;
            _ = token.cancelled() => {
                return Err(
                    AllocatorError::Cancelled(format!("acquiring lock at {path}")).into(),
                );
            }
            resp = client.lock(path, Some(options)) => {
                resp.with_context(|| format!("unable to lock {path}"))?
            }
        };
        Ok(Box::new(EtcdLock {
            client: self.client.clone(),
            key: resp.key().to_vec(),
        }))
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::CREATE_IF_EXISTS
    }
}

async fn run_watch(
    mut client: Client,
    prefix: &str,
    tx: mpsc::UnboundedSender<KvEvent>,
    shutdown: CancellationToken,
) -> Result<()> {
    let snapshot = client
        .get(prefix, Some(GetOptions::new().with_prefix()))
        .await
        .with_context(|| format!("initial list of {prefix} failed"))?;
    let start_revision = snapshot.header().map(|h| h.revision()).unwrap_or(0) + 1;
    for kv in snapshot.kvs() {
        if tx
            .send(KvEvent {
                kind: KvEventKind::Create,
                key: String::from_utf8_lossy(kv.key()).to_string(),
                value: kv.value().to_vec(),
            })
            .is_err()
        {
            return Ok(());
        }
    }
    if tx.send(KvEvent::list_done()).is_err() {
        return Ok(());
    }

    let options = WatchOptions::new()
        .with_prefix()
        .with_start_revision(start_revision);
    let (mut watcher, mut stream) = client
        .watch(prefix, Some(options))
        .await
        .with_context(|| format!("watch of {prefix} failed"))?;

    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => {
                if let Err(err) = watcher.cancel().await {
                    debug!(error = %err, "unable to cancel watcher");
                }
                return Ok(());
            }
            message = stream.message() => message.context("watch stream error")?,
        };
        let Some(resp) = message else {
            return Ok(());
        };
        for event in resp.events() {
            let Some(kv) = event.kv() else { continue };
            let kind = match event.event_type() {
                EventType::Put => {
                    if kv.create_revision() == kv.mod_revision() {
                        KvEventKind::Create
                    } else {
                        KvEventKind::Modify
                    }
                }
                EventType::Delete => KvEventKind::Delete,
            };
            let ev = KvEvent {
                kind,
                key: String::from_utf8_lossy(kv.key()).to_string(),
                value: kv.value().to_vec(),
            };
            if tx.send(ev).is_err() {
                return Ok(());
            }
        }
    }
}

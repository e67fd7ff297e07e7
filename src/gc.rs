// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Garbage collection of master records whose reference set has emptied.
//!
//! A master record is only deleted after being observed without slave
//! records in two consecutive rounds at the same modification revision. A
//! participant that re-references the key between rounds either writes a
//! slave record (the key has users again) or re-creates the master (the
//! revision changes); both make the collector stand down.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::allocator::prefix_matches_key;
use crate::store::KvStore;
use crate::{ErrorContext, Result};

/// Scans master records and deletes the unreferenced ones. Built into every
/// [`crate::Allocator`]; operator processes that only collect garbage can
/// construct one standalone.
pub struct GarbageCollector {
    store: Arc<dyn KvStore>,
    id_prefix: String,
    value_prefix: String,
    lock_prefix: String,
}

impl GarbageCollector {
    pub fn new(store: Arc<dyn KvStore>, base_path: &str) -> Self {
        GarbageCollector {
            store,
            id_prefix: format!("{base_path}/id"),
            value_prefix: format!("{base_path}/value"),
            lock_prefix: format!("{base_path}/locks"),
        }
    }

    /// One collection round. `stale_prev` is the map returned by the
    /// previous round; the result feeds the next one. Failures on individual
    /// keys are logged and skipped.
    pub async fn run(
        &self,
        stale_prev: &HashMap<String, u64>,
    ) -> Result<HashMap<String, u64>> {
        let masters = self
            .store
            .list_prefix(&self.id_prefix)
            .await
            .context("list of master records failed")?;

        let token = CancellationToken::new();
        let mut stale = HashMap::new();

        for (master_key, pair) in masters {
            let raw = String::from_utf8_lossy(&pair.value).to_string();
            let lock_path = format!("{}/{}", self.lock_prefix, raw);
            let lock = match self.store.lock_path(&token, &lock_path).await {
                Ok(lock) => lock,
                Err(err) => {
                    warn!(key = %master_key, error = %err, "garbage collector was unable to lock key");
                    continue;
                }
            };

            let slave_prefix = format!("{}/{}", self.value_prefix, raw);
            let slaves = match self
                .store
                .list_prefix_if_locked(&slave_prefix, lock.as_ref())
                .await
            {
                Ok(slaves) => slaves,
                Err(err) => {
                    warn!(prefix = %slave_prefix, error = %err, "garbage collector was unable to list slave records");
                    if let Err(err) = lock.unlock().await {
                        warn!(error = %err, "garbage collector was unable to release lock");
                    }
                    continue;
                }
            };

            let has_users = slaves
                .keys()
                .any(|key| prefix_matches_key(&slave_prefix, key));

            if !has_users {
                match stale_prev.get(&master_key) {
                    // Empty in the previous round too, at the same revision;
                    // nothing re-referenced the key in between.
                    Some(&revision) if revision == pair.mod_revision => {
                        match self
                            .store
                            .delete_if_locked(&master_key, lock.as_ref())
                            .await
                        {
                            Ok(()) => info!(key = %master_key, "deleted unused master record"),
                            Err(err) => {
                                warn!(key = %master_key, error = %err, "unable to delete unused master record")
                            }
                        }
                    }
                    _ => {
                        stale.insert(master_key.clone(), pair.mod_revision);
                    }
                }
            }

            if let Err(err) = lock.unlock().await {
                warn!(key = %master_key, error = %err, "garbage collector was unable to release lock");
            }
        }

        Ok(stale)
    }
}

// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-process reference counts for keys this participant currently holds.
//!
//! An entry is *verified* once its slave record has been written to the store
//! since the last reset; only verified entries are re-asserted by the
//! periodic sync task.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::key::Id;
use crate::{raise, Result};

struct LocalKey {
    id: Id,
    refcnt: u64,
    verified: bool,
}

#[derive(Default)]
pub(crate) struct LocalKeys {
    keys: Mutex<HashMap<String, LocalKey>>,
}

impl LocalKeys {
    pub fn new() -> Self {
        LocalKeys::default()
    }

    /// Increment the reference count of `key` if it is present and return its
    /// identifier.
    pub fn use_key(&self, key: &str) -> Option<Id> {
        let mut keys = self.keys.lock();
        let entry = keys.get_mut(key)?;
        entry.refcnt += 1;
        Some(entry.id)
    }

    /// Insert `(key, id)` or increment an existing entry. Returns the
    /// effective identifier; callers must compare it against `id` to detect
    /// that another local writer got there first.
    pub fn allocate(&self, key: &str, id: Id) -> Id {
        let mut keys = self.keys.lock();
        match keys.get_mut(key) {
            Some(entry) => {
                entry.refcnt += 1;
                entry.id
            }
            None => {
                keys.insert(
                    key.to_string(),
                    LocalKey {
                        id,
                        refcnt: 1,
                        verified: false,
                    },
                );
                id
            }
        }
    }

    /// Decrement the reference count of `key`. Returns true when the last
    /// reference was dropped, in which case the entry is removed.
    pub fn release(&self, key: &str) -> Result<bool> {
        let mut keys = self.keys.lock();
        let Some(entry) = keys.get_mut(key) else {
            raise!("unable to release key {key:?}: not allocated locally");
        };
        entry.refcnt -= 1;
        if entry.refcnt == 0 {
            keys.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    /// Mark the slave record of `key` as written to the store.
    pub fn verify(&self, key: &str) -> Result<()> {
        let mut keys = self.keys.lock();
        let Some(entry) = keys.get_mut(key) else {
            raise!("unable to verify key {key:?}: not allocated locally");
        };
        entry.verified = true;
        Ok(())
    }

    /// Identifier held for `key`, or `Id::NONE`. Does not touch the
    /// reference count.
    pub fn lookup_key(&self, key: &str) -> Id {
        self.keys
            .lock()
            .get(key)
            .map(|entry| entry.id)
            .unwrap_or(Id::NONE)
    }

    /// Key currently holding `id`, if any.
    pub fn lookup_id(&self, id: Id) -> Option<String> {
        self.keys
            .lock()
            .iter()
            .find(|(_, entry)| entry.id == id)
            .map(|(key, _)| key.clone())
    }

    /// Snapshot of all verified entries, keyed by identifier.
    pub fn verified_ids(&self) -> HashMap<Id, String> {
        self.keys
            .lock()
            .iter()
            .filter(|(_, entry)| entry.verified)
            .map(|(key, entry)| (entry.id, key.clone()))
            .collect()
    }
}

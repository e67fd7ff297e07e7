// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Pool of unused identifiers within a configured range.
//!
//! An identifier handed to a caller is first *leased*; the caller promotes it
//! to *in-use* once the claim has been published, or returns it with
//! [`IdPool::release`] if publication fails. The leased state exists so that
//! a concurrent external claim observed on the watch stream
//! ([`IdPool::remove`]) cannot race an aborted allocation into double-booking
//! the identifier.
//!
//! The range never materializes: a cursor tracks the lowest identifier that
//! was never handed out, and explicit sets record the exceptions on either
//! side of it. The range may therefore span the full u64 space.

use std::collections::{BTreeSet, HashSet};

use parking_lot::Mutex;

use crate::key::Id;

pub struct IdPool {
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    /// Lowest identifier never handed out nor observed; u128 so the cursor
    /// can move past u64::MAX without wrapping.
    next: u128,
    max: u64,
    /// Identifiers below the cursor that are free again.
    returned: BTreeSet<u64>,
    /// Identifiers at or above the cursor claimed by other participants.
    removed: HashSet<u64>,
    /// Identifiers handed to a caller but not yet confirmed in use.
    leased: HashSet<u64>,
}

impl IdPool {
    pub fn new(min: Id, max: Id) -> Self {
        IdPool {
            inner: Mutex::new(PoolInner {
                next: min.as_u64() as u128,
                max: max.as_u64(),
                returned: BTreeSet::new(),
                removed: HashSet::new(),
                leased: HashSet::new(),
            }),
        }
    }

    /// Remove and return an arbitrary free identifier, marking it leased.
    pub fn lease_available_id(&self) -> Option<Id> {
        let mut p = self.inner.lock();
        if let Some(id) = p.returned.pop_first() {
            p.leased.insert(id);
            return Some(Id(id));
        }
        let mut candidate = p.next;
        while candidate <= p.max as u128 && p.removed.remove(&(candidate as u64)) {
            candidate += 1;
        }
        if candidate > p.max as u128 {
            p.next = candidate;
            return None;
        }
        p.next = candidate + 1;
        let id = candidate as u64;
        p.leased.insert(id);
        Some(Id(id))
    }

    /// Promote a leased identifier to in-use. Idempotent.
    pub fn use_id(&self, id: Id) {
        self.inner.lock().leased.remove(&id.as_u64());
    }

    /// Return a leased or in-use identifier to the pool.
    pub fn release(&self, id: Id) {
        let mut p = self.inner.lock();
        p.leased.remove(&id.as_u64());
        Self::mark_free(&mut p, id.as_u64());
    }

    /// Reflect an external claim of `id` observed on the watch stream.
    pub fn remove(&self, id: Id) {
        let mut p = self.inner.lock();
        let id = id.as_u64();
        if (id as u128) < p.next {
            p.returned.remove(&id);
        } else {
            p.removed.insert(id);
        }
    }

    /// Reflect an external release of `id` observed on the watch stream.
    /// Identifiers currently leased to a local caller stay leased.
    pub fn insert(&self, id: Id) {
        let mut p = self.inner.lock();
        let id = id.as_u64();
        if p.leased.contains(&id) {
            return;
        }
        Self::mark_free(&mut p, id);
    }

    fn mark_free(p: &mut PoolInner, id: u64) {
        if (id as u128) < p.next {
            p.returned.insert(id);
        } else {
            p.removed.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leases_every_id_in_range() {
        let pool = IdPool::new(Id(1), Id(3));
        let mut seen: Vec<u64> = (0..3)
            .map(|_| pool.lease_available_id().unwrap().as_u64())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(pool.lease_available_id(), None);
    }

    #[test]
    fn release_returns_id_to_pool() {
        let pool = IdPool::new(Id(1), Id(1));
        let id = pool.lease_available_id().unwrap();
        pool.release(id);
        assert_eq!(pool.lease_available_id(), Some(id));
    }

    #[test]
    fn released_in_use_id_becomes_available() {
        let pool = IdPool::new(Id(1), Id(1));
        let id = pool.lease_available_id().unwrap();
        pool.use_id(id);
        pool.release(id);
        assert_eq!(pool.lease_available_id(), Some(id));
    }

    #[test]
    fn external_claim_skips_id() {
        let pool = IdPool::new(Id(1), Id(2));
        pool.remove(Id(1));
        assert_eq!(pool.lease_available_id(), Some(Id(2)));
        assert_eq!(pool.lease_available_id(), None);
    }

    #[test]
    fn external_claim_then_release_round_trips() {
        let pool = IdPool::new(Id(1), Id(3));
        pool.remove(Id(2));
        pool.insert(Id(2));
        let mut seen: Vec<u64> = (0..3)
            .map(|_| pool.lease_available_id().unwrap().as_u64())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn insert_does_not_free_leased_id() {
        let pool = IdPool::new(Id(1), Id(1));
        let id = pool.lease_available_id().unwrap();
        pool.insert(id);
        assert_eq!(pool.lease_available_id(), None);
        pool.release(id);
        assert_eq!(pool.lease_available_id(), Some(id));
    }

    #[test]
    fn full_u64_range_does_not_materialize() {
        let pool = IdPool::new(Id(1), Id(u64::MAX));
        assert_eq!(pool.lease_available_id(), Some(Id(1)));
        assert_eq!(pool.lease_available_id(), Some(Id(2)));
    }

    #[test]
    fn exhausted_single_id_range_at_max() {
        let pool = IdPool::new(Id(u64::MAX - 1), Id(u64::MAX));
        assert_eq!(pool.lease_available_id(), Some(Id(u64::MAX - 1)));
        assert_eq!(pool.lease_available_id(), Some(Id(u64::MAX)));
        assert_eq!(pool.lease_available_id(), None);
        assert_eq!(pool.lease_available_id(), None);
    }
}

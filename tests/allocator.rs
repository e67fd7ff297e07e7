// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end allocator behavior over the in-process store backend. Each
//! test builds one hub and derives one session per simulated participant.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use idbroker::store::memory::MemoryStore;
use idbroker::store::KvStore;
use idbroker::{
    Allocator, AllocatorError, AllocatorEvent, CancellationToken, EventKind, Id, StringKey,
};

const BASE: &str = "unit/identities/v1";

fn key(raw: &str) -> StringKey {
    StringKey::new(raw).unwrap()
}

async fn participant(store: &MemoryStore, suffix: &str, max: u64) -> Allocator {
    let session: Arc<dyn KvStore> = Arc::new(store.session());
    Allocator::builder(session, BASE, Box::new(key("prototype")))
        .with_min(Id(1))
        .with_max(Id(max))
        .with_suffix(suffix)
        .build()
        .await
        .unwrap()
}

/// Poll `probe` until it returns true or the deadline passes.
async fn eventually<F, Fut>(what: &str, mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if probe().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for: {what}");
}

#[tokio::test]
async fn participants_converge_on_one_identifier() {
    let hub = MemoryStore::new();
    let n1 = participant(&hub, "node-1", 3).await;
    let n2 = participant(&hub, "node-2", 3).await;
    let token = CancellationToken::new();

    let (id1, new1) = n1.allocate(&token, &key("a")).await.unwrap();
    assert!(new1);
    assert!((1..=3).contains(&id1.as_u64()));

    let (id2, new2) = n2.allocate(&token, &key("a")).await.unwrap();
    assert!(!new2);
    assert_eq!(id1, id2);

    assert_eq!(n1.get(&key("a")).await.unwrap(), id1);
    assert_eq!(n2.get(&key("a")).await.unwrap(), id1);
}

#[tokio::test]
async fn release_and_two_round_gc_reclaim_the_master() {
    let hub = MemoryStore::new();
    let n1 = participant(&hub, "node-1", 3).await;
    let n2 = participant(&hub, "node-2", 3).await;
    let token = CancellationToken::new();

    let (id, _) = n1.allocate(&token, &key("a")).await.unwrap();
    n2.allocate(&token, &key("a")).await.unwrap();

    // The other participant still references the key.
    assert!(!n1.release(&token, &key("a")).await.unwrap());
    assert!(n2.release(&token, &key("a")).await.unwrap());

    let slaves = hub.list_prefix(&format!("{BASE}/value/a")).await.unwrap();
    assert!(slaves.is_empty());

    let master = format!("{BASE}/id/{id}");
    let stale = n2.run_gc(&HashMap::new()).await.unwrap();
    assert!(stale.contains_key(&master));
    assert!(hub.get(&master).await.unwrap().is_some());

    let next = n2.run_gc(&stale).await.unwrap();
    assert!(hub.get(&master).await.unwrap().is_none());
    assert!(next.is_empty());
}

#[tokio::test]
async fn exhausted_id_space_fails_fast() {
    let hub = MemoryStore::new();
    let n1 = participant(&hub, "node-1", 3).await;
    let token = CancellationToken::new();

    let mut ids = HashSet::new();
    for raw in ["a", "b", "c"] {
        let (id, is_new) = n1.allocate(&token, &key(raw)).await.unwrap();
        assert!(is_new);
        assert!((1..=3).contains(&id.as_u64()));
        ids.insert(id);
    }
    assert_eq!(ids.len(), 3);

    let err = n1.allocate(&token, &key("d")).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<AllocatorError>(),
        Some(AllocatorError::PoolExhausted)
    ));
}

#[tokio::test]
async fn crashed_participant_is_reclaimed_after_lease_expiry() {
    let hub = MemoryStore::new();
    let n1_session = Arc::new(hub.session());
    let n1_store: Arc<dyn KvStore> = n1_session.clone();
    let n1 = Allocator::builder(n1_store, BASE, Box::new(key("prototype")))
        .with_min(Id(1))
        .with_max(Id(3))
        .with_suffix("node-1")
        .build()
        .await
        .unwrap();
    let n2 = participant(&hub, "node-2", 3).await;
    let token = CancellationToken::new();

    let (id, _) = n1.allocate(&token, &key("a")).await.unwrap();
    let master = format!("{BASE}/id/{id}");

    // The participant dies: its tasks stop and its lease expires.
    n1.delete();
    drop(n1);
    n1_session.revoke_lease();

    let slaves = hub.list_prefix(&format!("{BASE}/value/a")).await.unwrap();
    assert!(slaves.is_empty());

    let stale = n2.run_gc(&HashMap::new()).await.unwrap();
    n2.run_gc(&stale).await.unwrap();
    assert!(hub.get(&master).await.unwrap().is_none());

    eventually("the reclaimed identifier to leave the cache", || async {
        n2.get(&key("a")).await.unwrap().is_none()
    })
    .await;

    let (id2, is_new) = n2.allocate(&token, &key("a")).await.unwrap();
    assert!(is_new);
    assert!((1..=3).contains(&id2.as_u64()));
}

#[tokio::test]
async fn master_key_protection_restores_deleted_masters() {
    let hub = MemoryStore::new();
    let session: Arc<dyn KvStore> = Arc::new(hub.session());
    let n1 = Allocator::builder(session, BASE, Box::new(key("prototype")))
        .with_min(Id(1))
        .with_max(Id(3))
        .with_suffix("node-1")
        .with_master_key_protection()
        .build()
        .await
        .unwrap();
    let token = CancellationToken::new();

    let (id, _) = n1.allocate(&token, &key("a")).await.unwrap();
    let master = format!("{BASE}/id/{id}");

    hub.delete(&master).await.unwrap();

    eventually("the master record to be restored", || async {
        hub.get(&master).await.unwrap() == Some(b"a".to_vec())
    })
    .await;
}

#[tokio::test]
async fn slave_prefix_aliasing_does_not_leak_ids() {
    let hub = MemoryStore::new();
    hub.create_only(&format!("{BASE}/value/label;foo;/n1"), b"1", false)
        .await
        .unwrap();
    hub.create_only(&format!("{BASE}/value/label;foo;bar;/n1"), b"2", false)
        .await
        .unwrap();

    let n1 = participant(&hub, "node-x", 10).await;
    assert_eq!(n1.get(&key("label;foo;")).await.unwrap(), Id(1));
    assert_eq!(n1.get(&key("label;foo;bar;")).await.unwrap(), Id(2));
}

#[tokio::test]
async fn concurrent_allocations_are_unique_and_stable() {
    let hub = MemoryStore::new();
    let n1 = Arc::new(participant(&hub, "node-1", 100).await);
    let n2 = Arc::new(participant(&hub, "node-2", 100).await);

    let keys: Vec<String> = (0..10).map(|i| format!("key-{i}")).collect();
    let mut tasks = Vec::new();
    for raw in &keys {
        for node in [n1.clone(), n2.clone()] {
            let raw = raw.clone();
            tasks.push(tokio::spawn(async move {
                let token = CancellationToken::new();
                let (id, _) = node.allocate(&token, &key(&raw)).await.unwrap();
                (raw, id)
            }));
        }
    }

    let mut by_key: HashMap<String, HashSet<Id>> = HashMap::new();
    for result in join_all(tasks).await {
        let (raw, id) = result.unwrap();
        by_key.entry(raw).or_default().insert(id);
    }

    // Every participant got the same identifier per key.
    for (raw, ids) in &by_key {
        assert_eq!(ids.len(), 1, "key {raw} mapped to multiple ids: {ids:?}");
    }

    // Distinct keys got distinct identifiers.
    let all: HashSet<Id> = by_key.values().flatten().copied().collect();
    assert_eq!(all.len(), keys.len());
}

#[tokio::test]
async fn local_allocate_and_release_are_idempotent() {
    let hub = MemoryStore::new();
    let n1 = participant(&hub, "node-1", 3).await;
    let token = CancellationToken::new();

    let (id, first) = n1.allocate(&token, &key("a")).await.unwrap();
    assert!(first);
    let (again, second) = n1.allocate(&token, &key("a")).await.unwrap();
    assert!(!second);
    assert_eq!(id, again);

    let slave = format!("{BASE}/value/a/node-1");
    assert!(hub.get(&slave).await.unwrap().is_some());

    assert!(!n1.release(&token, &key("a")).await.unwrap());
    assert!(hub.get(&slave).await.unwrap().is_some());

    assert!(n1.release(&token, &key("a")).await.unwrap());
    assert!(hub.get(&slave).await.unwrap().is_none());

    // No reference left to drop.
    assert!(n1.release(&token, &key("a")).await.is_err());
}

#[tokio::test]
async fn gc_spares_masters_with_live_references() {
    let hub = MemoryStore::new();
    let n1 = participant(&hub, "node-1", 3).await;
    let n2 = participant(&hub, "node-2", 3).await;
    let token = CancellationToken::new();

    let (id, _) = n1.allocate(&token, &key("a")).await.unwrap();
    let master = format!("{BASE}/id/{id}");

    let stale = n2.run_gc(&HashMap::new()).await.unwrap();
    assert!(stale.is_empty());
    let stale = n2.run_gc(&stale).await.unwrap();
    assert!(stale.is_empty());
    assert!(hub.get(&master).await.unwrap().is_some());
}

#[tokio::test]
async fn reallocation_between_gc_rounds_stands_down_the_collector() {
    let hub = MemoryStore::new();
    let n1 = participant(&hub, "node-1", 3).await;
    let token = CancellationToken::new();

    let (id, _) = n1.allocate(&token, &key("a")).await.unwrap();
    let master = format!("{BASE}/id/{id}");
    n1.release(&token, &key("a")).await.unwrap();

    // First round observes the key as unreferenced.
    let stale = n1.run_gc(&HashMap::new()).await.unwrap();
    assert!(stale.contains_key(&master));

    // The key comes back into use before the second round.
    let (id2, is_new) = n1.allocate(&token, &key("a")).await.unwrap();
    assert_eq!(id, id2);
    assert!(!is_new);

    let next = n1.run_gc(&stale).await.unwrap();
    assert!(hub.get(&master).await.unwrap().is_some());
    assert!(!next.contains_key(&master));
}

#[tokio::test]
async fn cache_and_store_converge() {
    let hub = MemoryStore::new();
    let n1 = participant(&hub, "node-1", 10).await;
    let n2 = participant(&hub, "node-2", 10).await;
    let token = CancellationToken::new();

    for raw in ["a", "b", "c"] {
        n1.allocate(&token, &key(raw)).await.unwrap();
    }

    let expected: HashSet<(u64, String)> = hub
        .list_prefix(&format!("{BASE}/id/"))
        .await
        .unwrap()
        .into_iter()
        .map(|(path, pair)| {
            let id = path.rsplit('/').next().unwrap().parse::<u64>().unwrap();
            (id, String::from_utf8(pair.value).unwrap())
        })
        .collect();
    assert_eq!(expected.len(), 3);

    eventually("the observer cache to catch up with the store", || async {
        let mut seen = HashSet::new();
        n2.foreach_cache(&mut |id, k| {
            seen.insert((id.as_u64(), k.get_key()));
        });
        seen == expected
    })
    .await;
}

#[tokio::test]
async fn events_are_delivered_in_watch_order() {
    let hub = MemoryStore::new();
    let session: Arc<dyn KvStore> = Arc::new(hub.session());
    let (tx, mut rx) = mpsc::channel::<AllocatorEvent>(32);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            sink.lock().push((event.kind, event.id, event.key.get_key()));
        }
    });

    let n1 = Allocator::builder(session, BASE, Box::new(key("prototype")))
        .with_min(Id(1))
        .with_max(Id(3))
        .with_suffix("node-1")
        .with_events(tx)
        .build()
        .await
        .unwrap();
    let token = CancellationToken::new();

    let (id, _) = n1.allocate(&token, &key("a")).await.unwrap();
    eventually("the create event to arrive", || async {
        seen.lock()
            .contains(&(EventKind::Create, id, "a".to_string()))
    })
    .await;

    n1.release(&token, &key("a")).await.unwrap();
    let stale = n1.run_gc(&HashMap::new()).await.unwrap();
    n1.run_gc(&stale).await.unwrap();
    eventually("the delete event to arrive", || async {
        seen.lock()
            .contains(&(EventKind::Delete, id, "a".to_string()))
    })
    .await;
}

#[tokio::test]
async fn remote_caches_merge_into_enumeration() {
    let hub = MemoryStore::new();
    let remote_hub = MemoryStore::new();
    const REMOTE_BASE: &str = "remote/identities/v1";

    let n1 = participant(&hub, "node-1", 10).await;
    let remote: Arc<dyn KvStore> = Arc::new(remote_hub.session());
    let remote_alloc = Allocator::builder(remote.clone(), REMOTE_BASE, Box::new(key("prototype")))
        .with_min(Id(1))
        .with_max(Id(10))
        .with_suffix("remote-node")
        .build()
        .await
        .unwrap();
    let token = CancellationToken::new();

    let (remote_id, _) = remote_alloc.allocate(&token, &key("r")).await.unwrap();
    n1.allocate(&token, &key("l")).await.unwrap();

    let watch = n1
        .watch_remote_kv_store(remote, REMOTE_BASE)
        .await
        .unwrap();

    eventually("the remote identifier to appear in enumeration", || async {
        let mut seen = HashSet::new();
        n1.foreach_cache(&mut |id, k| {
            seen.insert((id, k.get_key()));
        });
        seen.contains(&(remote_id, "r".to_string()))
    })
    .await;

    watch.close();
    let mut seen = HashSet::new();
    n1.foreach_cache(&mut |id, k| {
        seen.insert((id, k.get_key()));
    });
    assert!(!seen.contains(&(remote_id, "r".to_string())));
    assert!(seen.iter().any(|(_, k)| k == "l"));
}

#[tokio::test]
async fn invalid_master_records_are_deleted_by_the_main_cache() {
    let hub = MemoryStore::new();
    let _n1 = participant(&hub, "node-1", 10).await;

    // An empty value cannot be decoded into a key.
    let corrupt = format!("{BASE}/id/9");
    hub.create_only(&corrupt, b"", false).await.unwrap();

    eventually("the corrupt master record to be deleted", || async {
        hub.get(&corrupt).await.unwrap().is_none()
    })
    .await;
}

#[tokio::test]
async fn get_by_id_decodes_master_records() {
    let hub = MemoryStore::new();
    let n1 = participant(&hub, "node-1", 10).await;
    let n2 = participant(&hub, "node-2", 10).await;
    let token = CancellationToken::new();

    let (id, _) = n1.allocate(&token, &key("a")).await.unwrap();

    // Served from the store even before the watch stream catches up.
    let decoded = n2.get_by_id(id).await.unwrap().unwrap();
    assert_eq!(decoded.get_key(), "a");

    assert!(n2.get_by_id(Id(999)).await.unwrap().is_none());
}

#[tokio::test]
async fn cancelled_token_aborts_allocation() {
    let hub = MemoryStore::new();
    let n1 = participant(&hub, "node-1", 10).await;
    let token = CancellationToken::new();
    token.cancel();

    let err = n1.allocate(&token, &key("a")).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<AllocatorError>(),
        Some(AllocatorError::Cancelled(_))
    ));
}

#[tokio::test]
async fn delete_all_keys_empties_the_base_path() {
    let hub = MemoryStore::new();
    let n1 = participant(&hub, "node-1", 10).await;
    let token = CancellationToken::new();

    n1.allocate(&token, &key("a")).await.unwrap();
    n1.allocate(&token, &key("b")).await.unwrap();
    n1.delete_all_keys().await.unwrap();

    let remaining = hub.list_prefix(BASE).await.unwrap();
    assert!(remaining.is_empty());
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration Tests for Coordination Engine
//!
//! End-to-end scenarios against the in-memory store. Separate
//! `LockManager`/`ReplayQueue` instances over one store stand in for
//! separate processes.
//!
//! # Running Tests
//! ```bash
//! cargo test --test integration
//! ```
//!
//! # Test Organization
//! - `lock_*` - mutual exclusion, reentrancy, crash liveness
//! - `queue_*` - broadcast delivery and cursor handling
//! - `map_*` / `set_*` - ordering, live views, bounds
//! - `coordinator_*` - facade wiring

mod common;

use common::{coordinator, eventually, lock_manager, memory_store, s};
use coordination_engine::collections::{SortedMap, SortedSet};
use coordination_engine::config::{QueueConfig, WatcherConfig};
use coordination_engine::error::CoordinationError;
use coordination_engine::lock::OwnerToken;
use coordination_engine::queue::ReplayQueue;
use coordination_engine::store::DocumentStore;
use coordination_engine::{CoordinatorState, JsonCodec};
use futures::TryStreamExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn queue(store: &Arc<coordination_engine::MemoryStore>, name: &str) -> ReplayQueue<String> {
    ReplayQueue::with_codec(
        store.clone(),
        name,
        QueueConfig::for_testing(),
        WatcherConfig::for_testing(),
        JsonCodec::new(),
    )
    .unwrap()
}

// =============================================================================
// Lock Tests
// =============================================================================

#[tokio::test]
async fn lock_race_has_exactly_one_winner() {
    let store = memory_store();
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let manager = lock_manager(&store);
        tasks.push(tokio::spawn(async move {
            let owner = OwnerToken::new();
            let lease = manager.try_lock("L", &owner).await.unwrap();
            (manager, lease)
        }));
    }

    let mut winners = 0;
    let mut keep = Vec::new();
    for task in tasks {
        let (manager, lease) = task.await.unwrap();
        if lease.is_some() {
            winners += 1;
        }
        keep.push((manager, lease));
    }
    assert_eq!(winners, 1);

    for (manager, lease) in keep {
        if let Some(lease) = lease {
            manager.unlock(lease).await.unwrap();
        }
    }
}

#[tokio::test]
async fn lock_reentrancy_releases_on_outermost_unlock() {
    let store = memory_store();
    let a = lock_manager(&store);
    let b = lock_manager(&store);
    let owner_a = OwnerToken::from("owner-a");
    let owner_b = OwnerToken::from("owner-b");

    let outer = a.lock("L", &owner_a).await.unwrap();
    let inner = a.lock("L", &owner_a).await.unwrap();
    assert_eq!(a.hold_count("L", &owner_a), 2);

    let acquired = Arc::new(AtomicBool::new(false));
    let waiter = {
        let b = b.clone();
        let acquired = acquired.clone();
        let owner_b = owner_b.clone();
        tokio::spawn(async move {
            let lease = b.lock("L", &owner_b).await.unwrap();
            acquired.store(true, Ordering::SeqCst);
            b.unlock(lease).await.unwrap();
        })
    };

    a.unlock(inner).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(a.is_held_by("L", &owner_a));
    assert!(!acquired.load(Ordering::SeqCst), "inner unlock must not release");

    a.unlock(outer).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), waiter).await.unwrap().unwrap();
    assert!(acquired.load(Ordering::SeqCst));
}

#[tokio::test]
async fn lock_liveness_after_holder_crash() {
    let store = memory_store();
    let crashed = lock_manager(&store);
    let survivor = lock_manager(&store);
    let lease_window = crashed.config().lease_window();

    let _abandoned = crashed.try_lock("L", &OwnerToken::new()).await.unwrap().unwrap();
    let crashed_at = Instant::now();
    crashed.shutdown();

    let acquired = survivor
        .try_lock_for("L", &OwnerToken::new(), Duration::from_secs(5))
        .await
        .unwrap();
    assert!(acquired.is_some());
    // One lease window plus one wait slice of slack.
    assert!(crashed_at.elapsed() < lease_window + Duration::from_millis(300));
    survivor.unlock(acquired.unwrap()).await.unwrap();
}

#[tokio::test]
async fn lock_heartbeat_outlives_lease_window() {
    let store = memory_store();
    let holder = lock_manager(&store);
    let contender = lock_manager(&store);
    let owner = OwnerToken::new();

    let lease = holder.lock("L", &owner).await.unwrap();
    tokio::time::sleep(holder.config().lease_window() * 3).await;

    assert!(contender.try_lock("L", &OwnerToken::new()).await.unwrap().is_none());
    assert!(holder.is_held_by("L", &owner));
    holder.unlock(lease).await.unwrap();
}

#[tokio::test]
async fn lock_execute_serializes_critical_sections() {
    let store = memory_store();
    let inside = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let manager = lock_manager(&store);
        let inside = inside.clone();
        let completed = completed.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..3 {
                let inside = inside.clone();
                let completed = completed.clone();
                manager
                    .wait_lock_and_execute("critical", &OwnerToken::new(), || async move {
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0, "overlapping holders");
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        completed.fetch_add(1, Ordering::SeqCst);
                    })
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        tokio::time::timeout(Duration::from_secs(20), task).await.unwrap().unwrap();
    }
    assert_eq!(completed.load(Ordering::SeqCst), 12);
}

#[tokio::test]
async fn lock_record_removed_after_release() {
    let store = memory_store();
    let manager = lock_manager(&store);
    let lease = manager.lock("L", &OwnerToken::new()).await.unwrap();
    assert!(store.get("locks", "L").await.unwrap().is_some());

    manager.unlock(lease).await.unwrap();
    assert!(store.get("locks", "L").await.unwrap().is_none());
    let manager = &manager;
    assert!(
        eventually(Duration::from_secs(1), || async move { !manager.is_heartbeat_running() }).await,
        "heartbeat should stop once nothing is held"
    );
}

// =============================================================================
// Queue Tests
// =============================================================================

#[tokio::test]
async fn queue_broadcast_to_independent_consumers() {
    let store = memory_store();
    let producer = queue(&store, "events");
    let first = queue(&store, "events");
    let second = queue(&store, "events");

    for v in ["A", "B", "C"] {
        producer.offer(&s(v)).await.unwrap();
    }

    for expected in ["A", "B", "C"] {
        assert_eq!(first.poll().await.unwrap(), Some(s(expected)));
    }
    assert_eq!(first.poll().await.unwrap(), None);

    for expected in ["A", "B", "C"] {
        assert_eq!(second.poll().await.unwrap(), Some(s(expected)));
    }
}

#[tokio::test]
async fn queue_cursor_skip_sees_only_new_entries() {
    let store = memory_store();
    let q = queue(&store, "events");
    q.offer(&s("A")).await.unwrap();
    q.move_pointer_to_end().await.unwrap();
    q.offer(&s("B")).await.unwrap();

    assert_eq!(q.poll().await.unwrap(), Some(s("B")));
    assert_eq!(q.poll().await.unwrap(), None);
}

#[tokio::test]
async fn queue_blocked_consumers_all_receive() {
    let store = memory_store();
    let producer = queue(&store, "events");

    let mut consumers = Vec::new();
    for _ in 0..3 {
        let consumer = queue(&store, "events");
        consumers.push(tokio::spawn(async move { consumer.take().await }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    producer.offer(&s("wake")).await.unwrap();

    for consumer in consumers {
        let item = tokio::time::timeout(Duration::from_secs(2), consumer).await.unwrap().unwrap();
        assert_eq!(item.unwrap(), "wake");
    }
}

#[tokio::test]
async fn queue_concurrent_producers_preserve_per_producer_order() {
    let store = memory_store();
    let mut tasks = Vec::new();
    for p in 0..3 {
        let producer = queue(&store, "events");
        tasks.push(tokio::spawn(async move {
            let items: Vec<String> = (0..10).map(|i| format!("{}:{}", p, i)).collect();
            producer.add_all(&items).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let consumer = queue(&store, "events");
    let mut last_seen = [-1i32; 3];
    let mut total = 0;
    while let Some(item) = consumer.poll().await.unwrap() {
        let (p, i) = item.split_once(':').unwrap();
        let (p, i): (usize, i32) = (p.parse().unwrap(), i.parse().unwrap());
        assert!(i > last_seen[p], "producer {} out of order", p);
        last_seen[p] = i;
        total += 1;
    }
    assert_eq!(total, 30);
}

#[tokio::test]
async fn queue_entries_expire_with_ttl() {
    let store = memory_store();
    let config = QueueConfig {
        entry_ttl_sec: Some(1),
        ..QueueConfig::for_testing()
    };
    let producer = ReplayQueue::<String>::new(store.clone(), "short-lived", config).unwrap();
    producer.offer(&s("A")).await.unwrap();
    assert_eq!(producer.size().await.unwrap(), 1);

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(producer.size().await.unwrap(), 0);
    assert_eq!(producer.poll().await.unwrap(), None);
}

// =============================================================================
// Map and Set Tests
// =============================================================================

#[tokio::test]
async fn map_ordering_and_iterator_removal() {
    let store = memory_store();
    let map = SortedMap::<String>::new(store.clone(), "map").unwrap();
    map.put("b", &s("2")).await.unwrap();
    map.put("a", &s("1")).await.unwrap();
    map.put("c", &s("3")).await.unwrap();

    assert_eq!(map.first_key().await.unwrap(), Some(s("a")));
    assert_eq!(map.last_key().await.unwrap(), Some(s("c")));

    let keys: Vec<String> = map.key_set().iter().into_stream().try_collect().await.unwrap();
    assert_eq!(keys, vec!["a", "b", "c"]);

    let mut iter = map.key_set().iter();
    while let Some(key) = iter.next().await.unwrap() {
        if key == "b" {
            iter.remove().await.unwrap();
        }
    }
    assert!(!map.contains_key("b").await.unwrap());

    let entries: Vec<(String, String)> = map.entry_set().iter().into_stream().try_collect().await.unwrap();
    assert_eq!(entries, vec![(s("a"), s("1")), (s("c"), s("3"))]);
}

#[tokio::test]
async fn map_is_shared_between_handles() {
    let store = memory_store();
    let writer = SortedMap::<u64>::new(store.clone(), "scores").unwrap();
    let reader = SortedMap::<u64>::new(store.clone(), "scores").unwrap();

    writer.put("alice", &10).await.unwrap();
    assert_eq!(reader.get("alice").await.unwrap(), Some(10));
    assert_eq!(writer.put("alice", &11).await.unwrap(), Some(10));
    assert!(reader.contains_value(&11).await.unwrap());
}

#[tokio::test]
async fn map_views_reject_writes_outside_bounds() {
    let store = memory_store();
    let map = SortedMap::<String>::new(store.clone(), "map").unwrap();
    let head = map.head_map("m").unwrap();

    head.put("apple", &s("ok")).await.unwrap();
    assert!(matches!(
        head.put("zebra", &s("no")).await,
        Err(CoordinationError::OutOfRange { .. })
    ));
    assert_eq!(head.get("zebra").await.unwrap(), None);
    assert!(matches!(head.tail_map("a").unwrap().head_map("z"), Err(CoordinationError::OutOfRange { .. })));
}

#[tokio::test]
async fn set_membership_is_shared() {
    let store = memory_store();
    let a = SortedSet::new(store.clone(), "members").unwrap();
    let b = SortedSet::new(store.clone(), "members").unwrap();

    assert!(a.add("node-2").await.unwrap());
    assert!(a.add("node-1").await.unwrap());
    assert!(!b.add("node-1").await.unwrap());
    assert_eq!(b.first().await.unwrap(), Some(s("node-1")));
    assert_eq!(b.len().await.unwrap(), 2);
}

// =============================================================================
// Coordinator Tests
// =============================================================================

#[tokio::test]
async fn coordinator_end_to_end() {
    let store = memory_store();
    let c = coordinator(&store);

    let locks = c.lock_manager().unwrap();
    let owner = OwnerToken::new();
    let result = locks
        .no_wait_lock_and_execute("job", &owner, || async { 42 })
        .await
        .unwrap();
    assert_eq!(result, Some(42));

    let events = c.queue::<String>("events").unwrap();
    events.offer(&s("started")).await.unwrap();
    assert_eq!(c.queue::<String>("events").unwrap().peek().await.unwrap(), Some(s("started")));

    c.shutdown();
    assert_eq!(c.state(), CoordinatorState::Stopped);
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process document store.
//!
//! One `BTreeMap` per collection gives native key order, and a broadcast
//! channel per collection carries change events. An expiry index keyed by
//! `(expire_at, key)` lets every operation purge due documents in
//! `O(expired)` before it runs, which is how the lazy TTL is honoured.
//!
//! Test hooks:
//! - [`MemoryStore::drop_collection`] simulates a dropped collection and ends live watches
//! - [`MemoryStore::fail_next_operations`] injects transient store errors

use super::{
    BoxFuture, ChangeEvent, ChangeStream, Document, DocumentStore, Filter, InsertOutcome, OperationKind,
    Precondition, SortOrder, Update, now_millis,
};
use crate::error::{CoordinationError, Result};
use crate::metrics;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Buffered change events per collection before slow subscribers lag.
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

struct Collection {
    docs: BTreeMap<String, Document>,
    expiries: BTreeSet<(i64, String)>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl Collection {
    fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            docs: BTreeMap::new(),
            expiries: BTreeSet::new(),
            changes,
        }
    }

    fn emit(&self, key: &str, kind: OperationKind) {
        // No subscribers is fine.
        let _ = self.changes.send(ChangeEvent {
            key: key.to_string(),
            kind,
        });
    }

    /// Remove every document due at `now`, publishing a delete for each.
    fn purge_expired(&mut self, now: i64) -> usize {
        let mut purged = 0;
        while let Some((at, key)) = self.expiries.first().cloned() {
            if at > now {
                break;
            }
            self.expiries.remove(&(at, key.clone()));
            if self.docs.get(&key).is_some_and(|d| d.is_expired(now)) {
                self.docs.remove(&key);
                trace!(key = %key, expire_at = at, "Purged expired document");
                self.emit(&key, OperationKind::Delete);
                purged += 1;
            }
        }
        purged
    }

    fn put(&mut self, doc: Document) -> Option<Document> {
        if let Some(at) = doc.expire_at {
            self.expiries.insert((at, doc.key.clone()));
        }
        let previous = self.docs.insert(doc.key.clone(), doc);
        if let Some(at) = previous.as_ref().and_then(|p| p.expire_at) {
            let key = previous.as_ref().map(|p| p.key.clone()).unwrap_or_default();
            // Keep the entry if the new document has the same deadline.
            let still_used = self.docs.get(&key).and_then(|d| d.expire_at) == Some(at);
            if !still_used {
                self.expiries.remove(&(at, key));
            }
        }
        previous
    }

    fn remove(&mut self, key: &str) -> Option<Document> {
        let removed = self.docs.remove(key)?;
        if let Some(at) = removed.expire_at {
            self.expiries.remove(&(at, key.to_string()));
        }
        Some(removed)
    }

    fn set_expire_at(&mut self, key: &str, at: i64) -> bool {
        let Some(doc) = self.docs.get_mut(key) else {
            return false;
        };
        if let Some(old) = doc.expire_at.replace(at) {
            self.expiries.remove(&(old, key.to_string()));
        }
        self.expiries.insert((at, key.to_string()));
        true
    }

    fn matching<'a>(&'a self, filter: &'a Filter, order: SortOrder) -> Box<dyn Iterator<Item = &'a Document> + 'a> {
        if filter.range.is_empty() {
            return Box::new(std::iter::empty());
        }
        let range = self.docs.range::<str, _>(filter.range.as_bounds()).map(|(_, d)| d);
        let matches = move |d: &&Document| filter.matches(d);
        match order {
            SortOrder::Ascending => Box::new(range.filter(matches)),
            SortOrder::Descending => Box::new(range.rev().filter(matches)),
        }
    }
}

/// In-process [`DocumentStore`].
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Collection>>,
    fail_next: AtomicUsize,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            collections: Mutex::new(HashMap::new()),
            fail_next: AtomicUsize::new(0),
            sweeper: Mutex::new(None),
        }
    }

    /// Create a store that also purges expired documents every `interval`.
    pub fn with_expiry_sweep(interval: Duration) -> Arc<Self> {
        let store = Arc::new(Self::new());
        let weak = Arc::downgrade(&store);
        let handle = tokio::spawn(sweep_loop(weak, interval));
        if let Ok(mut slot) = store.sweeper.lock() {
            *slot = Some(handle);
        }
        store
    }

    /// Purge expired documents in every collection now.
    pub fn sweep_expired(&self) -> usize {
        let now = now_millis();
        match self.collections.lock() {
            Ok(mut collections) => collections.values_mut().map(|c| c.purge_expired(now)).sum(),
            Err(_) => 0,
        }
    }

    /// Drop a collection and everything in it. Open watches on it end.
    pub fn drop_collection(&self, collection: &str) -> bool {
        let dropped = self
            .collections
            .lock()
            .map(|mut c| c.remove(collection).is_some())
            .unwrap_or(false);
        if dropped {
            debug!(collection, "Dropped collection");
        }
        dropped
    }

    /// Make the next `count` store operations fail with a retryable error.
    pub fn fail_next_operations(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    fn injected_failure(&self, operation: &str) -> Result<()> {
        let took = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            return Err(CoordinationError::store(operation, "injected failure"));
        }
        Ok(())
    }

    /// Run `f` against a collection after purging what has expired.
    fn with_collection<T>(
        &self,
        operation: &str,
        collection: &str,
        f: impl FnOnce(&mut Collection) -> T,
    ) -> Result<T> {
        self.injected_failure(operation)?;
        let mut collections = self
            .collections
            .lock()
            .map_err(|_| CoordinationError::Internal("memory store mutex poisoned".into()))?;
        let state = collections
            .entry(collection.to_string())
            .or_insert_with(Collection::new);
        state.purge_expired(now_millis());
        Ok(f(state))
    }

    /// Like [`with_collection`](Self::with_collection) but never creates the
    /// collection: an unknown one yields `absent`.
    fn with_existing<T>(
        &self,
        operation: &str,
        collection: &str,
        absent: T,
        f: impl FnOnce(&mut Collection) -> T,
    ) -> Result<T> {
        self.injected_failure(operation)?;
        let mut collections = self
            .collections
            .lock()
            .map_err(|_| CoordinationError::Internal("memory store mutex poisoned".into()))?;
        match collections.get_mut(collection) {
            Some(state) => {
                state.purge_expired(now_millis());
                Ok(f(state))
            }
            None => Ok(absent),
        }
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.sweeper.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

async fn sweep_loop(store: Weak<MemoryStore>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(store) = store.upgrade() else {
            return;
        };
        let purged = store.sweep_expired();
        metrics::record_expired_swept("memory", purged);
    }
}

impl DocumentStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn insert_if_absent<'a>(&'a self, collection: &'a str, doc: Document) -> BoxFuture<'a, InsertOutcome> {
        Box::pin(async move {
            self.with_collection("insert", collection, |c| {
                if c.docs.contains_key(&doc.key) {
                    return InsertOutcome::DuplicateKey;
                }
                let key = doc.key.clone();
                c.put(doc);
                c.emit(&key, OperationKind::Insert);
                InsertOutcome::Inserted
            })
        })
    }

    fn insert_batch<'a>(&'a self, collection: &'a str, docs: Vec<Document>) -> BoxFuture<'a, InsertOutcome> {
        Box::pin(async move {
            self.with_collection("insert_batch", collection, |c| {
                let mut seen = HashSet::new();
                if docs.iter().any(|d| c.docs.contains_key(&d.key) || !seen.insert(d.key.as_str())) {
                    return InsertOutcome::DuplicateKey;
                }
                for doc in docs {
                    let key = doc.key.clone();
                    c.put(doc);
                    c.emit(&key, OperationKind::Insert);
                }
                InsertOutcome::Inserted
            })
        })
    }

    fn upsert<'a>(&'a self, collection: &'a str, doc: Document) -> BoxFuture<'a, Option<Document>> {
        Box::pin(async move {
            self.with_collection("upsert", collection, |c| {
                let key = doc.key.clone();
                let previous = c.put(doc);
                let kind = if previous.is_some() {
                    OperationKind::Update
                } else {
                    OperationKind::Insert
                };
                c.emit(&key, kind);
                previous
            })
        })
    }

    fn upsert_batch<'a>(&'a self, collection: &'a str, docs: Vec<Document>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.with_collection("upsert_batch", collection, |c| {
                for doc in docs {
                    let key = doc.key.clone();
                    let kind = if c.put(doc).is_some() {
                        OperationKind::Update
                    } else {
                        OperationKind::Insert
                    };
                    c.emit(&key, kind);
                }
            })
        })
    }

    fn conditional_update<'a>(
        &'a self,
        collection: &'a str,
        key: &'a str,
        precondition: &'a Precondition,
        update: &'a Update,
    ) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            self.with_collection("conditional_update", collection, |c| {
                let matched = c.docs.get(key).is_some_and(|d| precondition.matches(d));
                if !matched {
                    return 0;
                }
                if let Some(at) = update.expire_at {
                    c.set_expire_at(key, at);
                }
                c.emit(key, OperationKind::Update);
                1
            })
        })
    }

    fn get<'a>(&'a self, collection: &'a str, key: &'a str) -> BoxFuture<'a, Option<Document>> {
        Box::pin(async move { self.with_existing("get", collection, None, |c| c.docs.get(key).cloned()) })
    }

    fn find_one<'a>(&'a self, collection: &'a str, filter: &'a Filter, order: SortOrder) -> BoxFuture<'a, Option<Document>> {
        Box::pin(async move {
            self.with_existing("find_one", collection, None, |c| c.matching(filter, order).next().cloned())
        })
    }

    fn scan<'a>(
        &'a self,
        collection: &'a str,
        filter: &'a Filter,
        order: SortOrder,
        limit: usize,
    ) -> BoxFuture<'a, Vec<Document>> {
        Box::pin(async move {
            self.with_existing("scan", collection, Vec::new(), |c| {
                c.matching(filter, order).take(limit).cloned().collect()
            })
        })
    }

    fn count<'a>(&'a self, collection: &'a str, filter: &'a Filter) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            self.with_existing("count", collection, 0, |c| {
                c.matching(filter, SortOrder::Ascending).count() as u64
            })
        })
    }

    fn delete_one<'a>(
        &'a self,
        collection: &'a str,
        key: &'a str,
        precondition: &'a Precondition,
    ) -> BoxFuture<'a, Option<Document>> {
        Box::pin(async move {
            self.with_existing("delete", collection, None, |c| {
                if !c.docs.get(key).is_some_and(|d| precondition.matches(d)) {
                    return None;
                }
                let removed = c.remove(key);
                c.emit(key, OperationKind::Delete);
                removed
            })
        })
    }

    fn delete_many<'a>(&'a self, collection: &'a str, filter: &'a Filter) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            self.with_existing("delete_many", collection, 0, |c| {
                let keys: Vec<String> = c
                    .matching(filter, SortOrder::Ascending)
                    .map(|d| d.key.clone())
                    .collect();
                for key in &keys {
                    c.remove(key);
                    c.emit(key, OperationKind::Delete);
                }
                keys.len() as u64
            })
        })
    }

    fn watch<'a>(&'a self, collection: &'a str, kind: OperationKind) -> BoxFuture<'a, ChangeStream> {
        Box::pin(async move {
            let rx = self.with_collection("watch", collection, |c| c.changes.subscribe())?;
            let name = collection.to_string();
            let stream = futures::stream::unfold(rx, move |mut rx| {
                let name = name.clone();
                async move {
                    loop {
                        match rx.recv().await {
                            Ok(event) if event.kind == kind => return Some((Ok(event), rx)),
                            Ok(_) => continue,
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                let err = CoordinationError::ChangeFeed(format!(
                                    "subscriber on '{}' lagged, {} events missed",
                                    name, missed
                                ));
                                return Some((Err(err), rx));
                            }
                            Err(broadcast::error::RecvError::Closed) => return None,
                        }
                    }
                }
            });
            Ok(Box::pin(stream) as ChangeStream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::KeyRange;
    use futures::StreamExt;

    fn doc(key: &str) -> Document {
        Document::new(key, key.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_insert_if_absent_rejects_duplicate() {
        let store = MemoryStore::new();
        assert_eq!(store.insert_if_absent("c", doc("a")).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert_if_absent("c", doc("a")).await.unwrap(), InsertOutcome::DuplicateKey);
        // Collections are independent.
        assert_eq!(store.insert_if_absent("d", doc("a")).await.unwrap(), InsertOutcome::Inserted);
    }

    #[tokio::test]
    async fn test_expired_document_is_absent_and_replaceable() {
        let store = MemoryStore::new();
        let expired = doc("lock").with_owner("a").with_expire_at(now_millis() - 1);
        store.insert_if_absent("c", expired).await.unwrap();

        assert!(store.get("c", "lock").await.unwrap().is_none());
        let fresh = doc("lock").with_owner("b");
        assert_eq!(store.insert_if_absent("c", fresh).await.unwrap(), InsertOutcome::Inserted);
    }

    #[tokio::test]
    async fn test_insert_batch_is_all_or_nothing() {
        let store = MemoryStore::new();
        store.insert_if_absent("c", doc("b")).await.unwrap();

        let outcome = store
            .insert_batch("c", vec![doc("a"), doc("b"), doc("c")])
            .await
            .unwrap();
        assert_eq!(outcome, InsertOutcome::DuplicateKey);
        assert_eq!(store.count("c", &Filter::all()).await.unwrap(), 1);

        let outcome = store.insert_batch("c", vec![doc("a"), doc("c")]).await.unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted);
        assert_eq!(store.count("c", &Filter::all()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_insert_batch_rejects_repeated_key() {
        let store = MemoryStore::new();
        let outcome = store.insert_batch("c", vec![doc("a"), doc("a")]).await.unwrap();
        assert_eq!(outcome, InsertOutcome::DuplicateKey);
        assert_eq!(store.count("c", &Filter::all()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_upsert_returns_previous() {
        let store = MemoryStore::new();
        assert!(store.upsert("c", doc("k")).await.unwrap().is_none());
        let previous = store
            .upsert("c", Document::new("k", b"new".to_vec()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(previous.payload, b"k");
        assert_eq!(store.get("c", "k").await.unwrap().unwrap().payload, b"new");
    }

    #[tokio::test]
    async fn test_conditional_update_checks_owner() {
        let store = MemoryStore::new();
        let now = now_millis();
        store
            .insert_if_absent("c", doc("L").with_owner("me").with_expire_at(now + 1_000))
            .await
            .unwrap();

        let theirs = Precondition::OwnerEquals("them".into());
        let mine = Precondition::OwnerEquals("me".into());
        let update = Update::expire_at(now + 60_000);

        assert_eq!(store.conditional_update("c", "L", &theirs, &update).await.unwrap(), 0);
        assert_eq!(store.conditional_update("c", "L", &mine, &update).await.unwrap(), 1);
        assert_eq!(store.get("c", "L").await.unwrap().unwrap().expire_at, Some(now + 60_000));
        assert_eq!(store.conditional_update("c", "missing", &mine, &update).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_renewed_document_does_not_expire_at_old_deadline() {
        let store = MemoryStore::new();
        let now = now_millis();
        store
            .insert_if_absent("c", doc("L").with_owner("me").with_expire_at(now + 30))
            .await
            .unwrap();
        let mine = Precondition::OwnerEquals("me".into());
        store
            .conditional_update("c", "L", &mine, &Update::expire_at(now + 60_000))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.get("c", "L").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_find_one_and_scan_order() {
        let store = MemoryStore::new();
        for key in ["b", "d", "a", "c"] {
            store.insert_if_absent("c", doc(key)).await.unwrap();
        }

        let first = store.find_one("c", &Filter::all(), SortOrder::Ascending).await.unwrap();
        let last = store.find_one("c", &Filter::all(), SortOrder::Descending).await.unwrap();
        assert_eq!(first.unwrap().key, "a");
        assert_eq!(last.unwrap().key, "d");

        let filter = Filter::range(KeyRange::half_open("b", "d"));
        let keys: Vec<String> = store
            .scan("c", &filter, SortOrder::Ascending, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.key)
            .collect();
        assert_eq!(keys, vec!["b", "c"]);

        let limited = store.scan("c", &Filter::all(), SortOrder::Descending, 2).await.unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].key, "d");
    }

    #[tokio::test]
    async fn test_empty_range_does_not_panic() {
        let store = MemoryStore::new();
        store.insert_if_absent("c", doc("a")).await.unwrap();
        let filter = Filter::range(KeyRange::half_open("z", "a"));
        assert_eq!(store.count("c", &filter).await.unwrap(), 0);
        assert!(store.find_one("c", &filter, SortOrder::Ascending).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_one_respects_precondition() {
        let store = MemoryStore::new();
        store.insert_if_absent("c", doc("L").with_owner("me")).await.unwrap();

        let theirs = Precondition::OwnerEquals("them".into());
        assert!(store.delete_one("c", "L", &theirs).await.unwrap().is_none());
        let removed = store.delete_one("c", "L", &Precondition::Always).await.unwrap();
        assert_eq!(removed.unwrap().owner.as_deref(), Some("me"));
        assert!(store.get("c", "L").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_many_by_range() {
        let store = MemoryStore::new();
        for key in ["a", "b", "c", "d"] {
            store.insert_if_absent("c", doc(key)).await.unwrap();
        }
        let removed = store
            .delete_many("c", &Filter::range(KeyRange::half_open("b", "d")))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.count("c", &Filter::all()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_watch_filters_by_kind() {
        let store = MemoryStore::new();
        let mut deletes = store.watch("c", OperationKind::Delete).await.unwrap();

        store.insert_if_absent("c", doc("x")).await.unwrap();
        store.delete_one("c", "x", &Precondition::Always).await.unwrap();

        let event = deletes.next().await.unwrap().unwrap();
        assert_eq!(event, ChangeEvent { key: "x".into(), kind: OperationKind::Delete });
    }

    #[tokio::test]
    async fn test_lazy_expiry_publishes_delete() {
        let store = MemoryStore::new();
        let mut deletes = store.watch("c", OperationKind::Delete).await.unwrap();
        store
            .insert_if_absent("c", doc("L").with_expire_at(now_millis() + 10))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.count("c", &Filter::all()).await.unwrap(), 0);

        let event = deletes.next().await.unwrap().unwrap();
        assert_eq!(event.key, "L");
    }

    #[tokio::test]
    async fn test_expiry_sweep_purges_untouched_documents() {
        let store = MemoryStore::with_expiry_sweep(Duration::from_millis(10));
        let mut deletes = store.watch("c", OperationKind::Delete).await.unwrap();
        store
            .insert_if_absent("c", doc("L").with_expire_at(now_millis() + 20))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), deletes.next())
            .await
            .expect("sweeper should purge the document")
            .unwrap()
            .unwrap();
        assert_eq!(event.key, "L");
    }

    #[tokio::test]
    async fn test_drop_collection_ends_watch() {
        let store = MemoryStore::new();
        let mut inserts = store.watch("c", OperationKind::Insert).await.unwrap();
        store.insert_if_absent("c", doc("a")).await.unwrap();

        assert!(store.drop_collection("c"));
        assert!(inserts.next().await.unwrap().is_ok());
        assert!(inserts.next().await.is_none());
        assert!(store.get("c", "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_failures_are_retryable() {
        let store = MemoryStore::new();
        store.fail_next_operations(2);

        assert!(store.get("c", "a").await.unwrap_err().is_retryable());
        assert!(store.insert_if_absent("c", doc("a")).await.unwrap_err().is_retryable());
        assert_eq!(store.insert_if_absent("c", doc("a")).await.unwrap(), InsertOutcome::Inserted);
    }

    #[tokio::test]
    async fn test_reads_do_not_materialize_collections() {
        let store = MemoryStore::new();
        let all = Filter::all();

        assert!(store.get("ghost", "a").await.unwrap().is_none());
        assert!(store.find_one("ghost", &all, SortOrder::Ascending).await.unwrap().is_none());
        assert!(store.scan("ghost", &all, SortOrder::Ascending, 10).await.unwrap().is_empty());
        assert_eq!(store.count("ghost", &all).await.unwrap(), 0);
        assert!(store.delete_one("ghost", "a", &Precondition::Always).await.unwrap().is_none());
        assert_eq!(store.delete_many("ghost", &all).await.unwrap(), 0);

        assert!(store.collections.lock().unwrap().is_empty());
        assert!(!store.drop_collection("ghost"));
    }

    #[tokio::test]
    async fn test_sweep_skips_stale_expiry_entries() {
        let store = MemoryStore::new();
        let now = now_millis();
        store
            .insert_if_absent("c", doc("L").with_expire_at(now - 10))
            .await
            .unwrap();
        // Index entry left pointing at a deadline the document no longer has.
        store
            .collections
            .lock()
            .unwrap()
            .get_mut("c")
            .unwrap()
            .docs
            .get_mut("L")
            .unwrap()
            .expire_at = Some(now + 60_000);

        assert_eq!(store.sweep_expired(), 0);
        assert!(store.get("c", "L").await.unwrap().is_some());
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sorted map and set views over one collection.
//!
//! Keys are the store's own lexicographic order. Every operation is a single
//! document read or write; there is no cross-key atomicity and concurrent
//! `put`s to one key are last-write-wins.
//!
//! # Views and Bounds
//!
//! `sub_map`/`head_map`/`tail_map` (and the set equivalents) return views
//! over a narrower [`KeyRange`]. Writes outside a view's range fail with
//! [`CoordinationError::OutOfRange`]; reads outside it behave as absent.
//! A view can only be narrowed within its own range.
//!
//! # Iteration
//!
//! Iterators are watermark scans: each `next()` asks the store for the
//! smallest key strictly above the last one returned. They are live, never
//! revisit a key, and may observe concurrent writes ahead of the watermark.

pub mod iter;
pub mod map;
pub mod set;

pub use iter::{EntryIter, KeyIter, ValueIter};
pub use map::{EntrySet, KeySet, SortedMap, Values};
pub use set::SortedSet;

use crate::error::{CoordinationError, Result};
use crate::store::{require_non_empty, Document, Filter, KeyRange, SortOrder, StoreRef};
use std::ops::Bound;

/// Page size for `put_all` batched upserts.
pub const PUT_ALL_BATCH: usize = 100;

/// A collection plus the key range a view is restricted to.
#[derive(Clone)]
pub(crate) struct ViewScope {
    store: StoreRef,
    collection: String,
    range: KeyRange,
}

impl ViewScope {
    pub(crate) fn new(store: StoreRef, collection: impl Into<String>) -> Result<Self> {
        let collection = collection.into();
        require_non_empty("collection name", &collection)?;
        Ok(Self {
            store,
            collection,
            range: KeyRange::all(),
        })
    }

    pub(crate) fn store(&self) -> &StoreRef {
        &self.store
    }

    pub(crate) fn collection(&self) -> &str {
        &self.collection
    }

    pub(crate) fn range(&self) -> &KeyRange {
        &self.range
    }

    pub(crate) fn filter(&self) -> Filter {
        Filter::range(self.range.clone())
    }

    /// Reads: keys outside the range are simply absent.
    pub(crate) fn covers(&self, key: &str) -> bool {
        self.range.contains(key)
    }

    /// Writes: reject empty and out-of-range keys.
    pub(crate) fn check_write(&self, key: &str) -> Result<()> {
        require_non_empty("key", key)?;
        if !self.range.contains(key) {
            return Err(CoordinationError::OutOfRange { key: key.to_string() });
        }
        Ok(())
    }

    /// `[from, to)`.
    pub(crate) fn sub(&self, from: &str, to: &str) -> Result<Self> {
        if from > to {
            return Err(CoordinationError::InvalidArgument(format!(
                "range start '{}' is after end '{}'",
                from, to
            )));
        }
        self.narrow(KeyRange::half_open(from, to))
    }

    /// Keys strictly below `to`.
    pub(crate) fn head(&self, to: &str) -> Result<Self> {
        self.narrow(KeyRange::new(self.range.lower.clone(), Bound::Excluded(to.to_string())))
    }

    /// Keys at or above `from`.
    pub(crate) fn tail(&self, from: &str) -> Result<Self> {
        self.narrow(KeyRange::new(Bound::Included(from.to_string()), self.range.upper.clone()))
    }

    fn narrow(&self, range: KeyRange) -> Result<Self> {
        if !range.is_within(&self.range) {
            let key = bound_key(&range.lower)
                .filter(|k| !self.range.contains(k))
                .or_else(|| bound_key(&range.upper))
                .unwrap_or_default();
            return Err(CoordinationError::OutOfRange { key });
        }
        Ok(Self {
            store: self.store.clone(),
            collection: self.collection.clone(),
            range,
        })
    }

    pub(crate) async fn get(&self, key: &str) -> Result<Option<Document>> {
        if !self.covers(key) {
            return Ok(None);
        }
        self.store.get(&self.collection, key).await
    }

    pub(crate) async fn edge(&self, order: SortOrder) -> Result<Option<Document>> {
        if self.range.is_empty() {
            return Ok(None);
        }
        self.store.find_one(&self.collection, &self.filter(), order).await
    }

    pub(crate) async fn find_hash(&self, hash: String) -> Result<Option<Document>> {
        if self.range.is_empty() {
            return Ok(None);
        }
        let filter = self.filter().with_hash(hash);
        self.store.find_one(&self.collection, &filter, SortOrder::Ascending).await
    }

    pub(crate) async fn count(&self) -> Result<u64> {
        if self.range.is_empty() {
            return Ok(0);
        }
        self.store.count(&self.collection, &self.filter()).await
    }

    pub(crate) async fn clear(&self) -> Result<u64> {
        if self.range.is_empty() {
            return Ok(0);
        }
        self.store.delete_many(&self.collection, &self.filter()).await
    }
}

impl std::fmt::Debug for ViewScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewScope")
            .field("backend", &self.store.backend())
            .field("collection", &self.collection)
            .field("range", &self.range)
            .finish()
    }
}

fn bound_key(bound: &Bound<String>) -> Option<String> {
    match bound {
        Bound::Included(k) | Bound::Excluded(k) => Some(k.clone()),
        Bound::Unbounded => None,
    }
}

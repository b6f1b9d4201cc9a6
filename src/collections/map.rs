// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sorted map over string keys and its live views.

use super::iter::{EntryIter, KeyIter, ValueIter};
use super::{ViewScope, PUT_ALL_BATCH};
use crate::codec::{Codec, JsonCodec};
use crate::error::Result;
use crate::metrics;
use crate::store::{Document, InsertOutcome, Precondition, SortOrder, StoreRef};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::trace;

/// A map from string keys to `V`, sorted by key.
///
/// Cloning is cheap and yields a handle on the same view.
pub struct SortedMap<V, C = JsonCodec<V>> {
    scope: ViewScope,
    codec: Arc<C>,
    _marker: PhantomData<fn() -> V>,
}

impl<V, C> Clone for SortedMap<V, C> {
    fn clone(&self) -> Self {
        Self {
            scope: self.scope.clone(),
            codec: Arc::clone(&self.codec),
            _marker: PhantomData,
        }
    }
}

impl<V> SortedMap<V, JsonCodec<V>>
where
    V: Serialize + DeserializeOwned,
{
    pub fn new(store: StoreRef, collection: impl Into<String>) -> Result<Self> {
        Self::with_codec(store, collection, JsonCodec::new())
    }
}

impl<V, C> SortedMap<V, C>
where
    C: Codec<V>,
{
    pub fn with_codec(store: StoreRef, collection: impl Into<String>, codec: C) -> Result<Self> {
        Ok(Self {
            scope: ViewScope::new(store, collection)?,
            codec: Arc::new(codec),
            _marker: PhantomData,
        })
    }

    pub fn collection(&self) -> &str {
        self.scope.collection()
    }

    fn narrowed(&self, scope: ViewScope) -> Self {
        Self {
            scope,
            codec: Arc::clone(&self.codec),
            _marker: PhantomData,
        }
    }

    fn record(&self, operation: &str) {
        metrics::record_map_operation(self.scope.collection(), operation);
    }

    fn decode(&self, doc: Option<Document>) -> Result<Option<V>> {
        doc.map(|d| self.codec.decode(&d.payload)).transpose()
    }

    fn decode_entry(&self, doc: Option<Document>) -> Result<Option<(String, V)>> {
        doc.map(|d| -> Result<(String, V)> {
            let value = self.codec.decode(&d.payload)?;
            Ok((d.key, value))
        })
        .transpose()
    }

    fn to_document(&self, key: &str, value: &V) -> Result<Document> {
        let encoded = self.codec.encode(value)?;
        Ok(Document::new(key, encoded.bytes).with_hash(encoded.hash))
    }

    // =========================================================================
    // Point operations
    // =========================================================================

    pub async fn get(&self, key: &str) -> Result<Option<V>> {
        self.record("get");
        let doc = self.scope.get(key).await?;
        self.decode(doc)
    }

    /// Store `value` under `key`, returning the previous value.
    pub async fn put(&self, key: &str, value: &V) -> Result<Option<V>> {
        self.scope.check_write(key)?;
        self.record("put");
        let doc = self.to_document(key, value)?;
        let previous = self.scope.store().upsert(self.scope.collection(), doc).await?;
        trace!(collection = %self.scope.collection(), key, replaced = previous.is_some(), "Put entry");
        self.decode(previous)
    }

    /// Store `value` only if `key` is absent; returns the existing value otherwise.
    pub async fn put_if_absent(&self, key: &str, value: &V) -> Result<Option<V>> {
        self.scope.check_write(key)?;
        self.record("put_if_absent");
        let doc = self.to_document(key, value)?;
        loop {
            match self
                .scope
                .store()
                .insert_if_absent(self.scope.collection(), doc.clone())
                .await?
            {
                InsertOutcome::Inserted => return Ok(None),
                InsertOutcome::DuplicateKey => {
                    // Removed again between the insert and this read: try once more.
                    if let Some(existing) = self.scope.get(key).await? {
                        return self.decode(Some(existing));
                    }
                }
            }
        }
    }

    /// Store every entry, `PUT_ALL_BATCH` per atomic upsert.
    ///
    /// Keys are checked and values encoded before anything is written.
    pub async fn put_all(&self, entries: &[(String, V)]) -> Result<()> {
        let docs = entries
            .iter()
            .map(|(key, value)| {
                self.scope.check_write(key)?;
                self.to_document(key, value)
            })
            .collect::<Result<Vec<_>>>()?;
        self.record("put_all");

        for batch in docs.chunks(PUT_ALL_BATCH) {
            self.scope
                .store()
                .upsert_batch(self.scope.collection(), batch.to_vec())
                .await?;
        }
        Ok(())
    }

    /// Remove `key`, returning its value.
    pub async fn remove(&self, key: &str) -> Result<Option<V>> {
        self.scope.check_write(key)?;
        self.record("remove");
        let removed = self
            .scope
            .store()
            .delete_one(self.scope.collection(), key, &Precondition::Always)
            .await?;
        self.decode(removed)
    }

    pub async fn contains_key(&self, key: &str) -> Result<bool> {
        self.record("contains_key");
        Ok(self.scope.get(key).await?.is_some())
    }

    /// Whether any entry in this view holds a value equal to `value`.
    pub async fn contains_value(&self, value: &V) -> Result<bool> {
        self.record("contains_value");
        let hash = self.codec.encode(value)?.hash;
        Ok(self.scope.find_hash(hash).await?.is_some())
    }

    pub async fn len(&self) -> Result<u64> {
        self.record("len");
        self.scope.count().await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.first_key().await?.is_none())
    }

    pub async fn first_key(&self) -> Result<Option<String>> {
        Ok(self.scope.edge(SortOrder::Ascending).await?.map(|d| d.key))
    }

    pub async fn last_key(&self) -> Result<Option<String>> {
        Ok(self.scope.edge(SortOrder::Descending).await?.map(|d| d.key))
    }

    pub async fn first_entry(&self) -> Result<Option<(String, V)>> {
        let doc = self.scope.edge(SortOrder::Ascending).await?;
        self.decode_entry(doc)
    }

    pub async fn last_entry(&self) -> Result<Option<(String, V)>> {
        let doc = self.scope.edge(SortOrder::Descending).await?;
        self.decode_entry(doc)
    }

    /// Remove every entry in this view; returns how many.
    pub async fn clear(&self) -> Result<u64> {
        self.record("clear");
        self.scope.clear().await
    }

    // =========================================================================
    // Range views
    // =========================================================================

    /// Keys in `[from, to)`.
    pub fn sub_map(&self, from: &str, to: &str) -> Result<Self> {
        Ok(self.narrowed(self.scope.sub(from, to)?))
    }

    /// Keys strictly below `to`.
    pub fn head_map(&self, to: &str) -> Result<Self> {
        Ok(self.narrowed(self.scope.head(to)?))
    }

    /// Keys at or above `from`.
    pub fn tail_map(&self, from: &str) -> Result<Self> {
        Ok(self.narrowed(self.scope.tail(from)?))
    }

    pub fn key_set(&self) -> KeySet {
        KeySet::new(self.scope.clone())
    }

    pub fn values(&self) -> Values<V, C> {
        Values {
            scope: self.scope.clone(),
            codec: Arc::clone(&self.codec),
            _marker: PhantomData,
        }
    }

    pub fn entry_set(&self) -> EntrySet<V, C> {
        EntrySet {
            scope: self.scope.clone(),
            codec: Arc::clone(&self.codec),
            _marker: PhantomData,
        }
    }
}

impl<V, C> std::fmt::Debug for SortedMap<V, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SortedMap").field("scope", &self.scope).finish()
    }
}

// =============================================================================
// Views
// =============================================================================

/// Live view of a map's keys. Also the backing of [`SortedSet`](super::SortedSet).
#[derive(Debug, Clone)]
pub struct KeySet {
    scope: ViewScope,
}

impl KeySet {
    pub(crate) fn new(scope: ViewScope) -> Self {
        Self { scope }
    }

    pub(crate) fn scope(&self) -> &ViewScope {
        &self.scope
    }

    pub fn iter(&self) -> KeyIter {
        KeyIter::new(self.scope.clone())
    }

    pub async fn len(&self) -> Result<u64> {
        self.scope.count().await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.first().await?.is_none())
    }

    pub async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.scope.get(key).await?.is_some())
    }

    /// Remove `key`; returns whether it was present.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        self.scope.check_write(key)?;
        metrics::record_map_operation(self.scope.collection(), "remove");
        let removed = self
            .scope
            .store()
            .delete_one(self.scope.collection(), key, &Precondition::Always)
            .await?;
        Ok(removed.is_some())
    }

    pub async fn first(&self) -> Result<Option<String>> {
        Ok(self.scope.edge(SortOrder::Ascending).await?.map(|d| d.key))
    }

    pub async fn last(&self) -> Result<Option<String>> {
        Ok(self.scope.edge(SortOrder::Descending).await?.map(|d| d.key))
    }

    pub fn sub_set(&self, from: &str, to: &str) -> Result<Self> {
        Ok(Self::new(self.scope.sub(from, to)?))
    }

    pub fn head_set(&self, to: &str) -> Result<Self> {
        Ok(Self::new(self.scope.head(to)?))
    }

    pub fn tail_set(&self, from: &str) -> Result<Self> {
        Ok(Self::new(self.scope.tail(from)?))
    }
}

/// Live view of a map's values, in key order.
pub struct Values<V, C> {
    scope: ViewScope,
    codec: Arc<C>,
    _marker: PhantomData<fn() -> V>,
}

impl<V, C: Codec<V>> Values<V, C> {
    pub fn iter(&self) -> ValueIter<V, C> {
        ValueIter::new(self.scope.clone(), Arc::clone(&self.codec))
    }

    pub async fn len(&self) -> Result<u64> {
        self.scope.count().await
    }

    pub async fn contains(&self, value: &V) -> Result<bool> {
        let hash = self.codec.encode(value)?.hash;
        Ok(self.scope.find_hash(hash).await?.is_some())
    }

    /// Remove the lowest-keyed entry holding `value`; returns whether one was found.
    pub async fn remove(&self, value: &V) -> Result<bool> {
        let hash = self.codec.encode(value)?.hash;
        let Some(doc) = self.scope.find_hash(hash).await? else {
            return Ok(false);
        };
        metrics::record_map_operation(self.scope.collection(), "remove");
        let removed = self
            .scope
            .store()
            .delete_one(self.scope.collection(), &doc.key, &Precondition::Always)
            .await?;
        Ok(removed.is_some())
    }
}

/// Live view of a map's `(key, value)` pairs.
pub struct EntrySet<V, C> {
    scope: ViewScope,
    codec: Arc<C>,
    _marker: PhantomData<fn() -> V>,
}

impl<V, C: Codec<V>> EntrySet<V, C> {
    pub fn iter(&self) -> EntryIter<V, C> {
        EntryIter::new(self.scope.clone(), Arc::clone(&self.codec))
    }

    pub async fn len(&self) -> Result<u64> {
        self.scope.count().await
    }

    /// Whether `key` currently maps to a value equal to `value`.
    pub async fn contains(&self, key: &str, value: &V) -> Result<bool> {
        let hash = self.codec.encode(value)?.hash;
        Ok(self
            .scope
            .get(key)
            .await?
            .is_some_and(|doc| doc.content_hash.as_deref() == Some(hash.as_str())))
    }

    /// Remove `key` if it currently maps to a value equal to `value`.
    ///
    /// The check and the delete are two store calls; a concurrent `put` in
    /// between can be removed.
    pub async fn remove(&self, key: &str, value: &V) -> Result<bool> {
        self.scope.check_write(key)?;
        if !self.contains(key, value).await? {
            return Ok(false);
        }
        metrics::record_map_operation(self.scope.collection(), "remove");
        let removed = self
            .scope
            .store()
            .delete_one(self.scope.collection(), key, &Precondition::Always)
            .await?;
        Ok(removed.is_some())
    }
}

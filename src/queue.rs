// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Broadcast replay queue.
//!
//! An append-only log in one collection. Every entry's key is its sequence
//! number, zero-padded to [`SEQUENCE_WIDTH`] digits so key order is numeric
//! order. Producers allocate `max + 1` and insert-if-absent; a conflicting
//! producer gets a duplicate key and retries with backoff.
//!
//! Each [`ReplayQueue`] instance has its own in-memory cursor (the highest
//! sequence it consumed, `-1` for none). Consuming never deletes anything,
//! so any number of instances each see every entry once. Only a store TTL
//! (`entry_ttl_sec`) ever removes entries.
//!
//! ```rust,no_run
//! # async fn example(store: coordination_engine::store::StoreRef) -> coordination_engine::Result<()> {
//! use coordination_engine::config::QueueConfig;
//! use coordination_engine::queue::ReplayQueue;
//!
//! let producer = ReplayQueue::<String>::new(store.clone(), "events", QueueConfig::default())?;
//! let consumer = ReplayQueue::<String>::new(store, "events", QueueConfig::default())?;
//!
//! producer.offer(&"A".to_string()).await?;
//! assert_eq!(consumer.poll().await?, Some("A".to_string()));
//! # Ok(())
//! # }
//! ```

use crate::codec::{Codec, Encoded, JsonCodec};
use crate::config::{QueueConfig, WatcherConfig};
use crate::error::{CoordinationError, Result};
use crate::metrics;
use crate::resilience::execute_with_retry;
use crate::store::{
    now_millis, require_non_empty, Document, Filter, InsertOutcome, KeyRange, OperationKind, SortOrder, StoreRef,
};
use crate::watcher::{ChangeWatcher, WaitOutcome};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::ops::Bound;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Digits in a sequence key.
pub const SEQUENCE_WIDTH: usize = 20;

/// Cursor value meaning nothing consumed yet.
pub const CURSOR_START: i64 = -1;

/// Fixed-width key for a sequence number.
pub fn sequence_key(sequence: i64) -> String {
    format!("{:0width$}", sequence.max(0), width = SEQUENCE_WIDTH)
}

/// Parse a sequence key. `None` unless it is exactly [`SEQUENCE_WIDTH`]
/// ASCII digits.
pub fn parse_sequence_key(key: &str) -> Option<i64> {
    if key.len() != SEQUENCE_WIDTH || !key.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    key.parse().ok()
}

/// The whole sequence key space.
fn sequence_space() -> KeyRange {
    KeyRange::new(
        Bound::Included(sequence_key(0)),
        Bound::Included("9".repeat(SEQUENCE_WIDTH)),
    )
}

/// Entries strictly after `cursor`.
fn after_cursor(cursor: i64) -> KeyRange {
    if cursor < 0 {
        sequence_space()
    } else {
        sequence_space().after(&sequence_key(cursor))
    }
}

/// Append-only log with a private read cursor.
pub struct ReplayQueue<T, C = JsonCodec<T>> {
    name: String,
    store: StoreRef,
    codec: C,
    config: QueueConfig,
    watcher: ChangeWatcher,
    cursor: AtomicI64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ReplayQueue<T, JsonCodec<T>>
where
    T: Serialize + DeserializeOwned,
{
    /// Queue over collection `name` with the JSON codec.
    pub fn new(store: StoreRef, name: impl Into<String>, config: QueueConfig) -> Result<Self> {
        Self::with_codec(store, name, config, WatcherConfig::default(), JsonCodec::new())
    }
}

impl<T, C> ReplayQueue<T, C>
where
    C: Codec<T>,
{
    pub fn with_codec(
        store: StoreRef,
        name: impl Into<String>,
        config: QueueConfig,
        watcher_config: WatcherConfig,
        codec: C,
    ) -> Result<Self> {
        let name = name.into();
        require_non_empty("queue name", &name)?;
        config.validate()?;
        watcher_config.validate()?;
        let watcher = ChangeWatcher::new(Arc::clone(&store), name.clone(), OperationKind::Insert, watcher_config);
        Ok(Self {
            name,
            store,
            codec,
            config,
            watcher,
            cursor: AtomicI64::new(CURSOR_START),
            _marker: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn watcher(&self) -> &ChangeWatcher {
        &self.watcher
    }

    /// Highest sequence consumed by this instance (`-1` for none).
    pub fn cursor(&self) -> i64 {
        self.cursor.load(Ordering::Acquire)
    }

    // =========================================================================
    // Producing
    // =========================================================================

    /// Append `item`. Never rejects: returns `true` or an error.
    pub async fn offer(&self, item: &T) -> Result<bool> {
        let encoded = self.codec.encode(item)?;
        let sequence = self.append(std::slice::from_ref(&encoded)).await?;
        metrics::record_queue_offer(&self.name, 1);
        trace!(queue = %self.name, sequence, "Offered item");
        Ok(true)
    }

    /// Same as [`offer`](Self::offer).
    pub async fn add(&self, item: &T) -> Result<bool> {
        self.offer(item).await
    }

    /// Append every item in order, `batch_size` per atomic insert.
    ///
    /// All items are encoded before anything is written.
    pub async fn add_all(&self, items: &[T]) -> Result<bool> {
        let encoded = items
            .iter()
            .map(|item| self.codec.encode(item))
            .collect::<Result<Vec<_>>>()?;

        for batch in encoded.chunks(self.config.batch_size) {
            let last = self.append(batch).await?;
            metrics::record_queue_batch(&self.name, batch.len());
            trace!(queue = %self.name, size = batch.len(), last_sequence = last, "Appended batch");
        }
        metrics::record_queue_offer(&self.name, items.len());
        Ok(true)
    }

    /// Allocate consecutive sequences for `batch` and insert it. Returns the
    /// last sequence written.
    async fn append(&self, batch: &[Encoded]) -> Result<i64> {
        if batch.is_empty() {
            return self.max_sequence().await;
        }
        let retry = self.config.allocation_retry();
        execute_with_retry("queue_append", &retry, || async move { self.try_append(batch).await }).await
    }

    async fn try_append(&self, batch: &[Encoded]) -> Result<i64> {
        let first = self.max_sequence().await? + 1;
        let now = now_millis();
        let expire_at = self
            .config
            .entry_ttl()
            .map(|ttl| now.saturating_add(ttl.as_millis() as i64));

        let docs = batch
            .iter()
            .enumerate()
            .map(|(offset, encoded)| {
                let mut doc = Document::new(sequence_key(first + offset as i64), encoded.bytes.clone())
                    .with_hash(encoded.hash.clone());
                doc.created_at = now;
                doc.expire_at = expire_at;
                doc
            })
            .collect();

        match self.store.insert_batch(&self.name, docs).await? {
            InsertOutcome::Inserted => Ok(first + batch.len() as i64 - 1),
            InsertOutcome::DuplicateKey => {
                metrics::record_queue_allocation_conflict(&self.name);
                debug!(queue = %self.name, sequence = first, "Sequence allocation conflict");
                Err(CoordinationError::store(
                    "queue_append",
                    format!("sequence {} already allocated", first),
                ))
            }
        }
    }

    /// Current highest sequence in the log (`-1` when empty).
    pub async fn max_sequence(&self) -> Result<i64> {
        let filter = Filter::range(sequence_space());
        match self.store.find_one(&self.name, &filter, SortOrder::Descending).await? {
            Some(doc) => self.sequence_of(&doc),
            None => Ok(CURSOR_START),
        }
    }

    fn sequence_of(&self, doc: &Document) -> Result<i64> {
        parse_sequence_key(&doc.key).ok_or_else(|| {
            CoordinationError::Internal(format!("queue '{}' holds non-sequence key '{}'", self.name, doc.key))
        })
    }

    // =========================================================================
    // Consuming
    // =========================================================================

    /// Next entry after the cursor, advancing the cursor. Never blocks.
    ///
    /// An entry that fails to decode still advances the cursor, then the
    /// decode error is returned.
    pub async fn poll(&self) -> Result<Option<T>> {
        loop {
            let cursor = self.cursor();
            let Some(doc) = self.next_after(cursor).await? else {
                metrics::record_queue_poll(&self.name, false);
                return Ok(None);
            };
            let sequence = self.sequence_of(&doc)?;

            // Another task on this instance may have consumed it first.
            if self
                .cursor
                .compare_exchange(cursor, sequence, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            metrics::record_queue_poll(&self.name, true);
            trace!(queue = %self.name, sequence, "Polled entry");
            return self.decode(&doc).map(Some);
        }
    }

    /// Next entry after the cursor, without advancing.
    pub async fn peek(&self) -> Result<Option<T>> {
        match self.next_after(self.cursor()).await? {
            Some(doc) => self.decode(&doc).map(Some),
            None => Ok(None),
        }
    }

    /// [`poll`](Self::poll), waiting up to `timeout` for an entry.
    pub async fn poll_timeout(&self, timeout: Duration) -> Result<Option<T>> {
        self.poll_until(Some(Instant::now() + timeout)).await
    }

    /// [`poll`](Self::poll), waiting as long as it takes.
    pub async fn take(&self) -> Result<T> {
        match self.poll_until(None).await? {
            Some(item) => Ok(item),
            None => Err(CoordinationError::Internal(format!(
                "unbounded take on '{}' returned without an item",
                self.name
            ))),
        }
    }

    async fn poll_until(&self, deadline: Option<Instant>) -> Result<Option<T>> {
        let slice = self.config.wait_slice();
        loop {
            let waiter = self.watcher.register(None);

            if let Some(item) = self.poll().await? {
                return Ok(Some(item));
            }

            let wait_for = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(None);
                    }
                    remaining.min(slice)
                }
                None => slice,
            };

            if waiter.wait(Some(wait_for)).await == WaitOutcome::Interrupted {
                return Err(CoordinationError::Interrupted);
            }
        }
    }

    /// Entries this instance has not consumed yet.
    pub async fn size(&self) -> Result<u64> {
        let filter = Filter::range(after_cursor(self.cursor()));
        self.store.count(&self.name, &filter).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.next_after(self.cursor()).await?.is_none())
    }

    /// Whether an equal item is still ahead of the cursor.
    pub async fn contains(&self, item: &T) -> Result<bool> {
        let hash = self.codec.encode(item)?.hash;
        let filter = Filter::range(after_cursor(self.cursor())).with_hash(hash);
        Ok(self
            .store
            .find_one(&self.name, &filter, SortOrder::Ascending)
            .await?
            .is_some())
    }

    pub async fn contains_all(&self, items: &[T]) -> Result<bool> {
        for item in items {
            if !self.contains(item).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Skip everything already in the log; only later entries will be seen.
    pub async fn move_pointer_to_end(&self) -> Result<i64> {
        let end = self.max_sequence().await?;
        self.cursor.fetch_max(end, Ordering::AcqRel);
        debug!(queue = %self.name, cursor = end, "Cursor moved to end");
        Ok(end)
    }

    /// Interrupt blocked `poll_timeout`/`take` calls.
    pub fn shutdown(&self) {
        self.watcher.shutdown();
    }

    async fn next_after(&self, cursor: i64) -> Result<Option<Document>> {
        let filter = Filter::range(after_cursor(cursor));
        self.store.find_one(&self.name, &filter, SortOrder::Ascending).await
    }

    fn decode(&self, doc: &Document) -> Result<T> {
        self.codec.decode(&doc.payload).map_err(|e| {
            warn!(queue = %self.name, key = %doc.key, error = %e, "Skipping undecodable entry");
            metrics::record_queue_decode_failure(&self.name);
            e
        })
    }

    // =========================================================================
    // Removal (not offered)
    // =========================================================================
    //
    // Entries belong to every cursor at once; removing one would hide it
    // from consumers that have not read it yet.

    pub async fn remove(&self, _item: &T) -> Result<bool> {
        Err(CoordinationError::Unsupported("remove on a broadcast queue"))
    }

    pub async fn remove_all(&self, _items: &[T]) -> Result<bool> {
        Err(CoordinationError::Unsupported("remove_all on a broadcast queue"))
    }

    pub async fn retain_all(&self, _items: &[T]) -> Result<bool> {
        Err(CoordinationError::Unsupported("retain_all on a broadcast queue"))
    }

    pub async fn clear(&self) -> Result<()> {
        Err(CoordinationError::Unsupported("clear on a broadcast queue"))
    }

    pub async fn drain_to(&self, _sink: &mut Vec<T>) -> Result<usize> {
        Err(CoordinationError::Unsupported("drain_to on a broadcast queue"))
    }
}

impl<T, C> std::fmt::Debug for ReplayQueue<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayQueue")
            .field("name", &self.name)
            .field("cursor", &self.cursor.load(Ordering::Relaxed))
            .finish()
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ordered document store boundary.
//!
//! Every coordination primitive is a client of one shared store whose
//! documents are sorted lexicographically by unique key. The store offers a
//! small set of atomic units (insert-if-absent, all-or-nothing batch insert,
//! owner-conditional update and delete) plus range reads and a change feed.
//!
//! # Expiry
//!
//! A document whose `expire_at` is at or before "now" is logically absent for
//! every operation. Backends purge such documents lazily when an operation
//! meets them (publishing a `Delete` change) and actively from a periodic
//! sweep, so lease liveness never depends on the sweep cadence.
//!
//! # Backends
//!
//! - [`MemoryStore`]: in-process, for tests and single-process embedding
//! - [`RedisStore`]: Lua scripts over hashes, lex-sorted sets and a change stream

pub mod memory;
pub mod redis_store;
pub mod stream;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use crate::error::{CoordinationError, Result};
use futures::Stream;
use std::future::Future;
use std::ops::Bound;
use std::pin::Pin;
use std::sync::Arc;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Stream of change events from [`DocumentStore::watch`].
///
/// An `Err` item means the feed is unreliable from here on; subscribers
/// should resubscribe. The stream ending means the collection went away.
pub type ChangeStream = Pin<Box<dyn Stream<Item = Result<ChangeEvent>> + Send>>;

/// Shared handle to a store.
pub type StoreRef = Arc<dyn DocumentStore>;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A stored document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Unique key; defines sort order.
    pub key: String,
    /// Encoded value (empty for lock records).
    pub payload: Vec<u8>,
    /// Content hash of the uncompressed payload.
    pub content_hash: Option<String>,
    /// Holder token for lock records.
    pub owner: Option<String>,
    /// Expiry deadline in epoch ms.
    pub expire_at: Option<i64>,
    /// Creation time in epoch ms.
    pub created_at: i64,
}

impl Document {
    pub fn new(key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            payload,
            content_hash: None,
            owner: None,
            expire_at: None,
            created_at: now_millis(),
        }
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_expire_at(mut self, expire_at: i64) -> Self {
        self.expire_at = Some(expire_at);
        self
    }

    /// Whether the document is logically gone at `now`.
    pub fn is_expired(&self, now: i64) -> bool {
        self.expire_at.is_some_and(|at| at <= now)
    }
}

/// A contiguous key range with independent lower and upper bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub lower: Bound<String>,
    pub upper: Bound<String>,
}

impl Default for KeyRange {
    fn default() -> Self {
        Self::all()
    }
}

impl KeyRange {
    /// The whole key space.
    pub fn all() -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
        }
    }

    pub fn new(lower: Bound<String>, upper: Bound<String>) -> Self {
        Self { lower, upper }
    }

    /// `[from, to)`, the usual sub-map/sub-set shape.
    pub fn half_open(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(Bound::Included(from.into()), Bound::Excluded(to.into()))
    }

    pub fn contains(&self, key: &str) -> bool {
        let above = match &self.lower {
            Bound::Unbounded => true,
            Bound::Included(l) => key >= l.as_str(),
            Bound::Excluded(l) => key > l.as_str(),
        };
        let below = match &self.upper {
            Bound::Unbounded => true,
            Bound::Included(u) => key <= u.as_str(),
            Bound::Excluded(u) => key < u.as_str(),
        };
        above && below
    }

    /// True when no key can satisfy both bounds.
    ///
    /// `BTreeMap::range` panics on such ranges, so callers check first.
    pub fn is_empty(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Bound::Unbounded, _) | (_, Bound::Unbounded) => false,
            (Bound::Included(l), Bound::Included(u)) => l > u,
            (Bound::Included(l), Bound::Excluded(u))
            | (Bound::Excluded(l), Bound::Included(u))
            | (Bound::Excluded(l), Bound::Excluded(u)) => l >= u,
        }
    }

    /// Whether every key of `self` also lies in `outer`.
    pub fn is_within(&self, outer: &KeyRange) -> bool {
        if self.is_empty() {
            return true;
        }
        let lower_ok = match (&outer.lower, &self.lower) {
            (Bound::Unbounded, _) => true,
            (_, Bound::Unbounded) => false,
            (Bound::Included(o), Bound::Included(s)) | (Bound::Included(o), Bound::Excluded(s)) => s >= o,
            (Bound::Excluded(o), Bound::Excluded(s)) => s >= o,
            (Bound::Excluded(o), Bound::Included(s)) => s > o,
        };
        let upper_ok = match (&outer.upper, &self.upper) {
            (Bound::Unbounded, _) => true,
            (_, Bound::Unbounded) => false,
            (Bound::Included(o), Bound::Included(s)) | (Bound::Included(o), Bound::Excluded(s)) => s <= o,
            (Bound::Excluded(o), Bound::Excluded(s)) => s <= o,
            (Bound::Excluded(o), Bound::Included(s)) => s < o,
        };
        lower_ok && upper_ok
    }

    /// The part of this range strictly above `key` (watermark step).
    pub fn after(&self, key: &str) -> KeyRange {
        let raise = match &self.lower {
            Bound::Unbounded => true,
            Bound::Included(l) => key >= l.as_str(),
            Bound::Excluded(l) => key >= l.as_str(),
        };
        KeyRange {
            lower: if raise {
                Bound::Excluded(key.to_string())
            } else {
                self.lower.clone()
            },
            upper: self.upper.clone(),
        }
    }

    /// Borrowed bounds, for `BTreeMap::range`.
    pub fn as_bounds(&self) -> (Bound<&str>, Bound<&str>) {
        (as_ref_bound(&self.lower), as_ref_bound(&self.upper))
    }
}

fn as_ref_bound(bound: &Bound<String>) -> Bound<&str> {
    match bound {
        Bound::Included(s) => Bound::Included(s.as_str()),
        Bound::Excluded(s) => Bound::Excluded(s.as_str()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// Selection predicate for reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub range: KeyRange,
    /// Only match documents with exactly this content hash.
    pub content_hash: Option<String>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn range(range: KeyRange) -> Self {
        Self {
            range,
            content_hash: None,
        }
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.range.contains(&doc.key)
            && self
                .content_hash
                .as_ref()
                .map_or(true, |h| doc.content_hash.as_ref() == Some(h))
    }
}

/// Key order of results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Guard on owner-conditional writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    Always,
    OwnerEquals(String),
}

impl Precondition {
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Self::Always => true,
            Self::OwnerEquals(owner) => doc.owner.as_deref() == Some(owner.as_str()),
        }
    }

    /// Wire form: empty string means "always".
    pub(crate) fn owner_arg(&self) -> &str {
        match self {
            Self::Always => "",
            Self::OwnerEquals(owner) => owner,
        }
    }
}

/// Fields changed by [`DocumentStore::conditional_update`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Update {
    pub expire_at: Option<i64>,
}

impl Update {
    pub fn expire_at(at: i64) -> Self {
        Self { expire_at: Some(at) }
    }
}

/// Result of an insert that must not overwrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    DuplicateKey,
}

/// Write operation kinds published on the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub(crate) fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "insert" => Some(Self::Insert),
            "update" | "replace" => Some(Self::Update),
            "delete" | "del" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One write observed on a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub key: String,
    pub kind: OperationKind,
}

/// The ordered document store consumed by every coordination primitive.
///
/// All methods take the collection name explicitly so one store handle can
/// back any number of locks, queues and views.
pub trait DocumentStore: Send + Sync + 'static {
    /// Short backend name for logs and metrics.
    fn backend(&self) -> &'static str;

    /// Insert unless a live document with the same key exists.
    fn insert_if_absent<'a>(&'a self, collection: &'a str, doc: Document) -> BoxFuture<'a, InsertOutcome>;

    /// Insert all documents, or none of them if any key is already live.
    fn insert_batch<'a>(&'a self, collection: &'a str, docs: Vec<Document>) -> BoxFuture<'a, InsertOutcome>;

    /// Replace or insert; returns the previous live document.
    fn upsert<'a>(&'a self, collection: &'a str, doc: Document) -> BoxFuture<'a, Option<Document>>;

    /// Replace or insert every document in one atomic unit.
    fn upsert_batch<'a>(&'a self, collection: &'a str, docs: Vec<Document>) -> BoxFuture<'a, ()>;

    /// Apply `update` if the live document satisfies `precondition`.
    /// Returns the number of documents modified (0 or 1).
    fn conditional_update<'a>(
        &'a self,
        collection: &'a str,
        key: &'a str,
        precondition: &'a Precondition,
        update: &'a Update,
    ) -> BoxFuture<'a, u64>;

    /// Point read.
    fn get<'a>(&'a self, collection: &'a str, key: &'a str) -> BoxFuture<'a, Option<Document>>;

    /// First document matching `filter` in `order`.
    fn find_one<'a>(&'a self, collection: &'a str, filter: &'a Filter, order: SortOrder) -> BoxFuture<'a, Option<Document>>;

    /// Up to `limit` documents matching `filter` in `order`.
    fn scan<'a>(
        &'a self,
        collection: &'a str,
        filter: &'a Filter,
        order: SortOrder,
        limit: usize,
    ) -> BoxFuture<'a, Vec<Document>>;

    /// Number of documents matching `filter`.
    fn count<'a>(&'a self, collection: &'a str, filter: &'a Filter) -> BoxFuture<'a, u64>;

    /// Delete the live document if it satisfies `precondition`; returns it.
    fn delete_one<'a>(
        &'a self,
        collection: &'a str,
        key: &'a str,
        precondition: &'a Precondition,
    ) -> BoxFuture<'a, Option<Document>>;

    /// Delete every document matching `filter`; returns how many.
    fn delete_many<'a>(&'a self, collection: &'a str, filter: &'a Filter) -> BoxFuture<'a, u64>;

    /// Subscribe to writes of `kind` made after this call returns.
    fn watch<'a>(&'a self, collection: &'a str, kind: OperationKind) -> BoxFuture<'a, ChangeStream>;
}

/// Reject empty keys and names before they reach the store.
pub(crate) fn require_non_empty(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(CoordinationError::InvalidArgument(format!("{} must not be empty", what)));
    }
    Ok(())
}

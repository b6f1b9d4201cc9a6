// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sorted set of string members.
//!
//! Each member is a document with an empty payload, so a set and a map's
//! [`KeySet`] share one implementation.

use super::iter::KeyIter;
use super::map::KeySet;
use super::ViewScope;
use crate::error::Result;
use crate::metrics;
use crate::store::{Document, InsertOutcome, StoreRef};

#[derive(Debug, Clone)]
pub struct SortedSet {
    members: KeySet,
}

impl SortedSet {
    pub fn new(store: StoreRef, collection: impl Into<String>) -> Result<Self> {
        Ok(Self {
            members: KeySet::new(ViewScope::new(store, collection)?),
        })
    }

    pub fn collection(&self) -> &str {
        self.members.scope().collection()
    }

    /// Add `member`; returns whether it was newly added.
    pub async fn add(&self, member: &str) -> Result<bool> {
        let scope = self.members.scope();
        scope.check_write(member)?;
        metrics::record_map_operation(scope.collection(), "add");
        let outcome = scope
            .store()
            .insert_if_absent(scope.collection(), Document::new(member, Vec::new()))
            .await?;
        Ok(outcome == InsertOutcome::Inserted)
    }

    /// Remove `member`; returns whether it was present.
    pub async fn remove(&self, member: &str) -> Result<bool> {
        self.members.remove(member).await
    }

    pub async fn contains(&self, member: &str) -> Result<bool> {
        self.members.contains(member).await
    }

    pub async fn len(&self) -> Result<u64> {
        self.members.len().await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        self.members.is_empty().await
    }

    pub async fn first(&self) -> Result<Option<String>> {
        self.members.first().await
    }

    pub async fn last(&self) -> Result<Option<String>> {
        self.members.last().await
    }

    pub fn iter(&self) -> KeyIter {
        self.members.iter()
    }

    /// Members in `[from, to)`.
    pub fn sub_set(&self, from: &str, to: &str) -> Result<Self> {
        Ok(Self {
            members: self.members.sub_set(from, to)?,
        })
    }

    pub fn head_set(&self, to: &str) -> Result<Self> {
        Ok(Self {
            members: self.members.head_set(to)?,
        })
    }

    pub fn tail_set(&self, from: &str) -> Result<Self> {
        Ok(Self {
            members: self.members.tail_set(from)?,
        })
    }

    /// Remove every member in this view; returns how many.
    pub async fn clear(&self) -> Result<u64> {
        let scope = self.members.scope();
        metrics::record_map_operation(scope.collection(), "clear");
        scope.clear().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoordinationError;
    use crate::store::MemoryStore;
    use futures::TryStreamExt;
    use std::sync::Arc;

    fn set() -> SortedSet {
        SortedSet::new(Arc::new(MemoryStore::new()), "members").unwrap()
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let s = set();
        assert!(s.add("node-b").await.unwrap());
        assert!(!s.add("node-b").await.unwrap());
        assert_eq!(s.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_members_sorted() {
        let s = set();
        for m in ["c", "a", "b"] {
            s.add(m).await.unwrap();
        }
        let members: Vec<String> = s.iter().into_stream().try_collect().await.unwrap();
        assert_eq!(members, vec!["a", "b", "c"]);
        assert_eq!(s.first().await.unwrap().as_deref(), Some("a"));
        assert_eq!(s.last().await.unwrap().as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn test_remove_and_contains() {
        let s = set();
        s.add("a").await.unwrap();
        assert!(s.contains("a").await.unwrap());
        assert!(s.remove("a").await.unwrap());
        assert!(!s.remove("a").await.unwrap());
        assert!(s.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_bounded_views() {
        let s = set();
        for m in ["a", "b", "c", "d"] {
            s.add(m).await.unwrap();
        }
        let middle = s.sub_set("b", "d").unwrap();
        assert_eq!(middle.len().await.unwrap(), 2);
        assert!(!middle.contains("a").await.unwrap());
        assert!(matches!(middle.add("z").await, Err(CoordinationError::OutOfRange { .. })));
        assert!(matches!(middle.head_set("z"), Err(CoordinationError::OutOfRange { .. })));

        assert_eq!(s.head_set("b").unwrap().len().await.unwrap(), 1);
        assert_eq!(s.tail_set("c").unwrap().clear().await.unwrap(), 2);
        assert_eq!(s.len().await.unwrap(), 2);
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Watermark iterators for the sorted views.

use super::ViewScope;
use crate::codec::Codec;
use crate::error::{CoordinationError, Result};
use crate::metrics;
use crate::store::{Document, Filter, Precondition, SortOrder};
use futures::Stream;
use std::marker::PhantomData;
use std::sync::Arc;

/// Forward-only scan state shared by every iterator flavour.
struct Watermark {
    scope: ViewScope,
    watermark: Option<String>,
    last_returned: Option<String>,
}

impl Watermark {
    fn new(scope: ViewScope) -> Self {
        Self {
            scope,
            watermark: None,
            last_returned: None,
        }
    }

    async fn advance(&mut self) -> Result<Option<Document>> {
        let range = match &self.watermark {
            Some(mark) => self.scope.range().after(mark),
            None => self.scope.range().clone(),
        };
        if range.is_empty() {
            return Ok(None);
        }

        let next = self
            .scope
            .store()
            .find_one(self.scope.collection(), &Filter::range(range), SortOrder::Ascending)
            .await?;

        if let Some(doc) = &next {
            self.watermark = Some(doc.key.clone());
            self.last_returned = Some(doc.key.clone());
        }
        Ok(next)
    }

    async fn remove(&mut self) -> Result<()> {
        let key = self.last_returned.take().ok_or_else(|| CoordinationError::InvalidState {
            expected: "next() before remove()".into(),
            actual: "no element to remove".into(),
        })?;
        metrics::record_map_operation(self.scope.collection(), "iter_remove");
        self.scope
            .store()
            .delete_one(self.scope.collection(), &key, &Precondition::Always)
            .await?;
        Ok(())
    }
}

/// Iterator over keys (or set members).
pub struct KeyIter {
    cursor: Watermark,
}

impl KeyIter {
    pub(crate) fn new(scope: ViewScope) -> Self {
        Self {
            cursor: Watermark::new(scope),
        }
    }

    pub async fn next(&mut self) -> Result<Option<String>> {
        Ok(self.cursor.advance().await?.map(|doc| doc.key))
    }

    /// Delete the key last returned by [`next`](Self::next).
    pub async fn remove(&mut self) -> Result<()> {
        self.cursor.remove().await
    }

    /// Adapt into a `Stream`, ending at the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<String>> {
        futures::stream::try_unfold(self, |mut iter| async move {
            Ok(iter.next().await?.map(|key| (key, iter)))
        })
    }
}

/// Iterator over decoded values, in key order.
pub struct ValueIter<V, C> {
    cursor: Watermark,
    codec: Arc<C>,
    _marker: PhantomData<fn() -> V>,
}

impl<V, C: Codec<V>> ValueIter<V, C> {
    pub(crate) fn new(scope: ViewScope, codec: Arc<C>) -> Self {
        Self {
            cursor: Watermark::new(scope),
            codec,
            _marker: PhantomData,
        }
    }

    /// Next value. A value that fails to decode is still passed; the error is
    /// returned once and the following call moves on.
    pub async fn next(&mut self) -> Result<Option<V>> {
        match self.cursor.advance().await? {
            Some(doc) => self.codec.decode(&doc.payload).map(Some),
            None => Ok(None),
        }
    }

    pub async fn remove(&mut self) -> Result<()> {
        self.cursor.remove().await
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<V>> {
        futures::stream::try_unfold(self, |mut iter| async move {
            Ok(iter.next().await?.map(|value| (value, iter)))
        })
    }
}

/// Iterator over `(key, value)` pairs.
pub struct EntryIter<V, C> {
    cursor: Watermark,
    codec: Arc<C>,
    _marker: PhantomData<fn() -> V>,
}

impl<V, C: Codec<V>> EntryIter<V, C> {
    pub(crate) fn new(scope: ViewScope, codec: Arc<C>) -> Self {
        Self {
            cursor: Watermark::new(scope),
            codec,
            _marker: PhantomData,
        }
    }

    pub async fn next(&mut self) -> Result<Option<(String, V)>> {
        match self.cursor.advance().await? {
            Some(doc) => {
                let value = self.codec.decode(&doc.payload)?;
                Ok(Some((doc.key, value)))
            }
            None => Ok(None),
        }
    }

    pub async fn remove(&mut self) -> Result<()> {
        self.cursor.remove().await
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<(String, V)>> {
        futures::stream::try_unfold(self, |mut iter| async move {
            Ok(iter.next().await?.map(|entry| (entry, iter)))
        })
    }
}

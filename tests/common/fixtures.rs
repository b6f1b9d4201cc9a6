// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Memory-store fixtures.

use coordination_engine::config::{CoordinationConfig, LockConfig, WatcherConfig};
use coordination_engine::lock::LockManager;
use coordination_engine::store::{MemoryStore, StoreRef};
use coordination_engine::Coordinator;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A fresh memory store with no sweeper (lazy expiry only).
pub fn memory_store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new())
}

/// A lock manager with test intervals over `store`.
///
/// Separate managers over one store behave like separate processes.
pub fn lock_manager(store: &Arc<MemoryStore>) -> LockManager {
    let store: StoreRef = store.clone();
    LockManager::with_watcher_config(store, LockConfig::for_testing(), WatcherConfig::for_testing())
        .expect("test lock config is valid")
}

/// A coordinator over `store` with test intervals.
pub fn coordinator(store: &Arc<MemoryStore>) -> Coordinator {
    Coordinator::with_store(CoordinationConfig::for_testing(), store.clone()).expect("test config is valid")
}

pub fn s(v: &str) -> String {
    v.to_string()
}

/// Poll `check` until it returns true or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

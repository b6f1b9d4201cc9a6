// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Coordination facade.
//!
//! Opens the configured [`DocumentStore`](crate::store::DocumentStore) and
//! vends the primitives built on it:
//! - one shared [`LockManager`] (heartbeat task started on first acquisition)
//! - [`ReplayQueue`] instances, each with its own cursor
//! - [`SortedMap`] and [`SortedSet`] views
//!
//! # Lifecycle
//!
//! State is published on a `watch` channel (see [`CoordinatorState`]).
//! [`shutdown()`](Coordinator::shutdown) stops the lock manager's heartbeat
//! and every vended queue's change watcher. Blocked waits return
//! `Interrupted`.

mod types;

pub use types::CoordinatorState;

use crate::codec::JsonCodec;
use crate::collections::{SortedMap, SortedSet};
use crate::config::{CoordinationConfig, StoreConfig};
use crate::error::{CoordinationError, Result};
use crate::lock::LockManager;
use crate::metrics;
use crate::queue::ReplayQueue;
use crate::store::{MemoryStore, RedisStore, StoreRef};
use crate::watcher::WeakChangeWatcher;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Entry point for every coordination primitive.
pub struct Coordinator {
    config: CoordinationConfig,

    /// Shared store handle
    store: StoreRef,

    /// Coordinator state (broadcast to watchers)
    state_tx: watch::Sender<CoordinatorState>,

    /// State receiver (for internal use)
    state_rx: watch::Receiver<CoordinatorState>,

    /// The shared lock manager
    locks: LockManager,

    /// Change watchers of live vended queues, stopped on shutdown
    queue_watchers: Mutex<Vec<WeakChangeWatcher>>,
}

impl Coordinator {
    /// Open the configured backend and start in `Running`.
    pub async fn connect(config: CoordinationConfig) -> Result<Self> {
        config.validate()?;
        info!(backend = backend_name(&config.store), "Opening coordination store");

        let store: StoreRef = match &config.store {
            StoreConfig::Memory { sweep_interval_ms } => {
                if *sweep_interval_ms == 0 {
                    Arc::new(MemoryStore::new())
                } else {
                    MemoryStore::with_expiry_sweep(Duration::from_millis(*sweep_interval_ms))
                }
            }
            StoreConfig::Redis(redis) => RedisStore::connect(redis.clone()).await?,
        };

        Self::with_store(config, store)
    }

    /// Use an already opened store. The store config section is ignored.
    pub fn with_store(config: CoordinationConfig, store: StoreRef) -> Result<Self> {
        config.validate()?;
        let (state_tx, state_rx) = watch::channel(CoordinatorState::Created);
        metrics::set_coordinator_state(CoordinatorState::Created.as_str());

        let locks = LockManager::with_watcher_config(Arc::clone(&store), config.lock.clone(), config.watcher.clone())?;

        let coordinator = Self {
            config,
            store,
            state_tx,
            state_rx,
            locks,
            queue_watchers: Mutex::new(Vec::new()),
        };
        coordinator.set_state(CoordinatorState::Running);
        info!(backend = coordinator.store.backend(), "Coordinator running");
        Ok(coordinator)
    }

    fn set_state(&self, state: CoordinatorState) {
        self.state_tx.send_replace(state);
        metrics::set_coordinator_state(state.as_str());
    }

    /// Get current coordinator state.
    pub fn state(&self) -> CoordinatorState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<CoordinatorState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), CoordinatorState::Running)
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    pub fn store(&self) -> &StoreRef {
        &self.store
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state() {
            CoordinatorState::Running => Ok(()),
            _ => Err(CoordinationError::Shutdown),
        }
    }

    // =========================================================================
    // Vending
    // =========================================================================

    /// The shared lock manager.
    pub fn lock_manager(&self) -> Result<LockManager> {
        self.ensure_running()?;
        Ok(self.locks.clone())
    }

    /// A new queue instance over collection `name`, cursor at the start.
    pub fn queue<T>(&self, name: &str) -> Result<ReplayQueue<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        self.ensure_running()?;
        let queue = ReplayQueue::with_codec(
            Arc::clone(&self.store),
            name,
            self.config.queue.clone(),
            self.config.watcher.clone(),
            JsonCodec::new(),
        )?;

        let mut watchers = self.queue_watchers.lock().unwrap_or_else(PoisonError::into_inner);
        watchers.retain(WeakChangeWatcher::is_live);
        watchers.push(queue.watcher().downgrade());
        debug!(queue = name, tracked = watchers.len(), "Vended queue");
        Ok(queue)
    }

    pub fn sorted_map<V>(&self, name: &str) -> Result<SortedMap<V>>
    where
        V: Serialize + DeserializeOwned,
    {
        self.ensure_running()?;
        SortedMap::new(Arc::clone(&self.store), name)
    }

    pub fn sorted_set(&self, name: &str) -> Result<SortedSet> {
        self.ensure_running()?;
        SortedSet::new(Arc::clone(&self.store), name)
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop every vended component.
    ///
    /// Held locks are abandoned, not released: their records lapse when the
    /// lease runs out. Idempotent.
    pub fn shutdown(&self) {
        let started = self.state_tx.send_if_modified(|state| match state {
            CoordinatorState::ShuttingDown | CoordinatorState::Stopped => false,
            _ => {
                *state = CoordinatorState::ShuttingDown;
                true
            }
        });
        if !started {
            return;
        }
        info!("Shutting down coordinator");
        metrics::set_coordinator_state(CoordinatorState::ShuttingDown.as_str());

        self.locks.shutdown();

        let watchers: Vec<_> = {
            let mut guard = self.queue_watchers.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        let live: Vec<_> = watchers.iter().filter_map(WeakChangeWatcher::upgrade).collect();
        let watcher_count = live.len();
        for watcher in live {
            watcher.shutdown();
        }

        self.set_state(CoordinatorState::Stopped);
        info!(watcher_count, "Coordinator stopped");
    }
}

fn backend_name(config: &StoreConfig) -> &'static str {
    match config {
        StoreConfig::Memory { .. } => "memory",
        StoreConfig::Redis(_) => "redis",
    }
}

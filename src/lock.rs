// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reentrant, lease-based named locks.
//!
//! A lock is held cluster-wide exactly when its record exists in the lock
//! collection. Acquisition is an insert-if-absent of `{key: name, owner,
//! expire_at}`; release deletes the record, which is also what wakes
//! blocked acquirers through the [`ChangeWatcher`].
//!
//! # Leases
//!
//! Records carry a deadline. One heartbeat task per [`LockManager`] pushes
//! the deadline of every held lock forward, conditional on the record still
//! naming our owner. If no record matches, the lease is lost: local
//! bookkeeping is dropped and the loss is logged. The critical section is
//! *not* told; this is a lease, not a fencing protocol.
//!
//! ```text
//! UNLOCKED ──try_lock──→ LOCKED(1) ──try_lock (same owner)──→ LOCKED(n)
//!    ↑                      │                                    │
//!    └──────── unlock ──────┘←──────────── unlock ───────────────┘
//!    ↑
//!    └──── heartbeat finds record gone or stolen (LOST) ── from any LOCKED
//! ```
//!
//! # Owners
//!
//! Reentrancy is scoped to an explicit [`OwnerToken`]. Each successful
//! acquisition returns a [`Lease`], which [`LockManager::unlock`] consumes.

use crate::config::{LockConfig, WatcherConfig};
use crate::error::{CoordinationError, Result};
use crate::metrics;
use crate::store::{now_millis, require_non_empty, Document, InsertOutcome, OperationKind, Precondition, StoreRef, Update};
use crate::watcher::{ChangeWatcher, WaitOutcome};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Identity that scopes lock reentrancy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerToken(String);

impl OwnerToken {
    /// A fresh random owner (UUID v4).
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for OwnerToken {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for OwnerToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for OwnerToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Proof of one (possibly reentrant) acquisition. Give it back to
/// [`LockManager::unlock`].
#[derive(Debug)]
#[must_use = "a lease must be passed to unlock, or the lock stays held"]
pub struct Lease {
    name: String,
    owner: OwnerToken,
    acquisition_id: u64,
}

impl Lease {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> &OwnerToken {
        &self.owner
    }
}

/// Local bookkeeping for one held lock.
#[derive(Debug, Clone)]
struct HeldLock {
    owner: OwnerToken,
    count: usize,
    acquired_at: Instant,
    acquisition_id: u64,
    warned_long_hold: bool,
}

struct LockInner {
    store: StoreRef,
    config: LockConfig,
    held: DashMap<String, HeldLock>,
    watcher: ChangeWatcher,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    next_acquisition: AtomicU64,
    shut_down: AtomicBool,
}

impl LockInner {
    fn publish_held(&self) {
        metrics::set_locks_held(self.held.len());
    }

    fn lease_deadline(&self) -> i64 {
        now_millis().saturating_add(self.config.lease_window().as_millis() as i64)
    }

    /// One renewal round over every held lock.
    async fn renew_all(&self) {
        let start = Instant::now();
        let snapshot: Vec<(String, HeldLock)> = self
            .held
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let deadline = self.lease_deadline();
        let renewals = snapshot.iter().map(|(name, held)| async move {
            let precondition = Precondition::OwnerEquals(held.owner.as_str().to_string());
            let update = Update::expire_at(deadline);
            let result = self
                .store
                .conditional_update(&self.config.collection, name, &precondition, &update)
                .await;
            (name, held, result)
        });
        let results = futures::future::join_all(renewals).await;

        let mut renewed = 0;
        for (name, held, result) in results {
            match result {
                Ok(0) => {
                    let removed = self
                        .held
                        .remove_if(name, |_, h| h.acquisition_id == held.acquisition_id)
                        .is_some();
                    if removed {
                        error!(
                            lock = %name,
                            owner = %held.owner,
                            held_ms = held.acquired_at.elapsed().as_millis() as u64,
                            "Lock lease lost"
                        );
                        metrics::record_lease_lost(name);
                    }
                }
                Ok(_) => {
                    renewed += 1;
                    trace!(lock = %name, expire_at = deadline, "Lease renewed");
                    self.check_hold_time(name, held);
                }
                Err(e) => {
                    warn!(lock = %name, error = %e, "Heartbeat renewal failed, keeping lease");
                    metrics::record_heartbeat_failure(name);
                }
            }
        }

        metrics::record_heartbeat(renewed, start.elapsed());
        self.publish_held();
    }

    fn check_hold_time(&self, name: &str, held: &HeldLock) {
        let Some(limit) = self.config.hold_warning_after() else {
            return;
        };
        if held.warned_long_hold || held.acquired_at.elapsed() < limit {
            return;
        }
        if let Some(mut entry) = self.held.get_mut(name) {
            if entry.acquisition_id == held.acquisition_id && !entry.warned_long_hold {
                entry.warned_long_hold = true;
                warn!(
                    lock = %name,
                    owner = %held.owner,
                    held_ms = held.acquired_at.elapsed().as_millis() as u64,
                    limit_ms = limit.as_millis() as u64,
                    "Lock held longer than configured limit"
                );
                metrics::record_lock_held_too_long(name);
            }
        }
    }

    /// Exit decision for the heartbeat task, made under the heartbeat slot
    /// lock so a concurrent acquisition either sees the task gone or keeps it.
    fn stop_heartbeat_if_idle(&self) -> bool {
        let mut slot = self.heartbeat.lock().unwrap_or_else(PoisonError::into_inner);
        if self.held.is_empty() {
            *slot = None;
            return true;
        }
        false
    }
}

impl Drop for LockInner {
    fn drop(&mut self) {
        let slot = self.heartbeat.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }
}

/// Acquires and releases named leases against the shared store.
///
/// Cheap to clone; clones share bookkeeping and the heartbeat task.
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<LockInner>,
}

impl LockManager {
    /// Create a lock manager. Fails if the lease window does not exceed the
    /// heartbeat interval.
    pub fn new(store: StoreRef, config: LockConfig) -> Result<Self> {
        Self::with_watcher_config(store, config, WatcherConfig::default())
    }

    pub fn with_watcher_config(store: StoreRef, config: LockConfig, watcher_config: WatcherConfig) -> Result<Self> {
        config.validate()?;
        watcher_config.validate()?;
        let watcher = ChangeWatcher::new(Arc::clone(&store), config.collection.clone(), OperationKind::Delete, watcher_config);
        Ok(Self {
            inner: Arc::new(LockInner {
                store,
                config,
                held: DashMap::new(),
                watcher,
                heartbeat: Mutex::new(None),
                next_acquisition: AtomicU64::new(1),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &LockConfig {
        &self.inner.config
    }

    /// Try once to acquire `name` for `owner`, without blocking.
    ///
    /// Returns `Ok(None)` when another owner holds it. Store errors other
    /// than a key conflict are logged and treated as "not acquired".
    pub async fn try_lock(&self, name: &str, owner: &OwnerToken) -> Result<Option<Lease>> {
        require_non_empty("lock name", name)?;
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(CoordinationError::Shutdown);
        }

        if let Some(result) = self.reenter(name, owner) {
            return Ok(result);
        }

        let record = Document::new(name, Vec::new())
            .with_owner(owner.as_str())
            .with_expire_at(self.inner.lease_deadline());

        match self.inner.store.insert_if_absent(&self.inner.config.collection, record).await {
            Ok(InsertOutcome::Inserted) => {
                let acquisition_id = self.inner.next_acquisition.fetch_add(1, Ordering::Relaxed);
                self.inner.held.insert(
                    name.to_string(),
                    HeldLock {
                        owner: owner.clone(),
                        count: 1,
                        acquired_at: Instant::now(),
                        acquisition_id,
                        warned_long_hold: false,
                    },
                );
                self.inner.publish_held();
                self.ensure_heartbeat();
                metrics::record_lock_acquire(name, "acquired");
                debug!(lock = %name, owner = %owner, "Lock acquired");
                Ok(Some(Lease {
                    name: name.to_string(),
                    owner: owner.clone(),
                    acquisition_id,
                }))
            }
            Ok(InsertOutcome::DuplicateKey) => {
                // A concurrent call by the same owner may have just won.
                if let Some(result) = self.reenter(name, owner) {
                    return Ok(result);
                }
                metrics::record_lock_acquire(name, "denied");
                trace!(lock = %name, owner = %owner, "Lock held elsewhere");
                Ok(None)
            }
            Err(e) => {
                error!(lock = %name, owner = %owner, error = %e, "Lock acquisition failed");
                metrics::record_lock_acquire(name, "error");
                Ok(None)
            }
        }
    }

    /// Local fast path. `Some` when bookkeeping decides without the store.
    fn reenter(&self, name: &str, owner: &OwnerToken) -> Option<Option<Lease>> {
        let mut held = self.inner.held.get_mut(name)?;
        if held.owner != *owner {
            metrics::record_lock_acquire(name, "denied");
            return Some(None);
        }
        held.count += 1;
        metrics::record_lock_acquire(name, "reentrant");
        trace!(lock = %name, owner = %owner, count = held.count, "Lock re-entered");
        Some(Some(Lease {
            name: name.to_string(),
            owner: owner.clone(),
            acquisition_id: held.acquisition_id,
        }))
    }

    /// Acquire `name`, waiting up to `timeout` for the current holder to
    /// release it or for its lease to lapse.
    pub async fn try_lock_for(&self, name: &str, owner: &OwnerToken, timeout: Duration) -> Result<Option<Lease>> {
        self.acquire(name, owner, Some(Instant::now() + timeout)).await
    }

    /// Acquire `name`, waiting as long as it takes.
    pub async fn lock(&self, name: &str, owner: &OwnerToken) -> Result<Lease> {
        match self.acquire(name, owner, None).await? {
            Some(lease) => Ok(lease),
            None => Err(CoordinationError::Internal(format!(
                "unbounded acquisition of '{}' returned without a lease",
                name
            ))),
        }
    }

    async fn acquire(&self, name: &str, owner: &OwnerToken, deadline: Option<Instant>) -> Result<Option<Lease>> {
        let started = Instant::now();
        let slice = self.inner.config.wait_slice();

        loop {
            // Register before trying so a release between the attempt and
            // the wait still wakes us.
            let waiter = self.inner.watcher.register(Some(name));

            if let Some(lease) = self.try_lock(name, owner).await? {
                metrics::record_lock_wait(name, started.elapsed(), true);
                return Ok(Some(lease));
            }

            let wait_for = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        metrics::record_lock_wait(name, started.elapsed(), false);
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

    /// Release one level of `lease`. The record is deleted when the
    /// outermost level is released.
    ///
    /// Fails with [`CoordinationError::NotHeld`] if the lease was lost.
    pub async fn unlock(&self, lease: Lease) -> Result<()> {
        let release = match self.inner.held.entry(lease.name.clone()) {
            Entry::Occupied(mut entry)
                if entry.get().owner == lease.owner && entry.get().acquisition_id == lease.acquisition_id =>
            {
                let held = entry.get_mut();
                held.count -= 1;
                if held.count == 0 {
                    entry.remove();
                    true
                } else {
                    trace!(lock = %lease.name, remaining = held.count, "Lock level released");
                    false
                }
            }
            _ => {
                debug!(lock = %lease.name, owner = %lease.owner, "Unlock of a lease no longer held");
                return Err(CoordinationError::NotHeld { name: lease.name });
            }
        };

        if !release {
            return Ok(());
        }

        self.inner.publish_held();
        let precondition = Precondition::OwnerEquals(lease.owner.as_str().to_string());
        let deleted = self
            .inner
            .store
            .delete_one(&self.inner.config.collection, &lease.name, &precondition)
            .await?;

        if deleted.is_some() {
            metrics::record_lock_release(&lease.name);
            debug!(lock = %lease.name, owner = %lease.owner, "Lock released");
            Ok(())
        } else {
            warn!(lock = %lease.name, owner = %lease.owner, "Lock record already gone at release");
            Err(CoordinationError::NotHeld { name: lease.name })
        }
    }

    /// Run `f` under the lock if it is free right now. `Ok(None)` if not.
    pub async fn no_wait_lock_and_execute<F, Fut, T>(&self, name: &str, owner: &OwnerToken, f: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        match self.try_lock(name, owner).await? {
            Some(lease) => Ok(Some(self.execute_with_lease(lease, f).await)),
            None => Ok(None),
        }
    }

    /// Run `f` under the lock, waiting for it as long as it takes.
    pub async fn wait_lock_and_execute<F, Fut, T>(&self, name: &str, owner: &OwnerToken, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lease = self.lock(name, owner).await?;
        Ok(self.execute_with_lease(lease, f).await)
    }

    /// Run `f` under the lock if it can be had within `timeout`.
    pub async fn wait_lock_and_execute_for<F, Fut, T>(
        &self,
        name: &str,
        owner: &OwnerToken,
        timeout: Duration,
        f: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        match self.try_lock_for(name, owner, timeout).await? {
            Some(lease) => Ok(Some(self.execute_with_lease(lease, f).await)),
            None => Ok(None),
        }
    }

    /// Unlock on every exit path, then resume a panic if `f` panicked.
    async fn execute_with_lease<F, Fut, T>(&self, lease: Lease, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let outcome = AssertUnwindSafe(async move { f().await }).catch_unwind().await;

        let name = lease.name.clone();
        if let Err(e) = self.unlock(lease).await {
            warn!(lock = %name, error = %e, "Release after execute failed");
        }

        match outcome {
            Ok(value) => value,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Whether `owner` holds `name` according to local bookkeeping.
    pub fn is_held_by(&self, name: &str, owner: &OwnerToken) -> bool {
        self.inner.held.get(name).is_some_and(|h| h.owner == *owner)
    }

    /// Reentrancy depth of `owner` on `name` (0 if not held).
    pub fn hold_count(&self, name: &str, owner: &OwnerToken) -> usize {
        self.inner
            .held
            .get(name)
            .filter(|h| h.owner == *owner)
            .map_or(0, |h| h.count)
    }

    /// Names of every lock held through this manager.
    pub fn held_locks(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.held.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Whether the heartbeat task is running.
    pub fn is_heartbeat_running(&self) -> bool {
        self.inner
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stop heartbeats and interrupt waiters, leaving store records in place.
    ///
    /// Records still held lapse once their lease runs out, exactly as if
    /// this process had crashed.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self
            .inner
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        self.inner.watcher.shutdown();
        let abandoned = self.inner.held.len();
        self.inner.held.clear();
        self.inner.publish_held();
        info!(collection = %self.inner.config.collection, abandoned, "Lock manager shut down");
    }

    fn ensure_heartbeat(&self) {
        let mut slot = self.inner.heartbeat.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        if self.inner.shut_down.load(Ordering::Acquire) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.heartbeat_interval();
        let collection = self.inner.config.collection.clone();
        *slot = Some(tokio::spawn(run_heartbeat(weak, interval, collection)));
    }
}

async fn run_heartbeat(inner: Weak<LockInner>, interval: Duration, collection: String) {
    let span = info_span!("lock_heartbeat", collection = %collection);

    async move {
        info!(interval_ms = interval.as_millis() as u64, "Heartbeat started");
        loop {
            tokio::time::sleep(interval).await;

            let Some(inner) = inner.upgrade() else {
                return;
            };
            if inner.shut_down.load(Ordering::Acquire) {
                return;
            }
            if inner.stop_heartbeat_if_idle() {
                info!("No locks held, heartbeat stopped");
                return;
            }
            inner.renew_all().await;
        }
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DocumentStore, MemoryStore};

    fn setup() -> (Arc<MemoryStore>, LockManager) {
        let store = Arc::new(MemoryStore::new());
        let manager = LockManager::new(store.clone(), LockConfig::for_testing()).unwrap();
        (store, manager)
    }

    #[tokio::test]
    async fn test_try_lock_acquires_and_writes_record() {
        let (store, manager) = setup();
        let owner = OwnerToken::new();

        let lease = manager.try_lock("L", &owner).await.unwrap().unwrap();
        assert_eq!(lease.name(), "L");
        assert!(manager.is_held_by("L", &owner));

        let record = store.get("locks", "L").await.unwrap().unwrap();
        assert_eq!(record.owner.as_deref(), Some(owner.as_str()));
        assert!(record.expire_at.unwrap() > now_millis());
        manager.unlock(lease).await.unwrap();
    }

    #[tokio::test]
    async fn test_other_local_owner_denied() {
        let (_store, manager) = setup();
        let a = OwnerToken::new();
        let b = OwnerToken::new();

        let lease = manager.try_lock("L", &a).await.unwrap().unwrap();
        assert!(manager.try_lock("L", &b).await.unwrap().is_none());
        manager.unlock(lease).await.unwrap();
        assert!(manager.try_lock("L", &b).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_other_manager_denied_by_store() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let first = LockManager::new(store.clone(), LockConfig::for_testing()).unwrap();
        let second = LockManager::new(store.clone(), LockConfig::for_testing()).unwrap();

        let _lease = first.try_lock("L", &OwnerToken::new()).await.unwrap().unwrap();
        assert!(second.try_lock("L", &OwnerToken::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reentrant_counts() {
        let (store, manager) = setup();
        let owner = OwnerToken::new();

        let outer = manager.try_lock("L", &owner).await.unwrap().unwrap();
        let inner = manager.try_lock("L", &owner).await.unwrap().unwrap();
        assert_eq!(manager.hold_count("L", &owner), 2);

        manager.unlock(inner).await.unwrap();
        assert_eq!(manager.hold_count("L", &owner), 1);
        assert!(store.get("locks", "L").await.unwrap().is_some());

        manager.unlock(outer).await.unwrap();
        assert_eq!(manager.hold_count("L", &owner), 0);
        assert!(store.get("locks", "L").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_name_rejected() {
        let (_store, manager) = setup();
        let err = manager.try_lock("", &OwnerToken::new()).await.unwrap_err();
        assert!(matches!(err, CoordinationError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let store = Arc::new(MemoryStore::new());
        let config = LockConfig {
            heartbeat_interval_ms: 500,
            expire_lock_after_no_heartbeat_ms: 500,
            ..LockConfig::for_testing()
        };
        assert!(matches!(
            LockManager::new(store, config),
            Err(CoordinationError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_store_error_fails_closed() {
        let (store, manager) = setup();
        store.fail_next_operations(1);
        assert!(manager.try_lock("L", &OwnerToken::new()).await.unwrap().is_none());
        assert!(manager.held_locks().is_empty());
    }

    #[tokio::test]
    async fn test_try_lock_for_waits_for_release() {
        let (_store, manager) = setup();
        let a = OwnerToken::new();
        let b = OwnerToken::new();

        let lease = manager.try_lock("L", &a).await.unwrap().unwrap();
        let waiter = {
            let manager = manager.clone();
            let b = b.clone();
            tokio::spawn(async move { manager.try_lock_for("L", &b, Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.unlock(lease).await.unwrap();

        let lease_b = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(lease_b.owner(), &b);
        manager.unlock(lease_b).await.unwrap();
    }

    #[tokio::test]
    async fn test_try_lock_for_times_out() {
        let (_store, manager) = setup();
        let _lease = manager.try_lock("L", &OwnerToken::new()).await.unwrap().unwrap();

        let started = Instant::now();
        let result = manager
            .try_lock_for("L", &OwnerToken::new(), Duration::from_millis(150))
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_lease_alive() {
        let (store, manager) = setup();
        let owner = OwnerToken::new();
        let lease = manager.try_lock("L", &owner).await.unwrap().unwrap();
        assert!(manager.is_heartbeat_running());

        // Well past the 400ms lease window.
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(store.get("locks", "L").await.unwrap().is_some());
        assert!(manager.is_held_by("L", &owner));
        manager.unlock(lease).await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_stops_when_nothing_held() {
        let (_store, manager) = setup();
        let lease = manager.try_lock("L", &OwnerToken::new()).await.unwrap().unwrap();
        manager.unlock(lease).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!manager.is_heartbeat_running());
    }

    #[tokio::test]
    async fn test_stolen_lease_detected_and_unlock_reports_not_held() {
        let (store, manager) = setup();
        let owner = OwnerToken::new();
        let lease = manager.try_lock("L", &owner).await.unwrap().unwrap();

        store.delete_one("locks", "L", &Precondition::Always).await.unwrap();
        store
            .insert_if_absent("locks", Document::new("L", vec![]).with_owner("thief"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!manager.is_held_by("L", &owner));

        let err = manager.unlock(lease).await.unwrap_err();
        assert!(matches!(err, CoordinationError::NotHeld { .. }));
        // The thief's record is untouched.
        assert_eq!(
            store.get("locks", "L").await.unwrap().unwrap().owner.as_deref(),
            Some("thief")
        );
    }

    #[tokio::test]
    async fn test_no_wait_lock_and_execute() {
        let (_store, manager) = setup();
        let owner = OwnerToken::new();

        let result = manager
            .no_wait_lock_and_execute("L", &owner, || async { 42 })
            .await
            .unwrap();
        assert_eq!(result, Some(42));
        assert!(!manager.is_held_by("L", &owner));

        let _lease = manager.try_lock("L", &OwnerToken::new()).await.unwrap().unwrap();
        let skipped = manager
            .no_wait_lock_and_execute("L", &owner, || async { 1 })
            .await
            .unwrap();
        assert_eq!(skipped, None);
    }

    #[tokio::test]
    async fn test_execute_unlocks_on_panic() {
        let (store, manager) = setup();
        let owner = OwnerToken::new();

        let task = {
            let manager = manager.clone();
            let owner = owner.clone();
            tokio::spawn(async move {
                manager
                    .wait_lock_and_execute("L", &owner, || async { panic!("boom") })
                    .await
            })
        };
        let join = task.await;
        assert!(join.unwrap_err().is_panic());

        assert!(!manager.is_held_by("L", &owner));
        assert!(store.get("locks", "L").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_abandons_records_and_rejects_new_calls() {
        let (store, manager) = setup();
        let _lease = manager.try_lock("L", &OwnerToken::new()).await.unwrap().unwrap();

        manager.shutdown();
        assert!(manager.held_locks().is_empty());
        assert!(store.get("locks", "L").await.unwrap().is_some());
        assert!(matches!(
            manager.try_lock("M", &OwnerToken::new()).await,
            Err(CoordinationError::Shutdown)
        ));
    }
}

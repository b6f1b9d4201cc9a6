// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change watcher: multiplexed blocking waits over one change feed.
//!
//! A [`ChangeWatcher`] watches one collection for one [`OperationKind`]. Any
//! number of callers can block on it, optionally narrowed to a subject key;
//! they all share a single background listener task.
//!
//! # Lifecycle
//!
//! ```text
//!            register()                    idle for stop_change_stream_after_no_waiter_ms
//! Stopped ─────────────→ Listening ──────────────────────────────────────────→ Stopped
//!                          │   ↑
//!        feed error / end  │   │ backoff, resubscribe
//!                          ↓   │
//!                         Restarting
//! ```
//!
//! # Usage Pattern
//!
//! Register *before* checking the condition, then wait:
//!
//! ```rust,ignore
//! loop {
//!     let waiter = watcher.register(Some(name));
//!     if condition_holds().await? { break; }
//!     waiter.wait(Some(remaining)).await;
//! }
//! ```
//!
//! Every (re)subscription wakes all registered waiters, so an event published
//! while the feed was down can never strand a caller. Waiters treat any
//! wake as "check again".

use crate::config::WatcherConfig;
use crate::metrics;
use crate::store::{OperationKind, StoreRef};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, trace, warn, Instrument};

/// How a wait finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A qualifying event arrived, or the feed was (re)subscribed.
    Changed,
    /// The timeout elapsed first.
    TimedOut,
    /// The watcher was shut down.
    Interrupted,
}

impl WaitOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Changed => "changed",
            Self::TimedOut => "timed_out",
            Self::Interrupted => "interrupted",
        }
    }
}

struct WaiterSlot {
    subject: Option<String>,
    tx: oneshot::Sender<WaitOutcome>,
}

#[derive(Default)]
struct Registry {
    waiters: HashMap<u64, WaiterSlot>,
    next_id: u64,
    listener: Option<JoinHandle<()>>,
    last_active: Option<Instant>,
    shut_down: bool,
}

struct Inner {
    store: StoreRef,
    collection: String,
    kind: OperationKind,
    config: WatcherConfig,
    registry: Mutex<Registry>,
    shutdown_tx: watch::Sender<bool>,
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_waiters(&self, count: usize) {
        metrics::set_watcher_waiters(&self.collection, self.kind.as_str(), count);
    }

    /// Wake waiters interested in `key`.
    fn dispatch(&self, key: &str) {
        let woken: Vec<WaiterSlot> = {
            let mut registry = self.registry();
            let ids: Vec<u64> = registry
                .waiters
                .iter()
                .filter(|(_, slot)| slot.subject.as_deref().map_or(true, |s| s == key))
                .map(|(id, _)| *id)
                .collect();
            let woken = ids.iter().filter_map(|id| registry.waiters.remove(id)).collect();
            self.publish_waiters(registry.waiters.len());
            woken
        };
        if !woken.is_empty() {
            trace!(collection = %self.collection, key, woken = woken.len(), "Waking waiters");
        }
        for slot in woken {
            let _ = slot.tx.send(WaitOutcome::Changed);
        }
    }

    fn wake_all(&self, outcome: WaitOutcome) -> usize {
        let drained: Vec<WaiterSlot> = {
            let mut registry = self.registry();
            let drained = registry.waiters.drain().map(|(_, slot)| slot).collect();
            self.publish_waiters(0);
            drained
        };
        let count = drained.len();
        for slot in drained {
            let _ = slot.tx.send(outcome);
        }
        count
    }

    /// Stop the listener if nobody has waited for `idle`. Decided under the
    /// registry lock so a concurrent `register` either sees the listener
    /// gone or keeps it alive.
    fn stop_if_idle(&self, idle: Duration) -> bool {
        let mut registry = self.registry();
        let idle_for = registry.last_active.map_or(Duration::MAX, |at| at.elapsed());
        if registry.waiters.is_empty() && idle_for >= idle {
            registry.listener = None;
            return true;
        }
        false
    }

    fn unregister(&self, id: u64) {
        let mut registry = self.registry();
        if registry.waiters.remove(&id).is_some() {
            self.publish_waiters(registry.waiters.len());
        }
        registry.last_active = Some(Instant::now());
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let registry = self.registry.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = registry.listener.take() {
            handle.abort();
        }
    }
}

/// Multiplexes blocking waits over one (collection, operation kind) feed.
///
/// Cheap to clone; clones share the listener and the waiter registry.
#[derive(Clone)]
pub struct ChangeWatcher {
    inner: Arc<Inner>,
}

/// Non-owning handle to a [`ChangeWatcher`]. Keeps neither the listener
/// nor the waiter registry alive.
#[derive(Clone)]
pub(crate) struct WeakChangeWatcher {
    inner: Weak<Inner>,
}

impl WeakChangeWatcher {
    pub(crate) fn upgrade(&self) -> Option<ChangeWatcher> {
        self.inner.upgrade().map(|inner| ChangeWatcher { inner })
    }

    pub(crate) fn is_live(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl std::fmt::Debug for ChangeWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeWatcher")
            .field("collection", &self.inner.collection)
            .field("kind", &self.inner.kind)
            .finish()
    }
}

impl ChangeWatcher {
    pub fn new(store: StoreRef, collection: impl Into<String>, kind: OperationKind, config: WatcherConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                store,
                collection: collection.into(),
                kind,
                config,
                registry: Mutex::new(Registry::default()),
                shutdown_tx,
            }),
        }
    }

    pub fn collection(&self) -> &str {
        &self.inner.collection
    }

    pub(crate) fn downgrade(&self) -> WeakChangeWatcher {
        WeakChangeWatcher {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.inner.kind
    }

    /// Enrol a waiter for events on `subject` (any key when `None`).
    ///
    /// Starts the listener if it is not running.
    pub fn register(&self, subject: Option<&str>) -> ChangeWaiter {
        let (tx, rx) = oneshot::channel();
        let mut registry = self.inner.registry();

        if registry.shut_down {
            let _ = tx.send(WaitOutcome::Interrupted);
            return ChangeWaiter {
                id: None,
                rx,
                watcher: Arc::downgrade(&self.inner),
                collection: self.inner.collection.clone(),
            };
        }

        let id = registry.next_id;
        registry.next_id += 1;
        registry.waiters.insert(
            id,
            WaiterSlot {
                subject: subject.map(str::to_string),
                tx,
            },
        );
        registry.last_active = Some(Instant::now());
        self.inner.publish_waiters(registry.waiters.len());

        let running = registry.listener.as_ref().is_some_and(|h| !h.is_finished());
        if !running {
            registry.listener = Some(self.spawn_listener());
        }

        ChangeWaiter {
            id: Some(id),
            rx,
            watcher: Arc::downgrade(&self.inner),
            collection: self.inner.collection.clone(),
        }
    }

    /// Register and wait in one step.
    pub async fn wait_for_change(&self, subject: Option<&str>, timeout: Option<Duration>) -> WaitOutcome {
        self.register(subject).wait(timeout).await
    }

    /// Interrupt every pending waiter and stop the listener.
    ///
    /// Later registrations return [`WaitOutcome::Interrupted`] at once.
    pub fn shutdown(&self) {
        {
            let mut registry = self.inner.registry();
            if registry.shut_down {
                return;
            }
            registry.shut_down = true;
        }
        let interrupted = self.inner.wake_all(WaitOutcome::Interrupted);
        self.inner.shutdown_tx.send_replace(true);
        info!(
            collection = %self.inner.collection,
            kind = %self.inner.kind,
            interrupted,
            "Change watcher shut down"
        );
    }

    /// Whether the background listener is currently running.
    pub fn is_listening(&self) -> bool {
        self.inner
            .registry()
            .listener
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Number of waiters currently registered.
    pub fn waiter_count(&self) -> usize {
        self.inner.registry().waiters.len()
    }

    fn spawn_listener(&self) -> JoinHandle<()> {
        let listener = Listener {
            inner: Arc::downgrade(&self.inner),
            store: Arc::clone(&self.inner.store),
            collection: self.inner.collection.clone(),
            kind: self.inner.kind,
            config: self.inner.config.clone(),
            shutdown_rx: self.inner.shutdown_tx.subscribe(),
        };
        tokio::spawn(listener.run())
    }
}

/// A registered waiter. Dropping it unregisters.
#[must_use = "a waiter does nothing until waited on"]
pub struct ChangeWaiter {
    id: Option<u64>,
    rx: oneshot::Receiver<WaitOutcome>,
    watcher: Weak<Inner>,
    collection: String,
}

impl ChangeWaiter {
    /// Block until woken, interrupted, or `timeout` (forever when `None`).
    pub async fn wait(mut self, timeout: Option<Duration>) -> WaitOutcome {
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut self.rx).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => WaitOutcome::Interrupted,
                Err(_) => WaitOutcome::TimedOut,
            },
            None => (&mut self.rx).await.unwrap_or(WaitOutcome::Interrupted),
        };
        metrics::record_wait_outcome(&self.collection, outcome.as_str());
        outcome
    }
}

impl Drop for ChangeWaiter {
    fn drop(&mut self) {
        if let (Some(id), Some(inner)) = (self.id, self.watcher.upgrade()) {
            inner.unregister(id);
        }
    }
}

/// The background subscription. Holds only a weak handle to the watcher so
/// dropping every `ChangeWatcher` ends it.
struct Listener {
    inner: Weak<Inner>,
    store: StoreRef,
    collection: String,
    kind: OperationKind,
    config: WatcherConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl Listener {
    async fn run(mut self) {
        let span = info_span!("change_watcher", collection = %self.collection, kind = %self.kind);

        async move {
            info!("Starting change stream listener");
            let idle_timeout = self.config.idle_timeout();
            let retry = self.config.restart_retry();
            let idle_tick = (idle_timeout / 2).max(Duration::from_millis(10));
            let mut failures = 0usize;

            'subscribe: loop {
                if *self.shutdown_rx.borrow() {
                    break;
                }

                if failures > 0 {
                    let delay = retry.delay_for_attempt(failures);
                    debug!(failures, delay_ms = delay.as_millis() as u64, "Backing off before resubscribe");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown_rx.changed() => break,
                    }
                }

                let mut stream = match self.store.watch(&self.collection, self.kind).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(error = %e, "Failed to subscribe to change feed");
                        failures += 1;
                        metrics::record_watcher_restart(&self.collection, self.kind.as_str());
                        continue;
                    }
                };
                metrics::record_watcher_subscription(&self.collection, self.kind.as_str());

                // Anything published before we were live is unknown to us.
                let Some(inner) = self.inner.upgrade() else { break };
                let woken = inner.wake_all(WaitOutcome::Changed);
                drop(inner);
                debug!(woken, "Change feed subscribed");

                let mut idle_check = tokio::time::interval(idle_tick);
                idle_check.tick().await;

                loop {
                    tokio::select! {
                        _ = self.shutdown_rx.changed() => break 'subscribe,

                        _ = idle_check.tick() => {
                            let Some(inner) = self.inner.upgrade() else { break 'subscribe };
                            if inner.stop_if_idle(idle_timeout) {
                                info!("No waiters, stopping change stream listener");
                                return;
                            }
                        }

                        item = stream.next() => match item {
                            Some(Ok(event)) => {
                                failures = 0;
                                let Some(inner) = self.inner.upgrade() else { break 'subscribe };
                                inner.dispatch(&event.key);
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "Change feed failed, resubscribing");
                                failures += 1;
                                metrics::record_watcher_restart(&self.collection, self.kind.as_str());
                                continue 'subscribe;
                            }
                            None => {
                                warn!("Change feed ended, resubscribing");
                                failures += 1;
                                metrics::record_watcher_restart(&self.collection, self.kind.as_str());
                                continue 'subscribe;
                            }
                        },
                    }
                }
            }

            info!("Change stream listener stopped");
        }
        .instrument(span)
        .await
    }
}

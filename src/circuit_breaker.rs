// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breakers in front of the Redis document store.
//!
//! Every script [`RedisStore`](crate::store::RedisStore) runs goes through one
//! of two breakers, chosen by [`Access`]. While Redis is failing, callers get
//! an immediate retryable `Store` error instead of queueing on a dead
//! connection, so lock heartbeats and queue producers back off on their own
//! schedules.
//!
//! Uses the `recloser` crate. A breaker opens once a full window of
//! `failure_threshold` calls has failed, stays open for `recovery_timeout`,
//! then lets `success_threshold` trial calls through before closing.
//!
//! ```rust,no_run
//! # use coordination_engine::circuit_breaker::{Access, StoreCircuit};
//! # async fn example() -> coordination_engine::Result<()> {
//! let circuit = StoreCircuit::default();
//! let n: u64 = circuit.guard(Access::Read, "count", || async { Ok(3) }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RedisConfig;
use crate::error::{CoordinationError, Result};
use crate::metrics;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Trip only when the whole closed window failed.
const TRIP_RATE: f32 = 0.99;

/// Which breaker a store call goes through.
///
/// Reads and writes trip independently, so a burst of failing scans from
/// iterators does not stop lease renewals while writes still succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    /// Inserts, updates, deletes and lease renewals.
    Write,
    /// Gets, scans and counts.
    Read,
}

impl Access {
    /// Breaker name, used as the metrics label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Write => "store_writes",
            Self::Read => "store_reads",
        }
    }
}

/// Observed breaker state.
///
/// `recloser` does not expose its state machine, so this reflects the last
/// call: `Open` while calls are being rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a call refused or failed behind a breaker.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The breaker is open; the call was never made.
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The call was made and failed.
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CircuitError::Rejected)
    }
}

/// Breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitConfig {
    /// Size of the closed window; all of it must fail to trip.
    pub failure_threshold: u32,
    /// Successful trial calls needed to close again.
    pub success_threshold: u32,
    /// How long an open breaker rejects before probing.
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Write breaker settings from the store config.
    pub fn for_store(config: &RedisConfig) -> Self {
        Self {
            failure_threshold: config.circuit_failure_threshold,
            recovery_timeout: Duration::from_secs(config.circuit_reset_timeout_sec),
            ..Self::default()
        }
    }

    /// Trips after two failures, recovers after 50ms.
    pub fn for_testing() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// Call counters of one breaker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CircuitCounts {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
}

/// One `recloser` breaker plus counters for diagnostics.
pub struct CircuitBreaker {
    access: Access,
    inner: AsyncRecloser,
    calls: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
    last_rejected: AtomicBool,
}

impl CircuitBreaker {
    pub fn new(access: Access, config: &CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(TRIP_RATE)
            .closed_len(config.failure_threshold.max(1) as usize)
            .half_open_len(config.success_threshold.max(1) as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            access,
            inner: recloser.into(),
            calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            last_rejected: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.access.as_str()
    }

    /// Run `f` unless the breaker is open. `f` is not called when rejected.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> std::result::Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.calls.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(value) => {
                self.last_rejected.store(false, Ordering::Relaxed);
                metrics::record_circuit_call(self.name(), "success");
                Ok(value)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                if !self.last_rejected.swap(true, Ordering::Relaxed) {
                    warn!(circuit = self.name(), "Circuit open, rejecting store calls");
                }
                metrics::record_circuit_rejection(self.name());
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.last_rejected.store(false, Ordering::Relaxed);
                metrics::record_circuit_call(self.name(), "failure");
                debug!(circuit = self.name(), "Store call failed behind circuit");
                Err(CircuitError::Inner(e))
            }
        }
    }

    pub fn counts(&self) -> CircuitCounts {
        let calls = self.calls.load(Ordering::Relaxed);
        let failures = self.failures.load(Ordering::Relaxed);
        let rejections = self.rejections.load(Ordering::Relaxed);
        CircuitCounts {
            calls,
            successes: calls.saturating_sub(failures + rejections),
            failures,
            rejections,
        }
    }

    pub fn state(&self) -> CircuitState {
        if self.last_rejected.load(Ordering::Relaxed) {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("counts", &self.counts())
            .finish()
    }
}

/// The read and write breakers of one store client.
#[derive(Debug)]
pub struct StoreCircuit {
    writes: CircuitBreaker,
    reads: CircuitBreaker,
}

impl Default for StoreCircuit {
    fn default() -> Self {
        Self::new(CircuitConfig::default(), CircuitConfig::default())
    }
}

impl StoreCircuit {
    pub fn new(writes: CircuitConfig, reads: CircuitConfig) -> Self {
        Self {
            writes: CircuitBreaker::new(Access::Write, &writes),
            reads: CircuitBreaker::new(Access::Read, &reads),
        }
    }

    /// Writes use the configured thresholds; reads keep the defaults.
    pub fn for_store(config: &RedisConfig) -> Self {
        Self::new(CircuitConfig::for_store(config), CircuitConfig::default())
    }

    pub fn breaker(&self, access: Access) -> &CircuitBreaker {
        match access {
            Access::Write => &self.writes,
            Access::Read => &self.reads,
        }
    }

    /// Run a store call behind the `access` breaker.
    ///
    /// A rejection surfaces as a retryable [`CoordinationError::Store`]
    /// naming `operation`.
    pub async fn guard<F, Fut, T>(&self, access: Access, operation: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.breaker(access).call(f).await {
            Ok(value) => Ok(value),
            Err(CircuitError::Inner(e)) => Err(e),
            Err(CircuitError::Rejected) => Err(CoordinationError::store(
                operation,
                "circuit breaker open, request rejected",
            )),
        }
    }

    pub fn any_open(&self) -> bool {
        self.writes.state() == CircuitState::Open || self.reads.state() == CircuitState::Open
    }

    /// Export both breaker states as gauges.
    pub fn publish_state(&self) {
        for breaker in [&self.writes, &self.reads] {
            metrics::set_circuit_state(breaker.name(), breaker.state().as_str());
        }
    }
}

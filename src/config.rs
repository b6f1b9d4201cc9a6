// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the coordination engine.
//!
//! Configuration is passed to [`Coordinator::connect()`](crate::Coordinator::connect)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use coordination_engine::config::{CoordinationConfig, StoreConfig};
//!
//! let config = CoordinationConfig {
//!     store: StoreConfig::redis("redis://127.0.0.1:6379"),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! CoordinationConfig
//! ├── store: StoreConfig           # memory | redis backend
//! ├── lock: LockConfig             # lease window, heartbeat cadence
//! ├── queue: QueueConfig           # batch size, TTL, allocation retries
//! └── watcher: WatcherConfig       # change feed idle teardown, restarts
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! store:
//!   backend: redis
//!   url: "redis://coord:6379"
//!   key_prefix: "billing:"
//!   block_timeout: "1s"
//!
//! lock:
//!   heartbeat_interval_ms: 2000
//!   expire_lock_after_no_heartbeat_ms: 10000
//!
//! queue:
//!   batch_size: 50
//!   entry_ttl_sec: 86400
//! ```

use crate::error::{CoordinationError, Result};
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed to Coordinator::connect()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `Coordinator::connect()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Which document store backs every primitive.
    #[serde(default)]
    pub store: StoreConfig,

    /// Lease and heartbeat settings for lock managers.
    #[serde(default)]
    pub lock: LockConfig,

    /// Settings shared by every replay queue.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Change watcher lifecycle settings.
    #[serde(default)]
    pub watcher: WatcherConfig,
}

impl CoordinationConfig {
    /// Create a config with short intervals and an in-memory store.
    pub fn for_testing() -> Self {
        Self {
            store: StoreConfig::Memory {
                sweep_interval_ms: 20,
            },
            lock: LockConfig::for_testing(),
            queue: QueueConfig::for_testing(),
            watcher: WatcherConfig::for_testing(),
        }
    }

    /// Reject impossible combinations before anything connects.
    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        self.lock.validate()?;
        self.queue.validate()?;
        self.watcher.validate()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig: backend selection
// ═══════════════════════════════════════════════════════════════════════════════

/// Document store backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    /// In-process store. State dies with the process.
    Memory {
        /// How often expired documents are swept (0 disables the sweeper).
        #[serde(default = "default_sweep_interval_ms")]
        sweep_interval_ms: u64,
    },
    /// Shared Redis instance.
    Redis(RedisConfig),
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Memory {
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl StoreConfig {
    /// Redis backend with default tuning.
    pub fn redis(url: &str) -> Self {
        Self::Redis(RedisConfig {
            url: url.to_string(),
            ..Default::default()
        })
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::Memory { .. } => Ok(()),
            Self::Redis(redis) => redis.validate(),
        }
    }
}

/// Redis backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection URL, e.g. `redis://host:6379/0`.
    pub url: String,

    /// Prefix applied to every key this client touches.
    /// Lets several deployments share one Redis.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// XREAD BLOCK timeout for change feeds (humantime string).
    #[serde(default = "default_block_timeout")]
    pub block_timeout: String,

    /// How often expired documents are swept (0 disables the sweeper).
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Approximate cap on change stream length (XADD MAXLEN ~).
    #[serde(default = "default_change_stream_maxlen")]
    pub change_stream_maxlen: u64,

    /// Consecutive failures before the store circuit opens.
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    /// Seconds the circuit stays open before probing again.
    #[serde(default = "default_circuit_reset_timeout")]
    pub circuit_reset_timeout_sec: u64,
}

fn default_key_prefix() -> String {
    "coord:".to_string()
}

fn default_block_timeout() -> String {
    "1s".to_string()
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

fn default_change_stream_maxlen() -> u64 {
    10_000
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_reset_timeout() -> u64 {
    30
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: default_key_prefix(),
            block_timeout: default_block_timeout(),
            sweep_interval_ms: default_sweep_interval_ms(),
            change_stream_maxlen: default_change_stream_maxlen(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_reset_timeout_sec: default_circuit_reset_timeout(),
        }
    }
}

impl RedisConfig {
    /// Redis settings tuned for tests: short block timeout, fast sweeps.
    pub fn for_testing(url: &str, key_prefix: &str) -> Self {
        Self {
            url: url.to_string(),
            key_prefix: key_prefix.to_string(),
            block_timeout: "200ms".to_string(),
            sweep_interval_ms: 50,
            ..Default::default()
        }
    }

    /// Parse the block timeout string to Duration.
    pub fn block_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.block_timeout).unwrap_or(Duration::from_secs(1))
    }

    /// Get the sweep interval, `None` when sweeping is disabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_ms > 0).then(|| Duration::from_millis(self.sweep_interval_ms))
    }

    fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(CoordinationError::Config("redis url is empty".into()));
        }
        let block_timeout = humantime::parse_duration(&self.block_timeout)
            .map_err(|_| CoordinationError::Config(format!("invalid block_timeout '{}'", self.block_timeout)))?;
        // XREAD BLOCK 0 never returns.
        if block_timeout.is_zero() {
            return Err(CoordinationError::Config("block_timeout must be positive".into()));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LockConfig: leases and heartbeats
// ═══════════════════════════════════════════════════════════════════════════════

/// Lease settings for a [`LockManager`](crate::lock::LockManager).
///
/// The lease window (`expire_lock_after_no_heartbeat_ms`) must comfortably
/// exceed `heartbeat_interval_ms`, otherwise a single late heartbeat loses
/// the lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Collection holding lock records.
    #[serde(default = "default_lock_collection")]
    pub collection: String,

    /// Delay between heartbeat rounds.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Lease window: a record expires this long after its last renewal.
    #[serde(default = "default_expire_after_no_heartbeat_ms")]
    pub expire_lock_after_no_heartbeat_ms: u64,

    /// Hold duration after which a warning is raised. Not enforced.
    #[serde(default)]
    pub drop_lock_after_held_for_too_long_ms: Option<u64>,

    /// Upper bound on a single blocking wait before the lock is re-tried.
    #[serde(default = "default_wait_slice_ms")]
    pub wait_slice_ms: u64,
}

fn default_lock_collection() -> String {
    "locks".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    2_000
}

fn default_expire_after_no_heartbeat_ms() -> u64 {
    10_000
}

fn default_wait_slice_ms() -> u64 {
    1_000
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            collection: default_lock_collection(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            expire_lock_after_no_heartbeat_ms: default_expire_after_no_heartbeat_ms(),
            drop_lock_after_held_for_too_long_ms: None,
            wait_slice_ms: default_wait_slice_ms(),
        }
    }
}

impl LockConfig {
    /// Short lease for tests.
    pub fn for_testing() -> Self {
        Self {
            collection: default_lock_collection(),
            heartbeat_interval_ms: 50,
            expire_lock_after_no_heartbeat_ms: 400,
            drop_lock_after_held_for_too_long_ms: None,
            wait_slice_ms: 50,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn lease_window(&self) -> Duration {
        Duration::from_millis(self.expire_lock_after_no_heartbeat_ms)
    }

    pub fn wait_slice(&self) -> Duration {
        Duration::from_millis(self.wait_slice_ms)
    }

    pub fn hold_warning_after(&self) -> Option<Duration> {
        self.drop_lock_after_held_for_too_long_ms
            .map(Duration::from_millis)
    }

    /// Reject configurations where a lease can lapse between heartbeats.
    pub fn validate(&self) -> Result<()> {
        if self.collection.is_empty() {
            return Err(CoordinationError::Config("lock collection is empty".into()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(CoordinationError::Config(
                "heartbeat_interval_ms must be positive".into(),
            ));
        }
        if self.expire_lock_after_no_heartbeat_ms <= self.heartbeat_interval_ms {
            return Err(CoordinationError::Config(format!(
                "expire_lock_after_no_heartbeat_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.expire_lock_after_no_heartbeat_ms, self.heartbeat_interval_ms
            )));
        }
        if self.wait_slice_ms == 0 {
            return Err(CoordinationError::Config("wait_slice_ms must be positive".into()));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// QueueConfig: replay queues
// ═══════════════════════════════════════════════════════════════════════════════

/// Settings shared by [`ReplayQueue`](crate::queue::ReplayQueue) instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Items per atomic insert in `add_all`.
    #[serde(default = "default_queue_batch_size")]
    pub batch_size: usize,

    /// Entries expire this long after they were appended (None = keep forever).
    #[serde(default)]
    pub entry_ttl_sec: Option<u64>,

    /// Attempts at allocating a sequence before giving up.
    #[serde(default = "default_max_allocation_attempts")]
    pub max_allocation_attempts: usize,

    /// First backoff after an allocation conflict.
    #[serde(default = "default_allocation_initial_delay_ms")]
    pub allocation_initial_delay_ms: u64,

    /// Backoff ceiling for allocation conflicts.
    #[serde(default = "default_allocation_max_delay_ms")]
    pub allocation_max_delay_ms: u64,

    /// Upper bound on a single blocking wait in `poll_timeout`/`take`.
    #[serde(default = "default_wait_slice_ms")]
    pub wait_slice_ms: u64,
}

fn default_queue_batch_size() -> usize {
    50
}

fn default_max_allocation_attempts() -> usize {
    30
}

fn default_allocation_initial_delay_ms() -> u64 {
    2
}

fn default_allocation_max_delay_ms() -> u64 {
    200
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: default_queue_batch_size(),
            entry_ttl_sec: None,
            max_allocation_attempts: default_max_allocation_attempts(),
            allocation_initial_delay_ms: default_allocation_initial_delay_ms(),
            allocation_max_delay_ms: default_allocation_max_delay_ms(),
            wait_slice_ms: default_wait_slice_ms(),
        }
    }
}

impl QueueConfig {
    pub fn for_testing() -> Self {
        Self {
            batch_size: 4,
            wait_slice_ms: 50,
            allocation_max_delay_ms: 20,
            ..Default::default()
        }
    }

    pub fn entry_ttl(&self) -> Option<Duration> {
        self.entry_ttl_sec.map(Duration::from_secs)
    }

    pub fn wait_slice(&self) -> Duration {
        Duration::from_millis(self.wait_slice_ms)
    }

    /// Backoff schedule for sequence allocation conflicts.
    pub fn allocation_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_allocation_attempts,
            initial_delay: Duration::from_millis(self.allocation_initial_delay_ms),
            max_delay: Duration::from_millis(self.allocation_max_delay_ms),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(5),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(CoordinationError::Config("queue batch_size must be positive".into()));
        }
        if self.max_allocation_attempts == 0 {
            return Err(CoordinationError::Config(
                "max_allocation_attempts must be positive".into(),
            ));
        }
        if self.wait_slice_ms == 0 {
            return Err(CoordinationError::Config("wait_slice_ms must be positive".into()));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WatcherConfig: change feed subscriptions
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle settings for a [`ChangeWatcher`](crate::watcher::ChangeWatcher).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Close the subscription after this long without any registered waiter.
    #[serde(default = "default_stop_after_no_waiter_ms")]
    pub stop_change_stream_after_no_waiter_ms: u64,

    /// First delay before resubscribing after a feed error.
    #[serde(default = "default_restart_initial_delay_ms")]
    pub restart_initial_delay_ms: u64,

    /// Ceiling for resubscription backoff.
    #[serde(default = "default_restart_max_delay_ms")]
    pub restart_max_delay_ms: u64,
}

fn default_stop_after_no_waiter_ms() -> u64 {
    60_000
}

fn default_restart_initial_delay_ms() -> u64 {
    100
}

fn default_restart_max_delay_ms() -> u64 {
    5_000
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            stop_change_stream_after_no_waiter_ms: default_stop_after_no_waiter_ms(),
            restart_initial_delay_ms: default_restart_initial_delay_ms(),
            restart_max_delay_ms: default_restart_max_delay_ms(),
        }
    }
}

impl WatcherConfig {
    pub fn for_testing() -> Self {
        Self {
            stop_change_stream_after_no_waiter_ms: 200,
            restart_initial_delay_ms: 10,
            restart_max_delay_ms: 100,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_change_stream_after_no_waiter_ms)
    }

    /// Resubscription backoff. Never gives up while waiters remain.
    pub fn restart_retry(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.restart_initial_delay_ms),
            max_delay: Duration::from_millis(self.restart_max_delay_ms),
            ..RetryConfig::daemon()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.stop_change_stream_after_no_waiter_ms == 0 {
            return Err(CoordinationError::Config(
                "stop_change_stream_after_no_waiter_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Lock acquisition, release, heartbeats and lease loss
//! - Change watcher subscriptions and wait outcomes
//! - Queue appends, allocation conflicts and polls
//! - Sorted view operations
//! - Store latency, expiry sweeps and circuit breaker state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `coordination_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! No recorder is installed here. The embedding application picks one.
//!
//! # Usage
//!
//! ```rust,no_run
//! use coordination_engine::metrics;
//! use std::time::Duration;
//!
//! metrics::record_lock_acquire("orders", "acquired");
//! metrics::record_heartbeat(3, Duration::from_millis(4));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Lock Metrics
// =============================================================================

/// Record a lock acquisition attempt.
///
/// `outcome` is one of `acquired`, `reentrant`, `denied`, `error`.
pub fn record_lock_acquire(lock: &str, outcome: &str) {
    counter!(
        "coordination_lock_acquire_total",
        "lock" => lock.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a lock release that deleted the store record.
pub fn record_lock_release(lock: &str) {
    counter!("coordination_lock_release_total", "lock" => lock.to_string()).increment(1);
}

/// Record how long a caller blocked in `try_lock_for`/`lock`.
pub fn record_lock_wait(lock: &str, duration: Duration, acquired: bool) {
    let outcome = if acquired { "acquired" } else { "timeout" };
    histogram!(
        "coordination_lock_wait_seconds",
        "lock" => lock.to_string(),
        "outcome" => outcome
    )
    .record(duration.as_secs_f64());
}

/// Set the number of locks held by this process.
pub fn set_locks_held(count: usize) {
    gauge!("coordination_locks_held").set(count as f64);
}

/// Record one heartbeat round.
pub fn record_heartbeat(renewed: usize, duration: Duration) {
    counter!("coordination_heartbeat_rounds_total").increment(1);
    counter!("coordination_heartbeat_renewals_total").increment(renewed as u64);
    histogram!("coordination_heartbeat_duration_seconds").record(duration.as_secs_f64());
}

/// Record a heartbeat renewal that failed with a store error (lease kept).
pub fn record_heartbeat_failure(lock: &str) {
    counter!("coordination_heartbeat_failures_total", "lock" => lock.to_string()).increment(1);
}

/// Record a lease lost to expiry or theft.
pub fn record_lease_lost(lock: &str) {
    counter!("coordination_lease_lost_total", "lock" => lock.to_string()).increment(1);
}

/// Record a hold that exceeded the configured warning threshold.
pub fn record_lock_held_too_long(lock: &str) {
    counter!("coordination_lock_held_too_long_total", "lock" => lock.to_string()).increment(1);
}

// =============================================================================
// Change Watcher Metrics
// =============================================================================

/// Record a change feed subscription being opened.
pub fn record_watcher_subscription(collection: &str, kind: &str) {
    counter!(
        "coordination_watcher_subscriptions_total",
        "collection" => collection.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record a change feed restart after an error or feed end.
pub fn record_watcher_restart(collection: &str, kind: &str) {
    counter!(
        "coordination_watcher_restarts_total",
        "collection" => collection.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record a waiter finishing, by outcome (`changed`, `timed_out`, `interrupted`).
pub fn record_wait_outcome(collection: &str, outcome: &str) {
    counter!(
        "coordination_watcher_waits_total",
        "collection" => collection.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set the number of registered waiters on a watcher.
pub fn set_watcher_waiters(collection: &str, kind: &str, count: usize) {
    gauge!(
        "coordination_watcher_waiters",
        "collection" => collection.to_string(),
        "kind" => kind.to_string()
    )
    .set(count as f64);
}

// =============================================================================
// Queue Metrics
// =============================================================================

/// Record items appended to a queue.
pub fn record_queue_offer(queue: &str, count: usize) {
    counter!("coordination_queue_offered_total", "queue" => queue.to_string())
        .increment(count as u64);
}

/// Record a sequence allocation conflict (another producer won the slot).
pub fn record_queue_allocation_conflict(queue: &str) {
    counter!("coordination_queue_allocation_conflicts_total", "queue" => queue.to_string())
        .increment(1);
}

/// Record the size of a batch written by `add_all`.
pub fn record_queue_batch(queue: &str, size: usize) {
    histogram!("coordination_queue_batch_size", "queue" => queue.to_string()).record(size as f64);
}

/// Record a poll, hit or miss.
pub fn record_queue_poll(queue: &str, hit: bool) {
    let outcome = if hit { "hit" } else { "empty" };
    counter!(
        "coordination_queue_polls_total",
        "queue" => queue.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record an entry that could not be decoded and was skipped.
pub fn record_queue_decode_failure(queue: &str) {
    counter!("coordination_queue_decode_failures_total", "queue" => queue.to_string())
        .increment(1);
}

// =============================================================================
// Sorted View Metrics
// =============================================================================

/// Record a sorted map/set operation.
pub fn record_map_operation(collection: &str, operation: &str) {
    counter!(
        "coordination_map_operations_total",
        "collection" => collection.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

// =============================================================================
// Store Metrics
// =============================================================================

/// Record store operation latency.
pub fn record_store_operation(backend: &str, operation: &str, duration: Duration, success: bool) {
    let status = if success { "success" } else { "failure" };
    histogram!(
        "coordination_store_operation_duration_seconds",
        "backend" => backend.to_string(),
        "operation" => operation.to_string(),
        "status" => status
    )
    .record(duration.as_secs_f64());
}

/// Record documents purged by the expiry sweeper.
pub fn record_expired_swept(backend: &str, count: usize) {
    if count > 0 {
        counter!("coordination_store_expired_swept_total", "backend" => backend.to_string())
            .increment(count as u64);
    }
}

/// Record a connection attempt to the store.
pub fn record_store_connection(backend: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "coordination_store_connections_total",
        "backend" => backend.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record a retried transient failure.
pub fn record_retry(operation: &str) {
    counter!("coordination_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Set coordinator state gauge.
pub fn set_coordinator_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        _ => -1.0,
    };
    gauge!("coordination_coordinator_state").set(value);
}

// =============================================================================
// Circuit Breaker Metrics
// =============================================================================

/// Record circuit breaker call outcome.
pub fn record_circuit_call(circuit_name: &str, outcome: &str) {
    counter!(
        "coordination_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set circuit breaker state gauge (0=closed, 1=half_open, 2=open).
pub fn set_circuit_state(circuit_name: &str, state: &str) {
    let value = match state {
        "closed" => 0.0,
        "half_open" => 1.0,
        "open" => 2.0,
        _ => -1.0,
    };
    gauge!("coordination_circuit_state", "circuit" => circuit_name.to_string()).set(value);
}

/// Record circuit breaker rejection (circuit was open).
pub fn record_circuit_rejection(circuit_name: &str) {
    counter!(
        "coordination_circuit_rejections_total",
        "circuit" => circuit_name.to_string()
    )
    .increment(1);
}

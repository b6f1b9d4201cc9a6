// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the coordination engine.
//!
//! Errors are categorized by their source (document store, change feed,
//! codec, caller misuse) and carry enough context to debug a failure from
//! the log line alone.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Store` | Yes | Network errors, timeouts, script failures |
//! | `ChangeFeed` | Yes | Watch subscription dropped or trimmed |
//! | `Config` | No | Configuration invalid |
//! | `Codec` | No | Payload could not be encoded or decoded |
//! | `Decompression` | No | Data corruption (zstd decode failed) |
//! | `InvalidArgument` | No | Empty name, empty key, or other missing input |
//! | `NotHeld` | No | Unlock of a lease that is no longer held |
//! | `InvalidState` | No | Iterator or lifecycle misuse |
//! | `OutOfRange` | No | Write outside a bounded view |
//! | `Unsupported` | No | Operation deliberately not offered |
//! | `Interrupted` | No | A blocking wait was interrupted |
//! | `Shutdown` | No | Component is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`CoordinationError::is_retryable()`] to decide whether an operation
//! should be retried with backoff. Queue sequence allocation and the watcher's
//! resubscription loop both rely on this classification.

use thiserror::Error;

/// Result type alias for coordination operations.
pub type Result<T> = std::result::Result<T, CoordinationError>;

/// Errors that can occur while coordinating through the document store.
#[derive(Error, Debug)]
pub enum CoordinationError {
    /// Document store command error.
    ///
    /// Covers Redis failures as well as injected faults in the memory store.
    /// These are typically retryable (network timeouts, connection drops).
    #[error("Store error ({operation}): {message}")]
    Store {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// The change feed failed or was closed underneath a subscriber.
    ///
    /// Retryable: the watcher resubscribes.
    #[error("Change feed error: {0}")]
    ChangeFeed(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Payload could not be serialized or deserialized.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Zstd decompression failure.
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// Missing or empty input, rejected before touching the store.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The lease being released is not held by its owner any more.
    ///
    /// Happens after a lease was lost to expiry or another holder.
    #[error("Lock '{name}' is not held by this owner")]
    NotHeld { name: String },

    /// State machine violation (e.g. iterator `remove()` before `next()`).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Key lies outside the bounds of a sub-view.
    #[error("Key '{key}' is outside the view range")]
    OutOfRange { key: String },

    /// Operation is not offered by this component.
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    /// A blocking wait was interrupted by shutdown of its watcher.
    #[error("Wait interrupted")]
    Interrupted,

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordinationError {
    /// Create a store error from a redis::RedisError
    pub fn redis(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Store {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a store error without source
    pub fn store(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store { .. } => true,
            Self::ChangeFeed(_) => true,
            Self::Config(_) => false,
            Self::Codec(_) => false,
            Self::Decompression(_) => false,
            Self::InvalidArgument(_) => false,
            Self::NotHeld { .. } => false,
            Self::InvalidState { .. } => false,
            Self::OutOfRange { .. } => false,
            Self::Unsupported(_) => false,
            Self::Interrupted => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

impl From<redis::RedisError> for CoordinationError {
    fn from(e: redis::RedisError) -> Self {
        Self::redis("unknown", e)
    }
}

impl From<serde_json::Error> for CoordinationError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_store() {
        let err = CoordinationError::store("EVALSHA", "connection reset");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("EVALSHA"));
    }

    #[test]
    fn test_is_retryable_change_feed() {
        let err = CoordinationError::ChangeFeed("stream trimmed".to_string());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_not_retryable_caller_errors() {
        assert!(!CoordinationError::InvalidArgument("empty lock name".into()).is_retryable());
        assert!(!CoordinationError::OutOfRange { key: "z".into() }.is_retryable());
        assert!(!CoordinationError::Unsupported("remove").is_retryable());
        assert!(!CoordinationError::NotHeld { name: "L".into() }.is_retryable());
    }

    #[test]
    fn test_not_retryable_data_errors() {
        assert!(!CoordinationError::Codec("expected value".into()).is_retryable());
        assert!(!CoordinationError::Decompression("invalid zstd header".into()).is_retryable());
    }

    #[test]
    fn test_not_retryable_lifecycle() {
        assert!(!CoordinationError::Interrupted.is_retryable());
        assert!(!CoordinationError::Shutdown.is_retryable());
        assert!(!CoordinationError::Internal("unexpected".into()).is_retryable());
    }

    #[test]
    fn test_invalid_state_formatting() {
        let err = CoordinationError::InvalidState {
            expected: "next() called".to_string(),
            actual: "no current element".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("next() called"));
        assert!(err.to_string().contains("no current element"));
    }

    #[test]
    fn test_not_held_formatting() {
        let err = CoordinationError::NotHeld { name: "orders".into() };
        assert!(err.to_string().contains("orders"));
    }

    #[test]
    fn test_json_error_converts_to_codec() {
        let parse: std::result::Result<u32, _> = serde_json::from_str("not json");
        let err: CoordinationError = parse.unwrap_err().into();
        assert!(matches!(err, CoordinationError::Codec(_)));
    }
}

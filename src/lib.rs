//! # Coordination Engine
//!
//! Distributed coordination primitives for processes that share one ordered
//! document store.
//!
//! ## Architecture
//!
//! Every primitive is a client of the store. Nothing is coordinated in
//! process memory except waiter bookkeeping; liveness comes from leases that
//! expire inside the store.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                          coordination-engine                              │
//! │                                                                           │
//! │  ┌─────────────┐    ┌──────────────┐    ┌──────────────────────────────┐  │
//! │  │ LockManager │    │ ReplayQueue  │    │ SortedMap / SortedSet        │  │
//! │  │ (heartbeat) │    │ (cursor)     │    │ (watermark iterators)        │  │
//! │  └─────────────┘    └──────────────┘    └──────────────────────────────┘  │
//! │         │  ▲               │  ▲                       │                   │
//! │         │  └─ ChangeWatcher┘  └─ (delete / insert events)                 │
//! │         ▼                  ▼                          ▼                   │
//! │  ┌─────────────────────────────────────────────────────────────────────┐  │
//! │  │ DocumentStore: MemoryStore | RedisStore (Lua + lex index + stream)  │  │
//! │  └─────────────────────────────────────────────────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Primitives
//!
//! 1. **Lock**: reentrant named lease, renewed by one heartbeat task per manager
//! 2. **Queue**: append-only broadcast log; every instance reads it from its own cursor
//! 3. **Sorted views**: lexicographic maps and sets with live range views
//!
//! ## Usage
//!
//! ```rust,no_run
//! use coordination_engine::{CoordinationConfig, Coordinator, OwnerToken};
//!
//! #[tokio::main]
//! async fn main() -> coordination_engine::Result<()> {
//!     let coordinator = Coordinator::connect(CoordinationConfig::default()).await?;
//!
//!     let locks = coordinator.lock_manager()?;
//!     let owner = OwnerToken::new();
//!     let lease = locks.lock("rebalance", &owner).await?;
//!     // ... critical section ...
//!     locks.unlock(lease).await?;
//!
//!     coordinator.shutdown();
//!     Ok(())
//! }
//! ```

pub mod circuit_breaker;
pub mod codec;
pub mod collections;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod queue;
pub mod resilience;
pub mod store;
pub mod watcher;

// Re-exports for convenience
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, StoreCircuit};
pub use codec::{Codec, Encoded, JsonCodec};
pub use collections::{SortedMap, SortedSet};
pub use config::{CoordinationConfig, LockConfig, QueueConfig, RedisConfig, StoreConfig, WatcherConfig};
pub use coordinator::{Coordinator, CoordinatorState};
pub use error::{CoordinationError, Result};
pub use lock::{Lease, LockManager, OwnerToken};
pub use queue::ReplayQueue;
pub use store::{DocumentStore, MemoryStore, RedisStore, StoreRef};
pub use watcher::{ChangeWatcher, WaitOutcome};

//! Coordinator state types.
//!
//! # State Transitions
//!
//! ```text
//!            (store opened)            shutdown()
//! Created ─────────────────→ Running ─────────────→ ShuttingDown
//!    │                                                   │
//!    │ shutdown()                                        │ (components stopped)
//!    └──────────────────────→ ShuttingDown ─────────────→ Stopped
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Constructed, store not yet available.
//! - **Running**: Store open. Components can be vended.
//! - **ShuttingDown**: `shutdown()` called. Heartbeats and watchers stopping.
//! - **Stopped**: Every vended component stopped. Lock records that were
//!   still held lapse on their own once their lease runs out.

/// Lifecycle of a [`Coordinator`](super::Coordinator).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Constructed; the store is still being opened.
    Created,

    /// Store open, components may be vended.
    Running,

    /// Stopping vended lock managers and queue watchers.
    ShuttingDown,

    /// Fully stopped. Vending now fails with `Shutdown`.
    Stopped,
}

impl CoordinatorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Running => "Running",
            Self::ShuttingDown => "ShuttingDown",
            Self::Stopped => "Stopped",
        }
    }
}

impl std::fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(CoordinatorState::Created.to_string(), "Created");
        assert_eq!(CoordinatorState::Running.to_string(), "Running");
        assert_eq!(CoordinatorState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(CoordinatorState::Stopped.to_string(), "Stopped");
    }

    #[test]
    fn test_state_equality() {
        assert_eq!(CoordinatorState::Created, CoordinatorState::Created);
        assert_ne!(CoordinatorState::Created, CoordinatorState::Running);
    }

    #[test]
    fn test_state_copy() {
        let state = CoordinatorState::Stopped;
        let copied: CoordinatorState = state;
        assert_eq!(state, copied);
    }
}

use std::fmt;

use crate::error::{Result, WorkerError};

/// Lifecycle of a worker process. A worker settles exactly once: either
/// into `Ready` (at least one live execution context) or `Errored` (none).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    #[default]
    Spawned,
    Initializing,
    Ready,
    Errored,
}

impl WorkerState {
    /// Whether initialization has settled (successfully or not).
    pub fn is_settled(self) -> bool {
        matches!(self, WorkerState::Ready | WorkerState::Errored)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Spawned => "spawned",
            WorkerState::Initializing => "initializing",
            WorkerState::Ready => "ready",
            WorkerState::Errored => "errored",
        };
        write!(f, "{}", name)
    }
}

/// Validate a lifecycle transition is allowed.
pub fn validate_transition(from: WorkerState, to: WorkerState) -> Result<()> {
    let valid = match from {
        WorkerState::Spawned => matches!(to, WorkerState::Initializing),
        WorkerState::Initializing => matches!(to, WorkerState::Ready | WorkerState::Errored),
        // Settled states are terminal.
        WorkerState::Ready | WorkerState::Errored => false,
    };

    if valid {
        Ok(())
    } else {
        Err(WorkerError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

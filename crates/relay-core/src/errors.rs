//! Error taxonomy for the session subsystem.
//!
//! Each component owns a narrow error enum. [`RelayError`] wraps them all
//! and classifies which failures are systemic (process-level alerting)
//! versus contained to a single connection or execution.

use thiserror::Error;

use crate::ids::{ConnectionId, ExecutionId, UserId};
use crate::state::ExecutionState;

/// Connection registry failures.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The connection ID is already tracked.
    #[error("connection already exists: {0}")]
    AlreadyExists(ConnectionId),
    /// No connection with this ID.
    #[error("connection not found: {0}")]
    ConnectionNotFound(ConnectionId),
}

/// Event delivery failures.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// The user has no open connection; the event was dropped.
    #[error("user {0} has no open connection")]
    NoConnection(UserId),
    /// No connection with this ID.
    #[error("connection not found: {0}")]
    ConnectionNotFound(ConnectionId),
    /// The connection is closing or closed.
    #[error("connection closed: {0}")]
    Closed(ConnectionId),
    /// The outbound queue overflowed and the connection was closed.
    #[error("slow consumer disconnected: {0}")]
    SlowConsumer(ConnectionId),
    /// The envelope could not be encoded even after substitution.
    #[error("event serialization failed: {0}")]
    Serialization(String),
}

/// Execution tracker failures.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TrackerError {
    /// No execution with this ID.
    #[error("execution not found: {0}")]
    ExecutionNotFound(ExecutionId),
    /// The requested transition is not in the state machine.
    #[error("invalid transition for {execution_id}: {from} -> {to}")]
    InvalidTransition {
        /// Execution being transitioned.
        execution_id: ExecutionId,
        /// Current state (unchanged).
        from: ExecutionState,
        /// Requested state.
        to: ExecutionState,
    },
    /// The execution already reached `Completed` or `Dead`.
    #[error("execution {execution_id} already terminal ({state})")]
    AlreadyTerminal {
        /// Execution in question.
        execution_id: ExecutionId,
        /// Its terminal state.
        state: ExecutionState,
    },
}

/// Failure reclaiming a single entry during graduated cleanup.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CleanupError {
    /// The connection vanished before it could be reclaimed.
    #[error("connection {0} could not be reclaimed")]
    Connection(ConnectionId),
    /// The execution vanished before it could be reclaimed.
    #[error("execution {0} could not be reclaimed")]
    Execution(ExecutionId),
}

/// Resource sampling failure.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SampleError {
    /// The process metrics source is unavailable.
    #[error("resource usage unavailable: {0}")]
    Unavailable(String),
}

/// Top-level error for the session subsystem.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    /// Registry bookkeeping.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Event delivery.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// Execution lifecycle.
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    /// Graduated cleanup.
    #[error(transparent)]
    Cleanup(#[from] CleanupError),
    /// Resource sampling.
    #[error(transparent)]
    Sample(#[from] SampleError),
    /// The agent type is barred by its circuit breaker.
    #[error("circuit open for agent {0}")]
    CircuitOpen(String),
}

impl RelayError {
    /// Whether the failure affects the whole process rather than one entity.
    pub fn is_systemic(&self) -> bool {
        matches!(self, Self::Sample(_))
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Registry(RegistryError::AlreadyExists(_)) => "ALREADY_EXISTS",
            Self::Registry(RegistryError::ConnectionNotFound(_))
            | Self::Dispatch(DispatchError::ConnectionNotFound(_)) => "CONNECTION_NOT_FOUND",
            Self::Dispatch(DispatchError::NoConnection(_)) => "NO_CONNECTION",
            Self::Dispatch(DispatchError::Closed(_)) => "CLOSED",
            Self::Dispatch(DispatchError::SlowConsumer(_)) => "SLOW_CONSUMER",
            Self::Dispatch(DispatchError::Serialization(_)) => "SERIALIZATION_ERROR",
            Self::Tracker(TrackerError::ExecutionNotFound(_)) => "EXECUTION_NOT_FOUND",
            Self::Tracker(TrackerError::InvalidTransition { .. }) => "INVALID_TRANSITION",
            Self::Tracker(TrackerError::AlreadyTerminal { .. }) => "ALREADY_TERMINAL",
            Self::Cleanup(_) => "CLEANUP_FAILURE",
            Self::Sample(_) => "SAMPLE_FAILURE",
            Self::CircuitOpen(_) => "CIRCUIT_OPEN",
        }
    }
}

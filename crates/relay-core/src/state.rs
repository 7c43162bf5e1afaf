//! Connection and execution lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of a single connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    /// Registered, writer task not yet running.
    Connecting = 0,
    /// Accepting outbound events.
    Open = 1,
    /// Close requested; queued events are being discarded.
    Closing = 2,
    /// Writer task finished and the transport was released.
    Closed = 3,
}

impl ConnectionState {
    /// Decode from the `u8` stored in an atomic.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }

    /// Whether the connection can no longer accept events.
    pub fn is_closed(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

/// Why a connection was closed. Sent to the client as the close-frame reason.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The client went away or sent a close frame.
    ClientClosed,
    /// The outbound queue overflowed.
    SlowConsumer,
    /// Reclaimed by graduated cleanup.
    ResourcePressure,
    /// A write to the underlying transport failed.
    TransportError,
    /// The process is shutting down.
    ServerShutdown,
}

impl CloseReason {
    /// Wire string for the close reason.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::SlowConsumer => "slow_consumer",
            Self::ResourcePressure => "resource_pressure",
            Self::TransportError => "transport_error",
            Self::ServerShutdown => "server_shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of an agent execution.
///
/// ```text
/// Started → Thinking → {ToolExecuting ⇄ ToolCompleted}* → Completed
///     └───────────── any non-terminal ─────────────→ Dead
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Run accepted, agent booting.
    Started,
    /// Model is reasoning.
    Thinking,
    /// A tool call is in flight.
    ToolExecuting,
    /// The last tool call returned.
    ToolCompleted,
    /// Finished normally.
    Completed,
    /// Heartbeat timed out.
    Dead,
}

impl ExecutionState {
    /// `Completed` and `Dead` admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Dead)
    }

    /// Whether `self → next` is a legal transition for the agent runtime.
    ///
    /// `Dead` is never reachable through this table; only the health
    /// monitor may kill an execution.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ExecutionState::{Completed, Started, Thinking, ToolCompleted, ToolExecuting};
        matches!(
            (self, next),
            (Started, Thinking)
                | (Thinking, ToolExecuting)
                | (ToolExecuting, ToolCompleted)
                | (ToolCompleted, ToolExecuting | Thinking | Completed)
        )
    }

    /// Snake-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Thinking => "thinking",
            Self::ToolExecuting => "tool_executing",
            Self::ToolCompleted => "tool_completed",
            Self::Completed => "completed",
            Self::Dead => "dead",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExecutionState::*;

    const ALL: [ExecutionState; 6] = [
        Started,
        Thinking,
        ToolExecuting,
        ToolCompleted,
        Completed,
        Dead,
    ];

    #[test]
    fn golden_path_is_legal() {
        let path = [Started, Thinking, ToolExecuting, ToolCompleted, Completed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn tool_loop_and_return_to_thinking() {
        assert!(ToolCompleted.can_transition_to(ToolExecuting));
        assert!(ToolCompleted.can_transition_to(Thinking));
    }

    #[test]
    fn terminal_states_admit_nothing() {
        for to in ALL {
            assert!(!Completed.can_transition_to(to));
            assert!(!Dead.can_transition_to(to));
        }
    }

    #[test]
    fn dead_never_in_table() {
        for from in ALL {
            assert!(!from.can_transition_to(Dead));
        }
    }

    #[test]
    fn skipping_states_rejected() {
        assert!(!Started.can_transition_to(Completed));
        assert!(!Started.can_transition_to(ToolExecuting));
        assert!(!Thinking.can_transition_to(Completed));
        assert!(!ToolExecuting.can_transition_to(Thinking));
    }

    #[test]
    fn connection_state_u8_roundtrip() {
        for s in [
            ConnectionState::Connecting,
            ConnectionState::Open,
            ConnectionState::Closing,
            ConnectionState::Closed,
        ] {
            assert_eq!(ConnectionState::from_u8(s as u8), s);
        }
    }

    #[test]
    fn close_reason_wire_names() {
        assert_eq!(CloseReason::SlowConsumer.as_str(), "slow_consumer");
        let json = serde_json::to_string(&CloseReason::ResourcePressure).unwrap();
        assert_eq!(json, "\"resource_pressure\"");
    }
}

//! # relay-core
//!
//! Foundation types shared by every relay crate:
//!
//! - **Branded IDs**: `UserId`, `ConnectionId`, `ExecutionId`, `ThreadId`, `RunId`
//! - **Lifecycle states**: `ConnectionState`, `ExecutionState` and the execution transition table
//! - **Wire envelope**: `EventKind`, `WireEvent`, `InboundMessage`
//! - **Payloads**: safe substitution of values that cannot round-trip through JSON
//! - **Errors**: per-component `thiserror` enums and the top-level `RelayError`
//! - **Logging**: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod errors;
pub mod events;
pub mod ids;
pub mod logging;
pub mod payload;
pub mod state;

pub use errors::{
    CleanupError, DispatchError, RegistryError, RelayError, SampleError, TrackerError,
};
pub use events::{EventKind, InboundMessage, WireEvent};
pub use ids::{ConnectionId, ExecutionId, RunId, ThreadId, UserId};
pub use state::{CloseReason, ConnectionState, ExecutionState};

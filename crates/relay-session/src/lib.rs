//! # relay-session
//!
//! Real-time session core of the relay:
//!
//! - **Registry**: connections per user, consistent under concurrent add/remove
//! - **Dispatch**: encode-once fan-out onto bounded per-connection queues
//! - **Execution tracking**: lifecycle state machine and the ordered event producer
//! - **Health**: heartbeat death detection and per-agent circuit breakers
//! - **Pressure**: resource sampling and graduated, monotonic cleanup
//!
//! [`SessionHub`] ties the pieces together. Transports plug in through the
//! [`Transport`] trait, so everything here runs without sockets.

#![deny(unsafe_code)]

pub mod connection;
pub mod dispatcher;
pub mod driver;
pub mod health;
pub mod hub;
pub mod metrics;
pub mod ops;
pub mod pressure;
pub mod registry;
pub mod sweep;
pub mod testutil;
pub mod tracker;
pub mod transport;

pub use connection::Connection;
pub use dispatcher::EventDispatcher;
pub use driver::ExecutionDriver;
pub use health::{AgentHealth, CircuitState, HealthMonitor, Liveness};
pub use hub::SessionHub;
pub use ops::{OpsSnapshot, UserLoad};
pub use pressure::{
    CleanupReport, PressureLevel, ProcessSampler, ResourcePressureController, ResourceSample,
    ResourceSampler,
};
pub use registry::ConnectionRegistry;
pub use tracker::{AgentExecution, ExecutionTracker};
pub use transport::{Transport, TransportError};

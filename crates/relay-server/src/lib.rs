//! # relay-server
//!
//! Axum gateway in front of the session core:
//!
//! - `GET /ws`: authenticate, then stream the user's events
//! - `GET /health`: liveness and headline counters
//! - `GET /ops`: per-user load, pressure, and agent health
//! - `GET /metrics`: Prometheus text
//!
//! The `relay` binary wires settings, logging, metrics and identity
//! verification together and runs until Ctrl-C.

#![deny(unsafe_code)]

pub mod auth;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use auth::{AuthError, IdentityVerifier, StaticTokenVerifier};
pub use server::{AppState, RelayServer};
pub use shutdown::ShutdownCoordinator;

//! `/health` endpoint.

use std::time::Instant;

use relay_session::{PressureLevel, SessionHub};
use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"`, or `"shutting_down"` once shutdown has begun.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Registered connections.
    pub connections: usize,
    /// Tracked executions.
    pub executions: usize,
    /// Current pressure level.
    pub pressure_level: PressureLevel,
}

/// Build a health response from the hub's live counters.
pub fn health_check(start_time: Instant, hub: &SessionHub, shutting_down: bool) -> HealthResponse {
    HealthResponse {
        status: if shutting_down { "shutting_down" } else { "ok" }.into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections: hub.registry().len(),
        executions: hub.tracker().len(),
        pressure_level: hub.pressure().level(),
    }
}

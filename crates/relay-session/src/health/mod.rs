//! Execution liveness and per-agent circuit breakers.

mod breaker;
mod monitor;

pub use breaker::{CircuitBreaker, CircuitState};
pub use monitor::{AgentHealth, DEATH_DETECTED, HealthMonitor, Liveness};

//! Liveness detection and circuit breaker settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Health monitor settings.
///
/// `death_threshold_ms` is the single process-wide heartbeat timeout used by
/// every liveness check.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthSettings {
    /// Heartbeat age after which an execution is declared dead.
    pub death_threshold_ms: u64,
    /// Interval between liveness sweeps.
    pub sweep_interval_ms: u64,
    /// Consecutive failures that open an agent's circuit.
    pub failure_threshold: u32,
    /// How long an open circuit waits before allowing a probe.
    pub cool_down_ms: u64,
    /// Number of recent latencies averaged into the health score.
    pub latency_window: usize,
    /// Latency at which the latency factor of the health score is 0.5.
    pub latency_reference_ms: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            death_threshold_ms: 30_000,
            sweep_interval_ms: 5_000,
            failure_threshold: 3,
            cool_down_ms: 60_000,
            latency_window: 20,
            latency_reference_ms: 10_000,
        }
    }
}

impl HealthSettings {
    /// Death threshold as a [`Duration`].
    pub fn death_threshold(&self) -> Duration {
        Duration::from_millis(self.death_threshold_ms)
    }

    /// Sweep interval as a [`Duration`].
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Circuit cool-down as a [`Duration`].
    pub fn cool_down(&self) -> Duration {
        Duration::from_millis(self.cool_down_ms)
    }

    /// Latency reference as a [`Duration`].
    pub fn latency_reference(&self) -> Duration {
        Duration::from_millis(self.latency_reference_ms)
    }
}

//! Settings type definitions.
//!
//! Every section uses `#[serde(default)]` so a settings file only needs the
//! keys it overrides.

mod health;
mod pressure;
mod server;

pub use health::HealthSettings;
pub use pressure::{PressureSettings, ThresholdPair};
pub use server::{LogLevel, LoggingSettings, ServerSettings, SessionSettings};

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings for the relay.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// HTTP/WebSocket gateway.
    pub server: ServerSettings,
    /// Per-connection delivery.
    pub session: SessionSettings,
    /// Liveness detection and circuit breakers.
    pub health: HealthSettings,
    /// Resource pressure and graduated cleanup.
    pub pressure: PressureSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl RelaySettings {
    /// Reject configurations the session core cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(SettingsError::InvalidValue(msg.to_string()));

        if self.session.outbound_queue_capacity == 0 {
            return invalid("session.outboundQueueCapacity must be > 0");
        }
        if self.server.auth_timeout_ms == 0 {
            return invalid("server.authTimeoutMs must be > 0");
        }
        if self.health.death_threshold_ms == 0 {
            return invalid("health.deathThresholdMs must be > 0");
        }
        if self.health.sweep_interval_ms == 0 {
            return invalid("health.sweepIntervalMs must be > 0");
        }
        if self.health.failure_threshold == 0 {
            return invalid("health.failureThreshold must be > 0");
        }
        if self.health.latency_window == 0 {
            return invalid("health.latencyWindow must be > 0");
        }
        if self.health.latency_reference_ms == 0 {
            return invalid("health.latencyReferenceMs must be > 0");
        }
        if self.pressure.sample_interval_ms == 0 {
            return invalid("pressure.sampleIntervalMs must be > 0");
        }

        let p = &self.pressure;
        if !(p.moderate.above(&p.conservative)
            && p.aggressive.above(&p.moderate)
            && p.force.above(&p.aggressive))
        {
            return invalid("pressure thresholds must strictly ascend conservative < moderate < aggressive < force");
        }

        let fractions = [
            p.conservative_max,
            p.moderate_max,
            p.aggressive_min,
            p.aggressive_max,
            p.escalation_failure_ratio,
        ];
        if fractions.iter().any(|f| !(0.0..=1.0).contains(f)) {
            return invalid("pressure fractions must be within [0, 1]");
        }
        if !(p.conservative_max <= p.moderate_max
            && p.moderate_max <= p.aggressive_max
            && p.aggressive_min <= p.aggressive_max)
        {
            return invalid("pressure fractions must not decrease with level");
        }
        Ok(())
    }
}

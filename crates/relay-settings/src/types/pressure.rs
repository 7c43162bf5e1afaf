//! Resource pressure thresholds and graduated cleanup targets.

use std::time::Duration;

use serde::{Deserialize, Serialize};

const MIB: u64 = 1024 * 1024;

/// Connection count and resident memory at which a level begins.
///
/// A level is reached when either indicator meets its threshold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdPair {
    /// Open connections.
    pub connections: usize,
    /// Process resident memory in bytes.
    pub memory_bytes: u64,
}

impl ThresholdPair {
    /// Create a threshold pair.
    pub const fn new(connections: usize, memory_bytes: u64) -> Self {
        Self {
            connections,
            memory_bytes,
        }
    }

    /// Whether either indicator meets this threshold.
    pub fn reached(&self, connections: usize, memory_bytes: u64) -> bool {
        connections >= self.connections || memory_bytes >= self.memory_bytes
    }

    /// Both indicators strictly above `other`'s.
    pub fn above(&self, other: &Self) -> bool {
        self.connections > other.connections && self.memory_bytes > other.memory_bytes
    }
}

/// Resource pressure controller settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PressureSettings {
    /// Interval between resource samples.
    pub sample_interval_ms: u64,
    /// Inactivity after which a connection or execution counts as idle.
    pub idle_threshold_ms: u64,
    /// Entry into `Conservative`.
    pub conservative: ThresholdPair,
    /// Entry into `Moderate`.
    pub moderate: ThresholdPair,
    /// Entry into `Aggressive`.
    pub aggressive: ThresholdPair,
    /// Entry into `Force`.
    pub force: ThresholdPair,
    /// Upper bound on the fraction of eligible entries cleaned at `Conservative`.
    pub conservative_max: f64,
    /// Upper bound on the fraction cleaned at `Moderate`.
    pub moderate_max: f64,
    /// Lower bound on the fraction cleaned at `Aggressive`.
    pub aggressive_min: f64,
    /// Upper bound on the fraction cleaned at `Aggressive`.
    pub aggressive_max: f64,
    /// Failed/attempted ratio above which the next sweep escalates one level.
    pub escalation_failure_ratio: f64,
}

impl Default for PressureSettings {
    fn default() -> Self {
        Self {
            sample_interval_ms: 10_000,
            idle_threshold_ms: 600_000,
            conservative: ThresholdPair::new(1_000, 512 * MIB),
            moderate: ThresholdPair::new(2_000, 1024 * MIB),
            aggressive: ThresholdPair::new(4_000, 2048 * MIB),
            force: ThresholdPair::new(8_000, 3072 * MIB),
            conservative_max: 0.3,
            moderate_max: 0.6,
            aggressive_min: 0.6,
            aggressive_max: 0.9,
            escalation_failure_ratio: 0.5,
        }
    }
}

impl PressureSettings {
    /// Sample interval as a [`Duration`].
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    /// Idle threshold as a [`Duration`].
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_millis(self.idle_threshold_ms)
    }
}

//! Graduated pressure levels.

use std::fmt;

use relay_settings::PressureSettings;
use serde::Serialize;

use super::sampler::ResourceSample;

/// How hard graduated cleanup should reclaim.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    /// Below every threshold; nothing is reclaimed.
    #[default]
    Normal,
    /// Reclaim entries that are already finished or closed.
    Conservative,
    /// Also reclaim idle entries.
    Moderate,
    /// Also reclaim least-recently-active live entries.
    Aggressive,
    /// Reclaim everything except one live entry per active user.
    Force,
}

impl PressureLevel {
    /// Every level, mildest first.
    pub const ALL: [Self; 5] = [
        Self::Normal,
        Self::Conservative,
        Self::Moderate,
        Self::Aggressive,
        Self::Force,
    ];

    /// Highest level whose threshold pair the sample reaches.
    pub fn from_sample(sample: &ResourceSample, settings: &PressureSettings) -> Self {
        let reached = |t: &relay_settings::ThresholdPair| {
            t.reached(sample.connections, sample.memory_bytes)
        };
        if reached(&settings.force) {
            Self::Force
        } else if reached(&settings.aggressive) {
            Self::Aggressive
        } else if reached(&settings.moderate) {
            Self::Moderate
        } else if reached(&settings.conservative) {
            Self::Conservative
        } else {
            Self::Normal
        }
    }

    /// The next level up, saturating at `Force`.
    pub fn escalate(self) -> Self {
        match self {
            Self::Normal => Self::Conservative,
            Self::Conservative => Self::Moderate,
            Self::Moderate => Self::Aggressive,
            Self::Aggressive | Self::Force => Self::Force,
        }
    }

    /// Snake-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Conservative => "conservative",
            Self::Moderate => "moderate",
            Self::Aggressive => "aggressive",
            Self::Force => "force",
        }
    }

    /// Numeric value for the `pressure_level` gauge.
    pub fn gauge_value(self) -> f64 {
        f64::from(self as u8)
    }
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

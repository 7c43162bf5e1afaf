//! Operator view of the subsystem.

use std::collections::BTreeMap;

use relay_core::UserId;
use serde::Serialize;

use crate::health::AgentHealth;
use crate::pressure::{CleanupReport, PressureLevel, ResourceSample};

/// Per-user load.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLoad {
    /// Registered connections.
    pub connections: usize,
    /// Frames waiting across the user's connections.
    pub queued_events: usize,
    /// Tracked executions, terminal included.
    pub executions: usize,
}

/// Point-in-time snapshot served at `/ops`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsSnapshot {
    /// Current pressure level.
    pub pressure_level: PressureLevel,
    /// Last resource reading, if any succeeded.
    pub last_sample: Option<ResourceSample>,
    /// Last cleanup pass.
    pub last_cleanup: Option<CleanupReport>,
    /// Registered connections.
    pub connections: usize,
    /// Tracked executions.
    pub executions: usize,
    /// Load keyed by user.
    pub users: BTreeMap<UserId, UserLoad>,
    /// Health of every agent type seen.
    pub agents: Vec<AgentHealth>,
}

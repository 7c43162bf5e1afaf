//! Graduated cleanup under resource pressure.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use relay_core::events;
use relay_core::{
    CleanupError, CloseReason, ConnectionId, DispatchError, ExecutionId, SampleError,
};
use relay_settings::PressureSettings;
use serde::Serialize;
use serde_json::{Map, json};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::level::PressureLevel;
use super::policy::{self, Candidate, Tier};
use super::sampler::{ResourceSample, ResourceSampler};
use crate::connection::Connection;
use crate::dispatcher::EventDispatcher;
use crate::health::HealthMonitor;
use crate::metrics::{
    CLEANUP_ENTRIES_TOTAL, CLEANUP_FAILURES_TOTAL, PRESSURE_LEVEL, RESOURCE_SAMPLE_FAILURES_TOTAL,
};
use crate::registry::ConnectionRegistry;
use crate::tracker::{AgentExecution, ExecutionTracker};

/// Reason carried by the notice sent for a running execution that was reclaimed.
pub const EVICTED_UNDER_PRESSURE: &str = "evicted_under_pressure";

/// Estimated fixed footprint of one connection, in bytes.
pub const CONNECTION_FOOTPRINT_BYTES: u64 = 64 * 1024;
/// Estimated footprint of one queued frame, in bytes.
pub const QUEUED_FRAME_FOOTPRINT_BYTES: u64 = 1024;
/// Estimated footprint of one tracked execution, in bytes.
pub const EXECUTION_FOOTPRINT_BYTES: u64 = 16 * 1024;

/// Outcome of one cleanup pass.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    /// Level the pass ran at.
    pub level: PressureLevel,
    /// Executions reclaimed.
    pub managers_cleaned: usize,
    /// Connections reclaimed.
    pub connections_cleaned: usize,
    /// Entries the pass tried to reclaim.
    pub attempted: usize,
    /// Entries that could not be reclaimed.
    pub failed: usize,
    /// Rough estimate of bytes released.
    pub memory_freed_estimate: u64,
    /// When the pass finished.
    pub finished_at: DateTime<Utc>,
}

impl CleanupReport {
    /// Fraction of attempted entries that failed. Zero when nothing was attempted.
    pub fn failure_ratio(&self) -> f64 {
        if self.attempted == 0 {
            0.0
        } else {
            self.failed as f64 / self.attempted as f64
        }
    }
}

#[derive(Default)]
struct ControllerState {
    level: PressureLevel,
    escalate_from: Option<PressureLevel>,
    last_sample: Option<ResourceSample>,
    last_report: Option<CleanupReport>,
}

/// Samples resource usage and reclaims connections and executions in
/// proportion to the measured pressure.
pub struct ResourcePressureController {
    registry: Arc<ConnectionRegistry>,
    tracker: Arc<ExecutionTracker>,
    dispatcher: Arc<EventDispatcher>,
    monitor: Arc<HealthMonitor>,
    sampler: Arc<dyn ResourceSampler>,
    config: PressureSettings,
    state: Mutex<ControllerState>,
}

/// Entries chosen for one pass, in reclaim order.
#[derive(Debug)]
pub(crate) struct CleanupPlan {
    level: PressureLevel,
    executions: Vec<ExecutionId>,
    connections: Vec<ConnectionId>,
}

impl ResourcePressureController {
    /// Create a controller. Running executions it reclaims count as
    /// failures against their agent in `monitor`.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        tracker: Arc<ExecutionTracker>,
        dispatcher: Arc<EventDispatcher>,
        monitor: Arc<HealthMonitor>,
        sampler: Arc<dyn ResourceSampler>,
        config: PressureSettings,
    ) -> Self {
        Self {
            registry,
            tracker,
            dispatcher,
            monitor,
            sampler,
            config,
            state: Mutex::new(ControllerState::default()),
        }
    }

    /// Take a sample and compute the current level.
    ///
    /// A failed sample is systemic: it is reported and the level is left
    /// unchanged.
    pub fn sample(&self) -> Result<PressureLevel, SampleError> {
        let sample = match self.sampler.sample() {
            Ok(sample) => sample,
            Err(e) => {
                counter!(RESOURCE_SAMPLE_FAILURES_TOTAL).increment(1);
                error!(error = %e, "resource sampling failed");
                return Err(e);
            }
        };

        let measured = PressureLevel::from_sample(&sample, &self.config);
        let mut state = self.state.lock();
        let level = match state.escalate_from.take() {
            Some(previous) => measured.max(previous.escalate()),
            None => measured,
        };
        if level != state.level {
            info!(
                from = %state.level,
                to = %level,
                connections = sample.connections,
                memory_bytes = sample.memory_bytes,
                "pressure level changed"
            );
        }
        state.level = level;
        state.last_sample = Some(sample);
        gauge!(PRESSURE_LEVEL).set(level.gauge_value());
        Ok(level)
    }

    /// Sample, then clean up if the level is above `Normal`.
    pub fn run_once(&self, now: Instant) -> Result<Option<CleanupReport>, SampleError> {
        let level = self.sample()?;
        if level == PressureLevel::Normal {
            return Ok(None);
        }
        Ok(Some(self.cleanup(level, now)))
    }

    /// Reclaim entries for `level`.
    ///
    /// Executions go first so eviction notices can still reach their owners.
    pub fn cleanup(&self, level: PressureLevel, now: Instant) -> CleanupReport {
        let plan = self.plan(level, now);
        self.apply(plan, now)
    }

    /// Select what a pass at `level` would reclaim, without touching anything.
    pub(crate) fn plan(&self, level: PressureLevel, now: Instant) -> CleanupPlan {
        let idle = self.config.idle_threshold();

        let executions = self.tracker.snapshot();
        let execution_pool: Vec<Candidate<ExecutionId>> = executions
            .iter()
            .map(|e| execution_candidate(e, idle, now))
            .collect();
        let execution_targets = policy::select(&execution_pool, level, &self.config);

        let connections = self.registry.all();
        let connection_pool: Vec<Candidate<ConnectionId>> = connections
            .iter()
            .map(|c| connection_candidate(c, idle, now))
            .collect();
        let connection_targets = policy::select(&connection_pool, level, &self.config);

        CleanupPlan {
            level,
            executions: execution_targets,
            connections: connection_targets,
        }
    }

    /// Reclaim a planned selection. Entries that went away in the meantime
    /// count as failures; the pass always runs to the end.
    pub(crate) fn apply(&self, plan: CleanupPlan, now: Instant) -> CleanupReport {
        let CleanupPlan {
            level,
            executions: execution_targets,
            connections: connection_targets,
        } = plan;

        let mut report = CleanupReport {
            level,
            managers_cleaned: 0,
            connections_cleaned: 0,
            attempted: execution_targets.len() + connection_targets.len(),
            failed: 0,
            memory_freed_estimate: 0,
            finished_at: Utc::now(),
        };

        for id in &execution_targets {
            match self.evict_execution(id, now) {
                Ok(()) => {
                    report.managers_cleaned += 1;
                    report.memory_freed_estimate += EXECUTION_FOOTPRINT_BYTES;
                }
                Err(e) => {
                    report.failed += 1;
                    counter!(CLEANUP_FAILURES_TOTAL, "kind" => "execution").increment(1);
                    warn!(error = %e, level = %level, "cleanup entry failed");
                }
            }
        }

        for id in &connection_targets {
            match self.evict_connection(id) {
                Ok(freed) => {
                    report.connections_cleaned += 1;
                    report.memory_freed_estimate += freed;
                }
                Err(e) => {
                    report.failed += 1;
                    counter!(CLEANUP_FAILURES_TOTAL, "kind" => "connection").increment(1);
                    warn!(error = %e, level = %level, "cleanup entry failed");
                }
            }
        }

        counter!(CLEANUP_ENTRIES_TOTAL, "kind" => "execution")
            .increment(report.managers_cleaned as u64);
        counter!(CLEANUP_ENTRIES_TOTAL, "kind" => "connection")
            .increment(report.connections_cleaned as u64);
        report.finished_at = Utc::now();
        info!(
            level = %level,
            executions = report.managers_cleaned,
            connections = report.connections_cleaned,
            attempted = report.attempted,
            failed = report.failed,
            freed_estimate = report.memory_freed_estimate,
            "cleanup pass finished"
        );
        self.note_report(report.clone());
        report
    }

    /// Current level.
    pub fn level(&self) -> PressureLevel {
        self.state.lock().level
    }

    /// Most recent successful sample.
    pub fn last_sample(&self) -> Option<ResourceSample> {
        self.state.lock().last_sample
    }

    /// Most recent cleanup report.
    pub fn last_report(&self) -> Option<CleanupReport> {
        self.state.lock().last_report.clone()
    }

    /// Whether the next sample escalates past the measured level.
    pub fn escalation_pending(&self) -> bool {
        self.state.lock().escalate_from.is_some()
    }

    /// Settings in effect.
    pub fn config(&self) -> &PressureSettings {
        &self.config
    }

    fn note_report(&self, report: CleanupReport) {
        let mut state = self.state.lock();
        if report.failure_ratio() > self.config.escalation_failure_ratio {
            warn!(
                level = %report.level,
                failed = report.failed,
                attempted = report.attempted,
                "cleanup mostly failed, escalating next sweep"
            );
            state.escalate_from = Some(report.level);
        }
        state.last_report = Some(report);
    }

    fn evict_execution(&self, id: &ExecutionId, now: Instant) -> Result<(), CleanupError> {
        let execution = self
            .tracker
            .remove(id)
            .ok_or_else(|| CleanupError::Execution(id.clone()))?;
        if execution.state.is_terminal() {
            return Ok(());
        }
        // Never reports back, so it must not hold a half-open probe slot.
        self.monitor.record_failure(&execution.agent_name, now);

        let mut extra = Map::new();
        let _ = extra.insert("reason".into(), json!(EVICTED_UNDER_PRESSURE));
        let _ = extra.insert("agentName".into(), json!(execution.agent_name));
        let notice = events::agent_completed(id, false, extra);
        match self.dispatcher.send(&execution.user_id, &notice) {
            Ok(_) | Err(DispatchError::NoConnection(_)) => {}
            Err(e) => debug!(execution_id = %id, error = %e, "eviction notice not delivered"),
        }
        Ok(())
    }

    fn evict_connection(&self, id: &ConnectionId) -> Result<u64, CleanupError> {
        let connection = self
            .registry
            .remove(id)
            .map_err(|_| CleanupError::Connection(id.clone()))?;
        let freed = CONNECTION_FOOTPRINT_BYTES
            + connection.queued() as u64 * QUEUED_FRAME_FOOTPRINT_BYTES;
        let _ = connection.close(CloseReason::ResourcePressure);
        Ok(freed)
    }
}

impl fmt::Debug for ResourcePressureController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePressureController")
            .field("level", &self.level())
            .finish_non_exhaustive()
    }
}

fn connection_candidate(
    connection: &Arc<Connection>,
    idle: std::time::Duration,
    now: Instant,
) -> Candidate<ConnectionId> {
    let tier = if !connection.is_open() {
        Tier::Stale
    } else if connection.idle_for(now) > idle {
        Tier::Idle
    } else {
        Tier::Live
    };
    Candidate {
        key: connection.id().clone(),
        owner: connection.user_id().clone(),
        tier,
        last_active: connection.last_activity(),
    }
}

fn execution_candidate(
    execution: &AgentExecution,
    idle: std::time::Duration,
    now: Instant,
) -> Candidate<ExecutionId> {
    let tier = if execution.state.is_terminal() {
        Tier::Stale
    } else if execution.silent_for(now) > idle {
        Tier::Idle
    } else {
        Tier::Live
    };
    Candidate {
        key: execution.id.clone(),
        owner: execution.user_id.clone(),
        tier,
        last_active: execution.last_heartbeat,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FixedSampler, Recording, RecordingTransport};
    use crate::health::CircuitState;
    use relay_core::{ExecutionState, UserId};
    use relay_settings::{HealthSettings, ThresholdPair};
    use std::time::Duration;

    const COOL_DOWN: Duration = Duration::from_secs(60);

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        tracker: Arc<ExecutionTracker>,
        monitor: Arc<HealthMonitor>,
        sampler: Arc<FixedSampler>,
        controller: ResourcePressureController,
    }

    fn settings() -> PressureSettings {
        PressureSettings {
            idle_threshold_ms: 60_000,
            conservative: ThresholdPair::new(10, u64::MAX),
            moderate: ThresholdPair::new(50, u64::MAX),
            aggressive: ThresholdPair::new(200, u64::MAX),
            force: ThresholdPair::new(400, u64::MAX),
            ..PressureSettings::default()
        }
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new(16));
        let tracker = Arc::new(ExecutionTracker::new());
        let dispatcher = Arc::new(EventDispatcher::new(Arc::clone(&registry)));
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&tracker),
            Arc::clone(&dispatcher),
            HealthSettings {
                failure_threshold: 1,
                cool_down_ms: 60_000,
                ..HealthSettings::default()
            },
        ));
        let sampler = Arc::new(FixedSampler::new(0, 0));
        let controller = ResourcePressureController::new(
            Arc::clone(&registry),
            Arc::clone(&tracker),
            dispatcher,
            Arc::clone(&monitor),
            Arc::clone(&sampler) as Arc<dyn ResourceSampler>,
            settings(),
        );
        Fixture {
            registry,
            tracker,
            monitor,
            sampler,
            controller,
        }
    }

    fn connect(registry: &ConnectionRegistry, user: &str, conn: &str) -> Recording {
        let (transport, recording) = RecordingTransport::new();
        let _ = registry
            .add(user.into(), conn.into(), Box::new(transport))
            .unwrap();
        recording
    }

    #[tokio::test(start_paused = true)]
    async fn normal_pressure_does_nothing() {
        let f = fixture();
        let _rec = connect(&f.registry, "u1", "c1");
        assert_eq!(f.controller.run_once(Instant::now()).unwrap(), None);
        assert_eq!(f.registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn moderate_reclaims_idle_connections() {
        let f = fixture();
        let mut idle = Vec::new();
        for i in 0..40 {
            idle.push(connect(&f.registry, &format!("idle{i}"), &format!("i{i}")));
        }
        tokio::time::advance(Duration::from_secs(120)).await;
        let mut live = Vec::new();
        for i in 0..60 {
            live.push(connect(&f.registry, &format!("live{i}"), &format!("l{i}")));
        }
        f.sampler.set(100, 0);

        let report = f.controller.run_once(Instant::now()).unwrap().unwrap();
        assert_eq!(report.level, PressureLevel::Moderate);
        assert_eq!(report.connections_cleaned, 40);
        assert_eq!(report.failed, 0);
        assert_eq!(f.registry.len(), 60);
        assert!(f.registry.get(&"i0".into()).is_none());
        assert!(f.registry.get(&"l0".into()).is_some());

        idle[0].wait_closed().await;
        assert_eq!(idle[0].close_reason(), Some(CloseReason::ResourcePressure));
        assert_eq!(f.controller.last_report(), Some(report));
    }

    #[tokio::test(start_paused = true)]
    async fn conservative_reclaims_terminal_executions_only() {
        let f = fixture();
        let user: UserId = "u1".into();
        let done = f
            .tracker
            .start_execution(user.clone(), "a", "t".into(), "r".into());
        let running = f
            .tracker
            .start_execution(user.clone(), "a", "t".into(), "r".into());
        let now = Instant::now();
        for to in [
            ExecutionState::Thinking,
            ExecutionState::ToolExecuting,
            ExecutionState::ToolCompleted,
            ExecutionState::Completed,
        ] {
            f.tracker.transition(&done, to, now).unwrap();
        }

        let report = f.controller.cleanup(PressureLevel::Conservative, now);
        assert_eq!(report.managers_cleaned, 1);
        assert!(f.tracker.get(&done).is_err());
        assert!(f.tracker.get(&running).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn force_keeps_one_connection_per_active_user() {
        let f = fixture();
        let mut recs = Vec::new();
        for i in 0..5 {
            recs.push(connect(&f.registry, "u1", &format!("a{i}")));
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        recs.push(connect(&f.registry, "u2", "b0"));

        let report = f.controller.cleanup(PressureLevel::Force, Instant::now());
        assert_eq!(report.connections_cleaned, 4);
        assert_eq!(f.registry.len(), 2);
        assert!(f.registry.get(&"a4".into()).is_some());
        assert!(f.registry.get(&"b0".into()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn evicting_running_execution_notifies_owner() {
        let f = fixture();
        let rec = connect(&f.registry, "u1", "c1");
        let id = f
            .tracker
            .start_execution("u1".into(), "researcher", "t".into(), "r".into());
        tokio::time::advance(Duration::from_secs(120)).await;
        f.registry.get(&"c1".into()).unwrap().touch();

        let report = f.controller.cleanup(PressureLevel::Moderate, Instant::now());
        assert_eq!(report.managers_cleaned, 1);
        assert!(f.tracker.get(&id).is_err());

        rec.wait_for_frames(1).await;
        let notice = &rec.events()[0];
        assert_eq!(notice.success(), Some(false));
        assert_eq!(notice.data["reason"], EVICTED_UNDER_PRESSURE);
    }

    #[tokio::test(start_paused = true)]
    async fn aggressive_closes_oldest_live_connections() {
        let f = fixture();
        let mut recs = Vec::new();
        for i in 0..10 {
            recs.push(connect(&f.registry, "u1", &format!("a{i}")));
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        let _b = connect(&f.registry, "u2", "b0");

        let report = f.controller.cleanup(PressureLevel::Aggressive, Instant::now());
        // ceil(0.6 * 11) = 7, taken oldest first from the unprotected nine.
        assert_eq!(report.connections_cleaned, 7);
        assert_eq!(report.failed, 0);
        for i in 0..7 {
            assert!(f.registry.get(&format!("a{i}").as_str().into()).is_none());
        }
        for id in ["a7", "a8", "a9", "b0"] {
            assert!(f.registry.get(&id.into()).is_some(), "{id} evicted");
        }

        recs[0].wait_closed().await;
        assert_eq!(recs[0].close_reason(), Some(CloseReason::ResourcePressure));
        assert!(recs[9].close_reason().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_targets_fail_and_escalate_next_sample() {
        let f = fixture();
        let mut recs = Vec::new();
        for i in 0..4 {
            recs.push(connect(&f.registry, &format!("idle{i}"), &format!("i{i}")));
        }
        tokio::time::advance(Duration::from_secs(120)).await;
        for i in 0..6 {
            recs.push(connect(&f.registry, &format!("live{i}"), &format!("l{i}")));
        }
        f.sampler.set(20, 0);
        assert_eq!(f.controller.sample().unwrap(), PressureLevel::Conservative);

        let plan = f.controller.plan(PressureLevel::Moderate, Instant::now());
        assert_eq!(plan.connections.len(), 4);
        // Clients leave between selection and eviction.
        for id in &plan.connections[..3] {
            let _ = f.registry.remove(id).unwrap();
        }

        let report = f.controller.apply(plan, Instant::now());
        assert_eq!(report.attempted, 4);
        assert_eq!(report.failed, 3);
        assert_eq!(report.connections_cleaned, 1);
        assert_eq!(f.registry.len(), 6);
        assert!(f.controller.escalation_pending());

        assert_eq!(f.controller.sample().unwrap(), PressureLevel::Aggressive);
        assert!(!f.controller.escalation_pending());
        assert_eq!(f.controller.sample().unwrap(), PressureLevel::Conservative);
    }

    #[tokio::test(start_paused = true)]
    async fn clean_pass_does_not_escalate() {
        let f = fixture();
        let _rec = connect(&f.registry, "u1", "c1");
        tokio::time::advance(Duration::from_secs(120)).await;
        let _live = connect(&f.registry, "u2", "c2");
        f.sampler.set(20, 0);

        let report = f.controller.run_once(Instant::now()).unwrap().unwrap();
        assert_eq!(report.failed, 0);
        assert!(!f.controller.escalation_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn evicting_half_open_trial_reopens_circuit() {
        let f = fixture();
        let _rec = connect(&f.registry, "u1", "c1");
        let opened = Instant::now();
        f.monitor.record_failure("flaky", opened);
        tokio::time::advance(COOL_DOWN).await;

        assert!(f.monitor.allow_execution("flaky", Instant::now()));
        let probe = f
            .tracker
            .start_execution("u1".into(), "flaky", "t".into(), "r".into());
        tokio::time::advance(Duration::from_millis(10)).await;
        let _steady = f
            .tracker
            .start_execution("u1".into(), "steady", "t".into(), "r".into());

        let report = f.controller.cleanup(PressureLevel::Force, Instant::now());
        assert_eq!(report.managers_cleaned, 1);
        assert!(f.tracker.get(&probe).is_err());

        let evicted_at = Instant::now();
        assert_matches::assert_matches!(
            f.monitor.circuit_state("flaky", evicted_at),
            CircuitState::Open { since } if since == evicted_at
        );
        tokio::time::advance(COOL_DOWN).await;
        assert!(f.monitor.allow_execution("flaky", Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn sample_failure_keeps_level() {
        let f = fixture();
        f.sampler.set(60, 0);
        assert_eq!(f.controller.sample().unwrap(), PressureLevel::Moderate);
        f.sampler.fail("procfs unavailable");
        assert!(f.controller.run_once(Instant::now()).is_err());
        assert_eq!(f.controller.level(), PressureLevel::Moderate);
    }
}

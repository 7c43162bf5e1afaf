//! Heartbeat-based death detection and per-agent health.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use relay_core::{DispatchError, ExecutionId, ExecutionState, TrackerError, events};
use relay_settings::HealthSettings;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::breaker::{CircuitBreaker, CircuitState};
use crate::dispatcher::EventDispatcher;
use crate::metrics::{CIRCUIT_OPEN, EXECUTIONS_DEAD_TOTAL};
use crate::tracker::ExecutionTracker;

/// `reason` carried by the terminal event of a timed-out execution.
pub const DEATH_DETECTED: &str = "death_detected";

/// Liveness verdict.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Liveness {
    /// Heartbeat within the threshold, or completed normally.
    Alive,
    /// Heartbeat timed out.
    Dead,
}

/// Per-agent health, as reported to operators.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHealth {
    /// Agent type.
    pub agent: String,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Aggregate score in `[0, 1]`.
    pub score: f64,
    /// Breaker state.
    pub circuit: CircuitState,
}

struct HealthRecord {
    breaker: CircuitBreaker,
    latencies: VecDeque<Duration>,
}

impl HealthRecord {
    fn average_latency(&self) -> Duration {
        if self.latencies.is_empty() {
            return Duration::ZERO;
        }
        self.latencies.iter().sum::<Duration>() / self.latencies.len() as u32
    }
}

/// Death detection plus circuit breakers keyed by agent name.
pub struct HealthMonitor {
    tracker: Arc<ExecutionTracker>,
    dispatcher: Arc<EventDispatcher>,
    config: HealthSettings,
    records: Mutex<HashMap<String, HealthRecord>>,
}

impl HealthMonitor {
    /// Create a monitor. `config.death_threshold_ms` is the single
    /// process-wide heartbeat timeout.
    pub fn new(
        tracker: Arc<ExecutionTracker>,
        dispatcher: Arc<EventDispatcher>,
        config: HealthSettings,
    ) -> Self {
        Self {
            tracker,
            dispatcher,
            config,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Verdict for one execution at `now`.
    ///
    /// A heartbeat older than the death threshold marks the execution `Dead`,
    /// counts a failure against its agent, and sends the owner exactly one
    /// `agent_completed {success: false, reason: "death_detected"}`.
    pub fn check_liveness(
        &self,
        execution_id: &ExecutionId,
        now: Instant,
    ) -> Result<Liveness, TrackerError> {
        let execution = self.tracker.get(execution_id)?;
        match execution.state {
            ExecutionState::Dead => return Ok(Liveness::Dead),
            ExecutionState::Completed => return Ok(Liveness::Alive),
            _ => {}
        }
        if execution.silent_for(now) <= self.config.death_threshold() {
            return Ok(Liveness::Alive);
        }

        let dead = match self.tracker.mark_dead(execution_id, DEATH_DETECTED, now) {
            Ok(dead) => dead,
            // Lost the race: someone else finished or killed it first.
            Err(TrackerError::AlreadyTerminal { state, .. }) => {
                return Ok(if state == ExecutionState::Dead {
                    Liveness::Dead
                } else {
                    Liveness::Alive
                });
            }
            Err(e) => return Err(e),
        };

        counter!(EXECUTIONS_DEAD_TOTAL).increment(1);
        info!(
            execution_id = %dead.id,
            user_id = %dead.user_id,
            agent = %dead.agent_name,
            silent_ms = execution.silent_for(now).as_millis() as u64,
            "execution declared dead"
        );
        self.record_failure(&dead.agent_name, now);

        let event = events::agent_failed(&dead.id, DEATH_DETECTED, &dead.agent_name);
        match self.dispatcher.send(&dead.user_id, &event) {
            Ok(_) => {}
            Err(DispatchError::NoConnection(_)) => {
                debug!(execution_id = %dead.id, "owner offline, death notice dropped");
            }
            Err(e) => warn!(execution_id = %dead.id, error = %e, "death notice not delivered"),
        }
        Ok(Liveness::Dead)
    }

    /// Check every non-terminal execution. Returns the ones found dead.
    pub fn sweep(&self, now: Instant) -> Vec<ExecutionId> {
        self.tracker
            .non_terminal()
            .into_iter()
            .filter(|id| matches!(self.check_liveness(id, now), Ok(Liveness::Dead)))
            .collect()
    }

    /// Whether the agent's circuit admits a new execution at `now`.
    pub fn allow_execution(&self, agent: &str, now: Instant) -> bool {
        let mut records = self.records.lock();
        let record = self.record_mut(&mut records, agent);
        record.breaker.allow(now)
    }

    /// Record a successful execution and its latency.
    pub fn record_success(&self, agent: &str, latency: Duration) {
        let mut records = self.records.lock();
        let window = self.config.latency_window.max(1);
        let record = self.record_mut(&mut records, agent);
        record.breaker.record_success();
        record.latencies.push_back(latency);
        while record.latencies.len() > window {
            let _ = record.latencies.pop_front();
        }
        gauge!(CIRCUIT_OPEN, "agent" => agent.to_string()).set(0.0);
    }

    /// Record a failed execution.
    pub fn record_failure(&self, agent: &str, now: Instant) {
        let mut records = self.records.lock();
        let record = self.record_mut(&mut records, agent);
        if record.breaker.record_failure(now) {
            gauge!(CIRCUIT_OPEN, "agent" => agent.to_string()).set(1.0);
            warn!(
                agent,
                failures = record.breaker.consecutive_failures(),
                cool_down_ms = self.config.cool_down_ms,
                "circuit opened"
            );
        }
    }

    /// Aggregate health in `[0, 1]`, for reporting only.
    ///
    /// `1/(1 + failures) × 1/(1 + avg_latency/reference)`: strictly
    /// decreasing in consecutive failures and in average recent latency.
    pub fn health_score(&self, agent: &str) -> f64 {
        let records = self.records.lock();
        records
            .get(agent)
            .map_or(1.0, |r| self.score(r))
    }

    /// Breaker state at `now`.
    pub fn circuit_state(&self, agent: &str, now: Instant) -> CircuitState {
        let mut records = self.records.lock();
        records
            .get_mut(agent)
            .map_or(CircuitState::Closed, |r| r.breaker.state(now))
    }

    /// Health of every agent seen so far, sorted by name.
    pub fn agents(&self, now: Instant) -> Vec<AgentHealth> {
        let mut records = self.records.lock();
        let mut agents: Vec<AgentHealth> = records
            .iter_mut()
            .map(|(agent, record)| AgentHealth {
                agent: agent.clone(),
                consecutive_failures: record.breaker.consecutive_failures(),
                score: self.score(record),
                circuit: record.breaker.state(now),
            })
            .collect();
        agents.sort_by(|a, b| a.agent.cmp(&b.agent));
        agents
    }

    /// The configured death threshold.
    pub fn death_threshold(&self) -> Duration {
        self.config.death_threshold()
    }

    fn record_mut<'a>(
        &self,
        records: &'a mut HashMap<String, HealthRecord>,
        agent: &str,
    ) -> &'a mut HealthRecord {
        records
            .entry(agent.to_string())
            .or_insert_with(|| HealthRecord {
                breaker: CircuitBreaker::new(self.config.failure_threshold, self.config.cool_down()),
                latencies: VecDeque::with_capacity(self.config.latency_window),
            })
    }

    fn score(&self, record: &HealthRecord) -> f64 {
        let failures = f64::from(record.breaker.consecutive_failures());
        let reference = self.config.latency_reference().as_secs_f64().max(f64::EPSILON);
        let latency = record.average_latency().as_secs_f64() / reference;
        (1.0 / (1.0 + failures) * 1.0 / (1.0 + latency)).clamp(0.0, 1.0)
    }
}

impl fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("death_threshold_ms", &self.config.death_threshold_ms)
            .field("failure_threshold", &self.config.failure_threshold)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionRegistry;
    use crate::testutil::{Recording, RecordingTransport};
    use relay_core::{EventKind, UserId};

    struct Fixture {
        tracker: Arc<ExecutionTracker>,
        monitor: HealthMonitor,
        recording: Recording,
        _registry: Arc<ConnectionRegistry>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new(16));
        let (transport, recording) = RecordingTransport::new();
        let _ = registry
            .add(UserId::from("u1"), "c1".into(), Box::new(transport))
            .unwrap();
        let dispatcher = Arc::new(EventDispatcher::new(Arc::clone(&registry)));
        let tracker = Arc::new(ExecutionTracker::new());
        let monitor = HealthMonitor::new(
            Arc::clone(&tracker),
            dispatcher,
            HealthSettings::default(),
        );
        Fixture {
            tracker,
            monitor,
            recording,
            _registry: registry,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn alive_within_threshold() {
        let f = fixture();
        let id = f
            .tracker
            .start_execution("u1".into(), "researcher", "t".into(), "r".into());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(
            f.monitor.check_liveness(&id, Instant::now()).unwrap(),
            Liveness::Alive
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dead_after_threshold_notifies_once() {
        let f = fixture();
        let id = f
            .tracker
            .start_execution("u1".into(), "researcher", "t".into(), "r".into());
        tokio::time::advance(Duration::from_secs(31)).await;

        let now = Instant::now();
        assert_eq!(f.monitor.check_liveness(&id, now).unwrap(), Liveness::Dead);
        assert_eq!(f.monitor.check_liveness(&id, now).unwrap(), Liveness::Dead);
        assert!(f.monitor.sweep(now).is_empty());

        f.recording.wait_for_frames(1).await;
        tokio::task::yield_now().await;
        let events = f.recording.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, EventKind::AgentCompleted);
        assert_eq!(events[0].success(), Some(false));
        assert_eq!(events[0].data["reason"], DEATH_DETECTED);
        assert_eq!(f.tracker.get(&id).unwrap().state, ExecutionState::Dead);
    }

    #[tokio::test(start_paused = true)]
    async fn completed_execution_is_alive() {
        let f = fixture();
        let id = f
            .tracker
            .start_execution("u1".into(), "researcher", "t".into(), "r".into());
        let _ = f.tracker.fail(&id, "tool error", Instant::now()).unwrap();
        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(
            f.monitor.check_liveness(&id, Instant::now()).unwrap(),
            Liveness::Alive
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deaths_open_the_circuit() {
        let f = fixture();
        for _ in 0..3 {
            let _ = f
                .tracker
                .start_execution("u1".into(), "flaky", "t".into(), "r".into());
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        let now = Instant::now();
        assert_eq!(f.monitor.sweep(now).len(), 3);
        assert!(!f.monitor.allow_execution("flaky", now));
        assert!(f.monitor.allow_execution("steady", now));
    }

    #[tokio::test]
    async fn score_decreases_with_failures_and_latency() {
        let f = fixture();
        let now = Instant::now();
        assert!((f.monitor.health_score("a") - 1.0).abs() < f64::EPSILON);

        f.monitor.record_success("a", Duration::ZERO);
        let perfect = f.monitor.health_score("a");
        f.monitor.record_failure("a", now);
        let one_failure = f.monitor.health_score("a");
        f.monitor.record_failure("a", now);
        let two_failures = f.monitor.health_score("a");
        assert!(perfect > one_failure && one_failure > two_failures);

        f.monitor.record_success("b", Duration::from_secs(1));
        let fast = f.monitor.health_score("b");
        f.monitor.record_success("b", Duration::from_secs(30));
        let slow = f.monitor.health_score("b");
        assert!(fast > slow);
        assert!((0.0..=1.0).contains(&slow));
    }

    #[tokio::test]
    async fn agents_report_sorted() {
        let f = fixture();
        let now = Instant::now();
        f.monitor.record_failure("zeta", now);
        f.monitor.record_success("alpha", Duration::from_millis(10));
        let agents = f.monitor.agents(now);
        assert_eq!(agents[0].agent, "alpha");
        assert_eq!(agents[1].consecutive_failures, 1);
        assert_eq!(agents[1].circuit, CircuitState::Closed);
    }
}

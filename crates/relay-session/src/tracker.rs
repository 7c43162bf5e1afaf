//! Execution lifecycle bookkeeping.
//!
//! Source of truth for every agent execution's state and last heartbeat.
//! Entries are keyed by execution ID in a sharded map; a second index maps
//! users to their execution IDs. Neither map is ever locked while holding
//! the other.

use std::collections::HashSet;
use std::time::Duration;

use dashmap::DashMap;
use metrics::counter;
use relay_core::{ExecutionId, ExecutionState, RunId, ThreadId, TrackerError, UserId};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::metrics::EXECUTIONS_STARTED_TOTAL;

/// One agent run.
#[derive(Clone, Debug)]
pub struct AgentExecution {
    /// Execution ID.
    pub id: ExecutionId,
    /// Agent type, the circuit breaker key.
    pub agent_name: String,
    /// Owning user.
    pub user_id: UserId,
    /// Conversation thread.
    pub thread_id: ThreadId,
    /// Agent runtime run.
    pub run_id: RunId,
    /// Current lifecycle state.
    pub state: ExecutionState,
    /// When the execution started.
    pub started_at: Instant,
    /// Last heartbeat or transition.
    pub last_heartbeat: Instant,
    /// When the execution reached `Completed` or `Dead`.
    pub terminal_at: Option<Instant>,
    /// Failure detail, if any.
    pub error: Option<String>,
}

impl AgentExecution {
    /// Time since the last heartbeat, measured at `now`.
    pub fn silent_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat)
    }
}

/// Tracks every execution from start until eviction.
#[derive(Debug, Default)]
pub struct ExecutionTracker {
    executions: DashMap<ExecutionId, AgentExecution>,
    by_user: DashMap<UserId, HashSet<ExecutionId>>,
}

impl ExecutionTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new execution in `Started`.
    pub fn start_execution(
        &self,
        user_id: UserId,
        agent_name: &str,
        thread_id: ThreadId,
        run_id: RunId,
    ) -> ExecutionId {
        let id = ExecutionId::generate();
        let now = Instant::now();
        let execution = AgentExecution {
            id: id.clone(),
            agent_name: agent_name.to_string(),
            user_id: user_id.clone(),
            thread_id,
            run_id,
            state: ExecutionState::Started,
            started_at: now,
            last_heartbeat: now,
            terminal_at: None,
            error: None,
        };
        let _ = self.executions.insert(id.clone(), execution);
        let _ = self
            .by_user
            .entry(user_id.clone())
            .or_default()
            .insert(id.clone());

        counter!(EXECUTIONS_STARTED_TOTAL).increment(1);
        debug!(execution_id = %id, user_id = %user_id, agent = agent_name, "execution started");
        id
    }

    /// Apply a runtime transition. Counts as a heartbeat at `now`.
    ///
    /// `Dead` is never accepted here, and nothing leaves a terminal state.
    /// A rejected transition leaves the execution unchanged.
    pub fn transition(
        &self,
        execution_id: &ExecutionId,
        to: ExecutionState,
        now: Instant,
    ) -> Result<(), TrackerError> {
        let mut entry = self
            .executions
            .get_mut(execution_id)
            .ok_or_else(|| TrackerError::ExecutionNotFound(execution_id.clone()))?;

        let from = entry.state;
        if !from.can_transition_to(to) {
            drop(entry);
            warn!(execution_id = %execution_id, %from, %to, "invalid transition rejected");
            return Err(TrackerError::InvalidTransition {
                execution_id: execution_id.clone(),
                from,
                to,
            });
        }

        entry.state = to;
        entry.last_heartbeat = now;
        if to.is_terminal() {
            entry.terminal_at = Some(now);
        }
        drop(entry);
        debug!(execution_id = %execution_id, %from, %to, "execution transitioned");
        Ok(())
    }

    /// Refresh the heartbeat. Ignored once the execution is terminal.
    pub fn heartbeat(&self, execution_id: &ExecutionId) -> Result<(), TrackerError> {
        let mut entry = self
            .executions
            .get_mut(execution_id)
            .ok_or_else(|| TrackerError::ExecutionNotFound(execution_id.clone()))?;
        if !entry.state.is_terminal() {
            entry.last_heartbeat = Instant::now();
        }
        Ok(())
    }

    /// Mark a non-terminal execution `Dead`. Only the health monitor calls this.
    ///
    /// Atomic per execution: of two concurrent callers exactly one succeeds,
    /// the other gets `AlreadyTerminal`.
    pub(crate) fn mark_dead(
        &self,
        execution_id: &ExecutionId,
        reason: &str,
        now: Instant,
    ) -> Result<AgentExecution, TrackerError> {
        self.terminate(execution_id, ExecutionState::Dead, reason, now)
    }

    /// Finish a non-terminal execution as `Completed` with an error, from any
    /// state. Used when the agent runtime reports a failure.
    pub(crate) fn fail(
        &self,
        execution_id: &ExecutionId,
        reason: &str,
        now: Instant,
    ) -> Result<AgentExecution, TrackerError> {
        self.terminate(execution_id, ExecutionState::Completed, reason, now)
    }

    fn terminate(
        &self,
        execution_id: &ExecutionId,
        state: ExecutionState,
        reason: &str,
        now: Instant,
    ) -> Result<AgentExecution, TrackerError> {
        let mut entry = self
            .executions
            .get_mut(execution_id)
            .ok_or_else(|| TrackerError::ExecutionNotFound(execution_id.clone()))?;
        if entry.state.is_terminal() {
            return Err(TrackerError::AlreadyTerminal {
                execution_id: execution_id.clone(),
                state: entry.state,
            });
        }
        entry.state = state;
        entry.terminal_at = Some(now);
        entry.error = Some(reason.to_string());
        Ok(entry.clone())
    }

    /// Snapshot of one execution.
    pub fn get(&self, execution_id: &ExecutionId) -> Result<AgentExecution, TrackerError> {
        self.executions
            .get(execution_id)
            .map(|e| e.clone())
            .ok_or_else(|| TrackerError::ExecutionNotFound(execution_id.clone()))
    }

    /// Snapshot of a user's executions, oldest first.
    pub fn executions_for_user(&self, user_id: &UserId) -> Vec<AgentExecution> {
        let ids: Vec<ExecutionId> = self
            .by_user
            .get(user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        let mut executions: Vec<AgentExecution> = ids
            .iter()
            .filter_map(|id| self.executions.get(id).map(|e| e.clone()))
            .collect();
        executions.sort_by_key(|e| e.started_at);
        executions
    }

    /// IDs of executions not yet `Completed` or `Dead`.
    pub fn non_terminal(&self) -> Vec<ExecutionId> {
        self.executions
            .iter()
            .filter(|e| !e.state.is_terminal())
            .map(|e| e.key().clone())
            .collect()
    }

    /// Snapshot of every tracked execution.
    pub fn snapshot(&self) -> Vec<AgentExecution> {
        self.executions.iter().map(|e| e.value().clone()).collect()
    }

    /// Remove an execution from both indexes.
    pub fn remove(&self, execution_id: &ExecutionId) -> Option<AgentExecution> {
        let (_, execution) = self.executions.remove(execution_id)?;
        if let Some(mut set) = self.by_user.get_mut(&execution.user_id) {
            let _ = set.remove(execution_id);
        }
        let _ = self
            .by_user
            .remove_if(&execution.user_id, |_, set| set.is_empty());
        Some(execution)
    }

    /// Evict terminal executions whose grace window has passed.
    pub fn evict_expired(&self, grace: Duration, now: Instant) -> Vec<AgentExecution> {
        let expired: Vec<ExecutionId> = self
            .executions
            .iter()
            .filter(|e| {
                e.terminal_at
                    .is_some_and(|at| now.saturating_duration_since(at) >= grace)
            })
            .map(|e| e.key().clone())
            .collect();

        let evicted: Vec<AgentExecution> =
            expired.iter().filter_map(|id| self.remove(id)).collect();
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicted terminal executions");
        }
        evicted
    }

    /// Tracked execution count.
    pub fn len(&self) -> usize {
        self.executions.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }
}

//! Producer side of the Golden Path.
//!
//! An [`ExecutionDriver`] owns one execution. Every step first commits the
//! transition with the tracker and only then enqueues the matching event, so
//! events reach the dispatcher in causal order:
//! `agent_started`, `agent_thinking`, (`tool_executing`, `tool_completed`)*,
//! `agent_completed`. A rejected transition emits nothing.

use std::sync::Arc;

use relay_core::payload::Payload;
use relay_core::{
    DispatchError, ExecutionId, ExecutionState, RelayError, RunId, ThreadId, UserId, WireEvent,
    events,
};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::dispatcher::EventDispatcher;
use crate::health::HealthMonitor;
use crate::tracker::ExecutionTracker;

/// Drives one execution through its lifecycle and emits its events.
///
/// Steps take `&mut self` so a single producer owns the event order.
#[derive(Debug)]
pub struct ExecutionDriver {
    id: ExecutionId,
    user_id: UserId,
    agent_name: String,
    started_at: Instant,
    tracker: Arc<ExecutionTracker>,
    dispatcher: Arc<EventDispatcher>,
    monitor: Arc<HealthMonitor>,
}

impl ExecutionDriver {
    /// Start an execution and emit `agent_started`.
    ///
    /// Fails with `CircuitOpen` if the agent type is currently barred.
    pub fn start(
        tracker: &Arc<ExecutionTracker>,
        dispatcher: &Arc<EventDispatcher>,
        monitor: &Arc<HealthMonitor>,
        user_id: UserId,
        agent_name: &str,
        thread_id: ThreadId,
        run_id: RunId,
    ) -> Result<Self, RelayError> {
        let now = Instant::now();
        if !monitor.allow_execution(agent_name, now) {
            warn!(user_id = %user_id, agent = agent_name, "circuit open, execution refused");
            return Err(RelayError::CircuitOpen(agent_name.to_string()));
        }

        let id = tracker.start_execution(user_id.clone(), agent_name, thread_id.clone(), run_id.clone());
        let driver = Self {
            id,
            user_id,
            agent_name: agent_name.to_string(),
            started_at: now,
            tracker: Arc::clone(tracker),
            dispatcher: Arc::clone(dispatcher),
            monitor: Arc::clone(monitor),
        };
        driver.emit(&events::agent_started(
            &driver.id,
            agent_name,
            &thread_id,
            &run_id,
        ));
        Ok(driver)
    }

    /// Execution ID.
    pub fn id(&self) -> &ExecutionId {
        &self.id
    }

    /// Owning user.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Refresh the execution's heartbeat.
    pub fn heartbeat(&self) -> Result<(), RelayError> {
        Ok(self.tracker.heartbeat(&self.id)?)
    }

    /// Enter `Thinking` and emit `agent_thinking`.
    pub fn thinking(&mut self, thought: Option<&str>) -> Result<(), RelayError> {
        self.step(
            ExecutionState::Thinking,
            &events::agent_thinking(&self.id, thought),
        )
    }

    /// Enter `ToolExecuting` and emit `tool_executing`.
    pub fn tool_executing(&mut self, tool_name: &str, input: Value) -> Result<(), RelayError> {
        self.step(
            ExecutionState::ToolExecuting,
            &events::tool_executing(&self.id, tool_name, input),
        )
    }

    /// Enter `ToolCompleted` and emit `tool_completed`.
    pub fn tool_completed(&mut self, tool_name: &str, output: Value) -> Result<(), RelayError> {
        self.step(
            ExecutionState::ToolCompleted,
            &events::tool_completed(&self.id, tool_name, output),
        )
    }

    /// Finish successfully and emit `agent_completed {success: true}`.
    pub fn complete(self, extra: Payload) -> Result<(), RelayError> {
        self.tracker
            .transition(&self.id, ExecutionState::Completed, Instant::now())?;
        self.monitor
            .record_success(&self.agent_name, self.started_at.elapsed());
        self.emit(&events::agent_completed(&self.id, true, extra));
        Ok(())
    }

    /// Finish with an error and emit `agent_completed {success: false}`.
    pub fn fail(self, reason: &str) -> Result<(), RelayError> {
        let now = Instant::now();
        let _ = self.tracker.fail(&self.id, reason, now)?;
        self.monitor.record_failure(&self.agent_name, now);
        self.emit(&events::agent_failed(&self.id, reason, &self.agent_name));
        Ok(())
    }

    fn step(&mut self, to: ExecutionState, event: &WireEvent) -> Result<(), RelayError> {
        self.tracker.transition(&self.id, to, Instant::now())?;
        self.emit(event);
        Ok(())
    }

    /// Deliver an event for a transition that is already committed.
    /// Delivery problems are logged; the transition stands.
    fn emit(&self, event: &WireEvent) {
        match self.dispatcher.send(&self.user_id, event) {
            Ok(_) => {}
            Err(DispatchError::NoConnection(_)) => {
                debug!(execution_id = %self.id, event = %event.event, "owner offline, event dropped");
            }
            Err(e) => {
                warn!(execution_id = %self.id, event = %event.event, error = %e, "event not delivered");
            }
        }
    }
}

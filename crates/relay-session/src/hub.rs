//! Composition root for the session subsystem.
//!
//! [`SessionHub`] wires the registry, dispatcher, tracker, health monitor and
//! pressure controller together and is the one handle the gateway holds.

use std::sync::Arc;
use std::time::Duration;

use relay_core::{
    CloseReason, ConnectionId, DispatchError, ExecutionId, RegistryError, RelayError, RunId,
    SampleError, ThreadId, TrackerError, UserId, WireEvent,
};
use relay_settings::RelaySettings;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connection::Connection;
use crate::dispatcher::EventDispatcher;
use crate::driver::ExecutionDriver;
use crate::health::{HealthMonitor, Liveness};
use crate::ops::{OpsSnapshot, UserLoad};
use crate::pressure::{ProcessSampler, ResourcePressureController, ResourceSampler};
use crate::registry::ConnectionRegistry;
use crate::sweep;
use crate::tracker::ExecutionTracker;
use crate::transport::Transport;

/// Shared handle to every session component.
#[derive(Debug)]
pub struct SessionHub {
    settings: RelaySettings,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<EventDispatcher>,
    tracker: Arc<ExecutionTracker>,
    monitor: Arc<HealthMonitor>,
    pressure: Arc<ResourcePressureController>,
}

impl SessionHub {
    /// Build a hub that samples through `sampler`.
    pub fn new(settings: RelaySettings, sampler: Arc<dyn ResourceSampler>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(
            settings.session.outbound_queue_capacity,
        ));
        Self::assemble(settings, registry, sampler)
    }

    /// Build a hub that samples this process.
    pub fn with_process_sampler(settings: RelaySettings) -> Result<Self, SampleError> {
        let registry = Arc::new(ConnectionRegistry::new(
            settings.session.outbound_queue_capacity,
        ));
        let sampler = Arc::new(ProcessSampler::new(Arc::clone(&registry))?);
        Ok(Self::assemble(settings, registry, sampler))
    }

    fn assemble(
        settings: RelaySettings,
        registry: Arc<ConnectionRegistry>,
        sampler: Arc<dyn ResourceSampler>,
    ) -> Self {
        let dispatcher = Arc::new(EventDispatcher::new(Arc::clone(&registry)));
        let tracker = Arc::new(ExecutionTracker::new());
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&tracker),
            Arc::clone(&dispatcher),
            settings.health.clone(),
        ));
        let pressure = Arc::new(ResourcePressureController::new(
            Arc::clone(&registry),
            Arc::clone(&tracker),
            Arc::clone(&dispatcher),
            Arc::clone(&monitor),
            sampler,
            settings.pressure.clone(),
        ));
        Self {
            settings,
            registry,
            dispatcher,
            tracker,
            monitor,
            pressure,
        }
    }

    /// Register a new connection for `user_id` under a generated ID.
    pub fn connect(
        &self,
        user_id: UserId,
        transport: Box<dyn Transport>,
    ) -> Result<Arc<Connection>, RegistryError> {
        self.registry
            .add(user_id, ConnectionId::generate(), transport)
    }

    /// Register a connection under a caller-chosen ID.
    pub fn register(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        transport: Box<dyn Transport>,
    ) -> Result<Arc<Connection>, RegistryError> {
        self.registry.add(user_id, connection_id, transport)
    }

    /// Unregister and close a connection.
    pub fn disconnect(
        &self,
        connection_id: &ConnectionId,
        reason: CloseReason,
    ) -> Result<Arc<Connection>, RegistryError> {
        let connection = self.registry.remove(connection_id)?;
        let _ = connection.close(reason);
        Ok(connection)
    }

    /// Deliver an event to every open connection of `user_id`.
    pub fn send(&self, user_id: &UserId, event: &WireEvent) -> Result<usize, DispatchError> {
        self.dispatcher.send(user_id, event)
    }

    /// Deliver an event to one connection.
    pub fn send_to_connection(
        &self,
        connection_id: &ConnectionId,
        event: &WireEvent,
    ) -> Result<(), DispatchError> {
        self.dispatcher.send_to_connection(connection_id, event)
    }

    /// Start an execution for `user_id` and emit `agent_started`.
    pub fn start_execution(
        &self,
        user_id: UserId,
        agent_name: &str,
        thread_id: ThreadId,
        run_id: RunId,
    ) -> Result<ExecutionDriver, RelayError> {
        ExecutionDriver::start(
            &self.tracker,
            &self.dispatcher,
            &self.monitor,
            user_id,
            agent_name,
            thread_id,
            run_id,
        )
    }

    /// Refresh an execution's heartbeat.
    pub fn heartbeat(&self, execution_id: &ExecutionId) -> Result<(), TrackerError> {
        self.tracker.heartbeat(execution_id)
    }

    /// Liveness verdict for one execution right now.
    pub fn check_liveness(&self, execution_id: &ExecutionId) -> Result<Liveness, TrackerError> {
        self.monitor.check_liveness(execution_id, Instant::now())
    }

    /// Spawn the health and pressure sweeps. They stop when `cancel` fires.
    pub fn spawn_sweeps(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            sweep::spawn_health_sweep(
                Arc::clone(&self.monitor),
                Arc::clone(&self.tracker),
                self.settings.health.sweep_interval(),
                self.settings.session.eviction_grace(),
                cancel.child_token(),
            ),
            sweep::spawn_pressure_sweep(
                Arc::clone(&self.pressure),
                self.settings.pressure.sample_interval(),
                cancel.child_token(),
            ),
        ]
    }

    /// Current operator snapshot.
    pub fn ops_snapshot(&self) -> OpsSnapshot {
        let now = Instant::now();
        let mut snapshot = OpsSnapshot {
            pressure_level: self.pressure.level(),
            last_sample: self.pressure.last_sample(),
            last_cleanup: self.pressure.last_report(),
            connections: self.registry.len(),
            executions: self.tracker.len(),
            users: std::collections::BTreeMap::new(),
            agents: self.monitor.agents(now),
        };
        for connection in self.registry.all() {
            let load: &mut UserLoad = snapshot
                .users
                .entry(connection.user_id().clone())
                .or_default();
            load.connections += 1;
            load.queued_events += connection.queued();
        }
        for execution in self.tracker.snapshot() {
            snapshot.users.entry(execution.user_id).or_default().executions += 1;
        }
        snapshot
    }

    /// Close every connection with `ServerShutdown` and wait up to `drain`
    /// for their writers to finish. Returns the number of connections closed.
    pub async fn shutdown(&self, drain: Duration) -> usize {
        let connections = self.registry.all();
        for connection in &connections {
            let _ = self.registry.remove(connection.id());
            let _ = connection.close(CloseReason::ServerShutdown);
        }
        let all_closed = futures::future::join_all(connections.iter().map(|c| c.closed()));
        if tokio::time::timeout(drain, all_closed).await.is_err() {
            warn!(drain_ms = drain.as_millis(), "connections still draining at shutdown");
        }
        info!(count = connections.len(), "session hub shut down");
        connections.len()
    }

    /// Settings the hub was built with.
    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Event dispatcher.
    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    /// Execution tracker.
    pub fn tracker(&self) -> &Arc<ExecutionTracker> {
        &self.tracker
    }

    /// Health monitor.
    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    /// Pressure controller.
    pub fn pressure(&self) -> &Arc<ResourcePressureController> {
        &self.pressure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pressure::PressureLevel;
    use crate::testutil::{FixedSampler, RecordingTransport};
    use relay_core::payload::Payload;

    fn hub() -> SessionHub {
        SessionHub::new(RelaySettings::default(), Arc::new(FixedSampler::new(0, 0)))
    }

    #[tokio::test]
    async fn connect_generates_distinct_ids() {
        let hub = hub();
        let (a, _ra) = RecordingTransport::new();
        let (b, _rb) = RecordingTransport::new();
        let first = hub.connect("u1".into(), Box::new(a)).unwrap();
        let second = hub.connect("u1".into(), Box::new(b)).unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(hub.registry().connections_for_user(&"u1".into()).len(), 2);
    }

    #[tokio::test]
    async fn disconnect_closes_with_reason() {
        let hub = hub();
        let (t, rec) = RecordingTransport::new();
        let conn = hub.connect("u1".into(), Box::new(t)).unwrap();
        let _ = hub.disconnect(conn.id(), CloseReason::ClientClosed).unwrap();
        rec.wait_closed().await;
        assert_eq!(rec.close_reason(), Some(CloseReason::ClientClosed));
        assert!(matches!(
            hub.disconnect(conn.id(), CloseReason::ClientClosed),
            Err(RegistryError::ConnectionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn ops_snapshot_groups_by_user() {
        let hub = hub();
        let (t1, _r1) = RecordingTransport::new();
        let (t2, _r2) = RecordingTransport::new();
        let _ = hub.connect("u1".into(), Box::new(t1)).unwrap();
        let _ = hub.connect("u2".into(), Box::new(t2)).unwrap();
        let driver = hub
            .start_execution("u1".into(), "researcher", "t".into(), "r".into())
            .unwrap();
        driver.complete(Payload::new()).unwrap();

        let snapshot = hub.ops_snapshot();
        assert_eq!(snapshot.pressure_level, PressureLevel::Normal);
        assert_eq!(snapshot.connections, 2);
        assert_eq!(snapshot.executions, 1);
        assert_eq!(snapshot.users[&UserId::from("u1")].executions, 1);
        assert_eq!(snapshot.users[&UserId::from("u2")].connections, 1);
        assert_eq!(snapshot.agents.len(), 1);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["pressureLevel"], "normal");
        assert!(json["users"]["u1"].is_object());
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let hub = hub();
        let (t, rec) = RecordingTransport::new();
        let _ = hub.connect("u1".into(), Box::new(t)).unwrap();
        assert_eq!(hub.shutdown(Duration::from_secs(1)).await, 1);
        assert_eq!(rec.close_reason(), Some(CloseReason::ServerShutdown));
        assert!(hub.registry().is_empty());
    }
}

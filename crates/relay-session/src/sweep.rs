//! Periodic background sweeps.
//!
//! Both loops tick on a fixed interval until their token is cancelled. A
//! tick that overruns delays the next one instead of bursting.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::health::HealthMonitor;
use crate::pressure::ResourcePressureController;
use crate::tracker::ExecutionTracker;

/// Run death detection every `interval`, then evict terminal executions older
/// than `grace`.
pub async fn run_health_sweep(
    monitor: Arc<HealthMonitor>,
    tracker: Arc<ExecutionTracker>,
    interval: Duration,
    grace: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Instant::now();
                let dead = monitor.sweep(now);
                let evicted = tracker.evict_expired(grace, now);
                if !dead.is_empty() || !evicted.is_empty() {
                    debug!(dead = dead.len(), evicted = evicted.len(), "health sweep");
                }
            }
            () = cancel.cancelled() => {
                info!("health sweep stopped");
                return;
            }
        }
    }
}

/// Sample resources every `interval` and clean up when under pressure.
pub async fn run_pressure_sweep(
    controller: Arc<ResourcePressureController>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // Sampling failures are already reported by the controller.
                let _ = controller.run_once(Instant::now());
            }
            () = cancel.cancelled() => {
                info!("pressure sweep stopped");
                return;
            }
        }
    }
}

/// Spawn [`run_health_sweep`].
pub fn spawn_health_sweep(
    monitor: Arc<HealthMonitor>,
    tracker: Arc<ExecutionTracker>,
    interval: Duration,
    grace: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run_health_sweep(monitor, tracker, interval, grace, cancel))
}

/// Spawn [`run_pressure_sweep`].
pub fn spawn_pressure_sweep(
    controller: Arc<ResourcePressureController>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run_pressure_sweep(controller, interval, cancel))
}

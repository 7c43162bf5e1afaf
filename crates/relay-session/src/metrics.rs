//! Metric names recorded by the session core.
//!
//! Rendering is the host's concern (the server installs a Prometheus
//! recorder). Without a recorder these calls are no-ops.

/// Connections registered since start.
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Currently registered connections.
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Connections removed since start.
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Events enqueued to at least one connection, labelled by `event`.
pub const EVENTS_DISPATCHED_TOTAL: &str = "events_dispatched_total";
/// Events or frames discarded, labelled by `reason`.
pub const EVENTS_DROPPED_TOTAL: &str = "events_dropped_total";
/// Connections closed because their outbound queue overflowed.
pub const SLOW_CONSUMER_DISCONNECTS_TOTAL: &str = "slow_consumer_disconnects_total";
/// Executions started.
pub const EXECUTIONS_STARTED_TOTAL: &str = "executions_started_total";
/// Executions declared dead by the health monitor.
pub const EXECUTIONS_DEAD_TOTAL: &str = "executions_dead_total";
/// 1 when an agent's circuit is open, labelled by `agent`.
pub const CIRCUIT_OPEN: &str = "circuit_open";
/// Current pressure level (0 = normal .. 4 = force).
pub const PRESSURE_LEVEL: &str = "pressure_level";
/// Entries reclaimed by graduated cleanup, labelled by `kind`.
pub const CLEANUP_ENTRIES_TOTAL: &str = "cleanup_entries_total";
/// Cleanup attempts that failed.
pub const CLEANUP_FAILURES_TOTAL: &str = "cleanup_failures_total";
/// Failed resource samples.
pub const RESOURCE_SAMPLE_FAILURES_TOTAL: &str = "resource_sample_failures_total";

/// Every metric name, for exporters and tests.
pub const ALL: [&str; 13] = [
    WS_CONNECTIONS_TOTAL,
    WS_CONNECTIONS_ACTIVE,
    WS_DISCONNECTIONS_TOTAL,
    EVENTS_DISPATCHED_TOTAL,
    EVENTS_DROPPED_TOTAL,
    SLOW_CONSUMER_DISCONNECTS_TOTAL,
    EXECUTIONS_STARTED_TOTAL,
    EXECUTIONS_DEAD_TOTAL,
    CIRCUIT_OPEN,
    PRESSURE_LEVEL,
    CLEANUP_ENTRIES_TOTAL,
    CLEANUP_FAILURES_TOTAL,
    RESOURCE_SAMPLE_FAILURES_TOTAL,
];

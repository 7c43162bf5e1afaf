//! Prometheus recorder and `/metrics` rendering.
//!
//! Metric names are declared next to the code that records them, in
//! [`relay_session::metrics`], and re-exported here.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

pub use relay_session::metrics::*;

/// Install the global Prometheus recorder.
///
/// Call once at startup, before anything is recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::with_local_recorder;

    #[test]
    fn renders_recorded_counter() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        with_local_recorder(&recorder, || {
            metrics::counter!(WS_CONNECTIONS_TOTAL).increment(2);
        });
        let output = render(&handle);
        assert!(output.contains("ws_connections_total 2"));
    }

    #[test]
    fn session_names_reexported() {
        assert!(ALL.contains(&PRESSURE_LEVEL));
    }
}

//! Prometheus recorder for the probe run
//!
//! Collects the `key_pool_*` counters the engine emits so the run can finish
//! by printing them in the Prometheus text exposition format.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder as the global recorder.
///
/// Must run before the engine handles its first call, otherwise early
/// counters go to the no-op recorder.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

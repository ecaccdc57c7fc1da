use std::sync::Arc;

use tether_telemetry::metrics::{names, MetricsRecorder};

#[test]
fn metrics_module_is_reachable_from_dependents() {
    let recorder = Arc::new(MetricsRecorder::new());
    recorder.counter_inc(names::STORE_ADMISSION_REJECTED, &[("reason", "depth")], 1);
    recorder.histogram_observe(names::QUALITY_SCORE, &[("role", "writer")], 72.0);

    assert_eq!(
        recorder.counter_get(names::STORE_ADMISSION_REJECTED, &[("reason", "depth")]),
        1
    );
    assert_eq!(recorder.histogram_summary(names::QUALITY_SCORE, &[("role", "writer")]).count, 1);
}

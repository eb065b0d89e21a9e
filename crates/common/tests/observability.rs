use common::observability::{build_dispatch, LogCategory};
use metrics_exporter_prometheus::PrometheusBuilder;

// Integration tests so they exercise the public API surface
// (`common::observability`) instead of reaching into private internals.

#[test]
fn tracing_error_events_counter_increments_on_error_event() {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    metrics::with_local_recorder(&recorder, || {
        let (dispatch, _control, _otel_guard) = build_dispatch("test-service", "info");

        tracing::dispatcher::with_default(&dispatch, || {
            tracing::error!(foo = 123, "boom");
        });
    });

    let rendered = handle.render();
    assert!(
        rendered.contains("tracing_error_events"),
        "expected tracing_error_events in rendered metrics, got:\n{rendered}"
    );
}

#[test]
fn log_control_swaps_installed_filter() {
    let (dispatch, control, _otel_guard) = build_dispatch("test-service", "info");
    let control = control.with_categories(&[LogCategory {
        name: "connection",
        target: "watcher::feed",
    }]);

    let selected = vec!["connection".to_string()];
    let applied = control.apply("debug", Some(&selected)).unwrap();
    assert_eq!(applied, "warn,watcher::feed=debug");

    let current = control.current_filter().unwrap();
    assert!(current.contains("watcher::feed=debug"), "got {current}");

    tracing::dispatcher::with_default(&dispatch, || {
        assert!(tracing::enabled!(target: "watcher::feed", tracing::Level::DEBUG));
        assert!(!tracing::enabled!(target: "watcher::correlator", tracing::Level::INFO));
    });
}

use anyhow::Result;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

pub fn describe() {
    describe_counter!(
        "watcher_notifications_received_total",
        "Feed notifications received for live subscriptions."
    );
    describe_counter!(
        "watcher_notifications_dropped_total",
        "Notifications dropped because the pipeline queue was full."
    );
    describe_counter!(
        "watcher_reconnects_total",
        "Feed reconnect attempts scheduled."
    );
    describe_gauge!(
        "watcher_connection_state",
        "Feed state: 0 disconnected, 1 connecting, 2 subscribing, 3 active, 4 reconnecting, 5 shutdown."
    );
    describe_counter!(
        "watcher_fetch_failures_total",
        "Signatures whose detail fetch failed after all attempts."
    );
    describe_counter!(
        "watcher_trades_classified_total",
        "Per-wallet classifications, by kind."
    );
    describe_counter!(
        "watcher_trades_recorded_total",
        "Trade inserts, by outcome (inserted, duplicate, error)."
    );
    describe_counter!("watcher_signals_emitted_total", "Signals fired.");
    describe_counter!(
        "watcher_dispatch_failures_total",
        "Failed alert deliveries, by channel."
    );
    describe_histogram!(
        "watcher_db_query_latency_ms",
        "Store operation latency in milliseconds."
    );
    describe_counter!(
        "watcher_db_query_errors_total",
        "Store operations that returned an error."
    );
}

pub fn install_prometheus(port: u16) -> Result<PrometheusHandle> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    Ok(PrometheusBuilder::new()
        .with_http_listener(addr)
        .install_recorder()?)
}

// Telemetry module for structured logging and metrics

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize structured logging with JSON formatting
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(log_level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(json_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;

    tracing::info!(log_level = log_level, "Structured logging initialized");

    Ok(())
}

/// Initialize Prometheus metrics exporter
///
/// Metrics are always recorded through the `metrics` facade; without an
/// installed exporter they are dropped.
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!(
        "notifications_emitted_total",
        "Notifications produced by triggers"
    );
    describe_counter!(
        "notifications_delivered_total",
        "Notifications handed to the messaging transport"
    );
    describe_counter!(
        "notifications_failed_total",
        "Notifications the transport refused"
    );
    describe_counter!("trigger_fired_total", "Trigger bodies executed");
    describe_counter!(
        "trigger_skipped_total",
        "Trigger bodies skipped by the idempotency guard"
    );
    describe_gauge!("chain_cursor_height", "Last block height processed by the chain poller");
    describe_gauge!("subscribers_total", "Subscribers currently known to the scheduler");
    describe_gauge!("current_epoch", "Epoch number the triggers are running for");

    tracing::info!(metrics_port = metrics_port, "Prometheus metrics exporter initialized");

    Ok(())
}

#[inline]
pub fn record_notification_emitted(trigger_id: &str) {
    counter!("notifications_emitted_total", "trigger" => trigger_family(trigger_id)).increment(1);
}

#[inline]
pub fn record_notification_delivered() {
    counter!("notifications_delivered_total").increment(1);
}

#[inline]
pub fn record_notification_failed() {
    counter!("notifications_failed_total").increment(1);
}

#[inline]
pub fn record_trigger_fired(trigger_id: &str) {
    counter!("trigger_fired_total", "trigger" => trigger_family(trigger_id)).increment(1);
}

#[inline]
pub fn record_trigger_skipped(trigger_id: &str, reason: &'static str) {
    counter!(
        "trigger_skipped_total",
        "trigger" => trigger_family(trigger_id),
        "reason" => reason
    )
    .increment(1);
}

#[inline]
pub fn set_cursor_height(height: u64) {
    gauge!("chain_cursor_height").set(height as f64);
}

#[inline]
pub fn set_subscribers_total(count: usize) {
    gauge!("subscribers_total").set(count as f64);
}

#[inline]
pub fn set_current_epoch(epoch: u64) {
    gauge!("current_epoch").set(epoch as f64);
}

/// Label value for a trigger id; per-address ids collapse to their prefix
fn trigger_family(trigger_id: &str) -> String {
    match trigger_id.find("-0x") {
        Some(idx) => trigger_id[..idx].to_string(),
        None => trigger_id.to_string(),
    }
}

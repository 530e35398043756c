// ABOUTME: Metrics facade over the metrics crate macros
// ABOUTME: Counter helpers so call sites stay one-liners

use metrics::counter;

/// Install the Prometheus exporter on the given port. Call once, inside a
/// tokio runtime.
pub fn init_metrics(port: u16) -> anyhow::Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()?;
    Ok(())
}

pub fn record_command(name: &str) {
    counter!("squawk_commands_total", "command" => name.to_string()).increment(1);
}

pub fn record_command_error(name: &str) {
    counter!("squawk_command_errors_total", "command" => name.to_string()).increment(1);
}

pub fn record_message_sent() {
    counter!("squawk_messages_sent_total").increment(1);
}

pub fn record_reconnect() {
    counter!("squawk_session_reconnects_total").increment(1);
}

pub fn record_addon_load_failure(addon: &str) {
    counter!("squawk_addon_load_failures_total", "addon" => addon.to_string()).increment(1);
}

pub fn record_addon_register_failure(addon: &str) {
    counter!("squawk_addon_register_failures_total", "addon" => addon.to_string()).increment(1);
}

pub fn record_subscription_failure(label: &str) {
    counter!("squawk_subscription_failures_total", "subscription" => label.to_string()).increment(1);
}

pub fn record_event_notification(event_type: &str) {
    counter!("squawk_event_notifications_total", "event_type" => event_type.to_string())
        .increment(1);
}

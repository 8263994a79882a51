pub(crate) const METRIC_STATE_UPDATES: &str = "service_state_updates_total";
pub(crate) const METRIC_READY: &str = "service_state_ready";
pub(crate) const METRIC_PROTOCOL_VIOLATIONS: &str = "service_state_protocol_violations_total";
pub(crate) const METRIC_TICKS_SKIPPED: &str = "service_state_checker_ticks_skipped_total";
pub(crate) const METRIC_CHECKS_PANICKED: &str = "service_state_checks_panicked_total";
pub(crate) const METRIC_WORKER_FAULTS: &str = "service_state_worker_faults_total";
pub(crate) const METRIC_SHUTDOWN_INITIATED: &str = "service_state_shutdown_initiated_total";

/// `service` label recorded for updates naming an undeclared service.
pub(crate) const UNKNOWN_SERVICE_LABEL: &str = "unknown";

pub(crate) fn emit_state_update(service: &str, result: &'static str) {
    metrics::counter!(
        METRIC_STATE_UPDATES,
        "service" => service.to_string(),
        "result" => result
    )
    .increment(1);
}

pub(crate) fn emit_ready(ready: bool) {
    metrics::gauge!(METRIC_READY).set(if ready { 1.0 } else { 0.0 });
}

pub(crate) fn emit_protocol_violation() {
    metrics::counter!(METRIC_PROTOCOL_VIOLATIONS).increment(1);
}

pub(crate) fn emit_tick_skipped(checker: &str) {
    metrics::counter!(METRIC_TICKS_SKIPPED, "checker" => checker.to_string()).increment(1);
}

pub(crate) fn emit_check_panicked(checker: &str) {
    metrics::counter!(METRIC_CHECKS_PANICKED, "checker" => checker.to_string()).increment(1);
}

pub(crate) fn emit_worker_fault() {
    metrics::counter!(METRIC_WORKER_FAULTS).increment(1);
}

pub(crate) fn emit_shutdown_initiated(trigger_reason: &'static str) {
    metrics::counter!(
        METRIC_SHUTDOWN_INITIATED,
        "trigger_reason" => trigger_reason
    )
    .increment(1);
}

// Prometheus metrics for the execution gateway
//
// Rendered by `execgate metrics` and available to embedding services via
// `gather_metrics()`:
// - Requests by operation and outcome (counter)
// - Rate-limit denials (counter)
// - Credential refreshes (counter)
// - Executions in flight (gauge)
// - Execution duration (histogram)
// - Audit failures and cache lookups (counters)

use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    // Request metrics
    pub static ref REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("execgate_requests_total", "Total requests by operation and outcome"),
        &["operation", "outcome"]
    ).expect("Failed to create requests total metric");

    pub static ref RATE_LIMITED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("execgate_rate_limited_total", "Requests denied by the rate limiter"),
        &["class"]
    ).expect("Failed to create rate limited metric");

    // Credential metrics
    pub static ref CREDENTIAL_REFRESHES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("execgate_credential_refreshes_total", "Credential refresh calls by result"),
        &["result"]
    ).expect("Failed to create credential refresh metric");

    // Execution metrics
    pub static ref EXECUTIONS_IN_FLIGHT: IntGauge = IntGauge::new(
        "execgate_executions_in_flight",
        "Number of subprocesses currently running"
    ).expect("Failed to create executions in flight metric");

    pub static ref EXECUTIONS_QUEUED: IntGauge = IntGauge::new(
        "execgate_executions_queued",
        "Number of requests waiting for an execution slot"
    ).expect("Failed to create executions queued metric");

    pub static ref EXECUTION_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("execgate_execution_duration_seconds", "Subprocess wall time in seconds"),
        &["operation", "outcome"]
    ).expect("Failed to create execution duration metric");

    pub static ref OUTPUT_TRUNCATED_TOTAL: IntCounter = IntCounter::new(
        "execgate_output_truncated_total",
        "Executions whose output hit the buffer limit"
    ).expect("Failed to create output truncated metric");

    // Audit metrics
    pub static ref AUDIT_ENTRIES_TOTAL: IntCounter = IntCounter::new(
        "execgate_audit_entries_total",
        "Audit entries written"
    ).expect("Failed to create audit entries metric");

    pub static ref AUDIT_FAILURES_TOTAL: CounterVec = CounterVec::new(
        Opts::new("execgate_audit_failures_total", "Audit writes that were abandoned"),
        &["reason"]
    ).expect("Failed to create audit failures metric");

    // Cache metrics
    pub static ref CACHE_LOOKUPS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("execgate_cache_lookups_total", "Result cache lookups by result"),
        &["result"]
    ).expect("Failed to create cache lookups metric");
}

fn register(collector: Box<dyn prometheus::core::Collector>) -> prometheus::Result<()> {
    match REGISTRY.register(collector) {
        Err(prometheus::Error::AlreadyReg) => Ok(()),
        other => other,
    }
}

/// Initialize metrics registry; safe to call more than once
pub fn init() -> prometheus::Result<()> {
    register(Box::new(REQUESTS_TOTAL.clone()))?;
    register(Box::new(RATE_LIMITED_TOTAL.clone()))?;
    register(Box::new(CREDENTIAL_REFRESHES_TOTAL.clone()))?;
    register(Box::new(EXECUTIONS_IN_FLIGHT.clone()))?;
    register(Box::new(EXECUTIONS_QUEUED.clone()))?;
    register(Box::new(EXECUTION_DURATION_SECONDS.clone()))?;
    register(Box::new(OUTPUT_TRUNCATED_TOTAL.clone()))?;
    register(Box::new(AUDIT_ENTRIES_TOTAL.clone()))?;
    register(Box::new(AUDIT_FAILURES_TOTAL.clone()))?;
    register(Box::new(CACHE_LOOKUPS_TOTAL.clone()))?;
    Ok(())
}

/// Count a finished request
pub fn record_request(operation: &str, outcome: &str) {
    REQUESTS_TOTAL.with_label_values(&[operation, outcome]).inc();
}

/// Count a rate-limit denial
pub fn record_rate_limited(class: &str) {
    RATE_LIMITED_TOTAL.with_label_values(&[class]).inc();
}

/// Count a refresh call
pub fn record_refresh(success: bool) {
    let result = if success { "success" } else { "failure" };
    CREDENTIAL_REFRESHES_TOTAL.with_label_values(&[result]).inc();
}

/// Observe a finished subprocess
pub fn observe_execution(operation: &str, outcome: &str, seconds: f64) {
    EXECUTION_DURATION_SECONDS
        .with_label_values(&[operation, outcome])
        .observe(seconds);
}

/// Count an abandoned audit write
pub fn record_audit_failure(reason: &str) {
    AUDIT_FAILURES_TOTAL.with_label_values(&[reason]).inc();
}

/// Count a cache lookup
pub fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    CACHE_LOOKUPS_TOTAL.with_label_values(&[result]).inc();
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}

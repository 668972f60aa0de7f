//! Metrics and observability utilities
//!
//! Prometheus metrics for the review lifecycle with standardized naming
//! conventions.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all ReaderLoop metrics
pub const METRICS_PREFIX: &str = "readerloop";

/// Histogram buckets for request latency (in seconds)
pub const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000,
];

/// Register all metric descriptions
pub fn register_metrics() {
    describe_counter!(
        format!("{}_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of HTTP requests"
    );

    describe_histogram!(
        format!("{}_request_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "HTTP request latency in seconds"
    );

    describe_counter!(
        format!("{}_decisions_total", METRICS_PREFIX),
        Unit::Count,
        "Admin review decisions by action and outcome"
    );

    describe_counter!(
        format!("{}_compensations_total", METRICS_PREFIX),
        Unit::Count,
        "Reader compensations by format and outcome"
    );

    describe_counter!(
        format!("{}_compensation_cents_total", METRICS_PREFIX),
        Unit::Count,
        "Cents credited to readers"
    );

    describe_counter!(
        format!("{}_monitoring_checks_total", METRICS_PREFIX),
        Unit::Count,
        "Marketplace existence checks by result"
    );

    describe_histogram!(
        format!("{}_monitoring_sweep_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Duration of one monitoring sweep"
    );

    describe_counter!(
        format!("{}_removals_detected_total", METRICS_PREFIX),
        Unit::Count,
        "Reviews detected as removed, by guarantee eligibility"
    );

    describe_counter!(
        format!("{}_replacements_dispatched_total", METRICS_PREFIX),
        Unit::Count,
        "Replacement dispatches by outcome"
    );

    describe_counter!(
        format!("{}_collaborator_failures_total", METRICS_PREFIX),
        Unit::Count,
        "Swallowed collaborator failures"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record request metrics
pub struct RequestMetrics {
    start: Instant,
    endpoint: String,
    method: String,
}

impl RequestMetrics {
    /// Start tracking a request
    pub fn start(method: &str, endpoint: &str) -> Self {
        Self {
            start: Instant::now(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        }
    }

    /// Record request completion
    pub fn finish(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            format!("{}_requests_total", METRICS_PREFIX),
            "method" => self.method.clone(),
            "endpoint" => self.endpoint.clone(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!(
            format!("{}_request_duration_seconds", METRICS_PREFIX),
            "method" => self.method,
            "endpoint" => self.endpoint
        )
        .record(duration);
    }
}

pub fn record_decision(action: &str, success: bool) {
    let outcome = if success { "success" } else { "error" };
    counter!(
        format!("{}_decisions_total", METRICS_PREFIX),
        "action" => action.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// `paid` is false for an idempotent no-op
pub fn record_compensation(format: &str, amount_cents: i64, paid: bool) {
    let outcome = if paid { "paid" } else { "already_paid" };
    counter!(
        format!("{}_compensations_total", METRICS_PREFIX),
        "format" => format.to_string(),
        "outcome" => outcome
    )
    .increment(1);

    if paid {
        counter!(
            format!("{}_compensation_cents_total", METRICS_PREFIX),
            "format" => format.to_string()
        )
        .increment(amount_cents.max(0) as u64);
    }
}

/// `result` is one of present, removed, inconclusive
pub fn record_check(result: &str) {
    counter!(
        format!("{}_monitoring_checks_total", METRICS_PREFIX),
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_sweep(duration_secs: f64) {
    histogram!(format!("{}_monitoring_sweep_duration_seconds", METRICS_PREFIX)).record(duration_secs);
}

pub fn record_removal(eligible: bool) {
    counter!(
        format!("{}_removals_detected_total", METRICS_PREFIX),
        "eligible" => eligible.to_string()
    )
    .increment(1);
}

pub fn record_replacement(found: bool) {
    let outcome = if found { "assigned" } else { "queue_empty" };
    counter!(
        format!("{}_replacements_dispatched_total", METRICS_PREFIX),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_collaborator_failure(collaborator: &str) {
    counter!(
        format!("{}_collaborator_failures_total", METRICS_PREFIX),
        "collaborator" => collaborator.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_buckets_sorted() {
        let mut prev = 0.0;
        for &bucket in LATENCY_BUCKETS {
            assert!(bucket > prev);
            prev = bucket;
        }
    }

    #[test]
    fn test_recorders_without_exporter() {
        // No recorder installed: every call is a no-op
        record_decision("approve", true);
        record_compensation("EBOOK", 100, true);
        record_check("inconclusive");
        record_removal(true);
        record_replacement(false);
        RequestMetrics::start("GET", "/v1/health").finish(200);
    }
}

//! Admission metrics.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `admission_tickets_issued_total` - Tickets issued
//! - `admission_tickets_regenerated_total` - Payload regenerations
//! - `admission_tickets_cancelled_total` - Tickets cancelled
//! - `admission_scans_total{reason}` - Validation outcomes by reason
//! - `admission_scan_failures_total` - Validations that could not reach the store
//! - `admission_attendance_events_dropped_total` - Events dropped by a full aggregator channel
//!
//! ## Histograms
//! - `admission_validation_duration_seconds` - Time taken by `validate()`

use crate::validation::ValidationReason;
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Install the Prometheus recorder and return a handle for rendering `/metrics`.
///
/// # Errors
///
/// Returns [`MetricsError`] if the exporter cannot be built or a recorder is
/// already installed.
pub fn install_prometheus() -> Result<PrometheusHandle, MetricsError> {
    register_metrics();

    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            &[0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0],
        )
        .map_err(|e| MetricsError::Build(e.to_string()))?
        .install_recorder()
        .map_err(|e| MetricsError::Install(e.to_string()))
}

/// Register all metric descriptions.
///
/// This should be called once at application startup, before any metrics are recorded.
pub fn register_metrics() {
    describe_counter!("admission_tickets_issued_total", "Total number of tickets issued");
    describe_counter!(
        "admission_tickets_regenerated_total",
        "Total number of ticket payload regenerations"
    );
    describe_counter!("admission_tickets_cancelled_total", "Total number of tickets cancelled");
    describe_counter!(
        "admission_scans_total",
        "Total number of validation outcomes by reason"
    );
    describe_counter!(
        "admission_scan_failures_total",
        "Total number of validations that failed because the store was unavailable"
    );
    describe_histogram!(
        "admission_validation_duration_seconds",
        "Time taken to validate a scanned payload"
    );
    describe_counter!(
        "admission_attendance_events_dropped_total",
        "Attendance events dropped because the aggregator channel was full"
    );

    tracing::info!("Admission metrics registered");
}

// ============================================================================
// Metric Recording Functions
// ============================================================================

/// Record tickets issued.
pub fn record_tickets_issued(count: u64) {
    metrics::counter!("admission_tickets_issued_total").increment(count);
}

/// Record a payload regeneration.
pub fn record_ticket_regenerated() {
    metrics::counter!("admission_tickets_regenerated_total").increment(1);
}

/// Record a cancellation.
pub fn record_ticket_cancelled() {
    metrics::counter!("admission_tickets_cancelled_total").increment(1);
}

/// Record a validation outcome.
///
/// # Arguments
///
/// * `reason` - Outcome of the validation
/// * `duration_secs` - Time taken by `validate()` in seconds
pub fn record_scan(reason: ValidationReason, duration_secs: f64) {
    metrics::counter!("admission_scans_total", "reason" => reason.as_str()).increment(1);
    metrics::histogram!("admission_validation_duration_seconds").record(duration_secs);
}

/// Record a validation that could not complete.
pub fn record_scan_failure(duration_secs: f64) {
    metrics::counter!("admission_scan_failures_total").increment(1);
    metrics::histogram!("admission_validation_duration_seconds").record(duration_secs);
}

/// Record an attendance event dropped on a full channel.
pub fn record_attendance_event_dropped() {
    metrics::counter!("admission_attendance_events_dropped_total").increment(1);
}

use std::net::SocketAddr;

use crate::validator::{Outcome, ValidationError};

// ── Validation (request-driven) ─────────────────────────────────

/// Counter: validation passes. Labels: outcome.
pub const VALIDATIONS_TOTAL: &str = "timeline_validations_total";

/// Histogram: validation latency in seconds, lookup included.
pub const VALIDATION_DURATION_SECONDS: &str = "timeline_validation_duration_seconds";

/// Counter: passes that found at least one resource conflict.
pub const CONFLICTS_DETECTED_TOTAL: &str = "timeline_conflicts_detected_total";

/// Counter: failed cross-project resource lookups.
pub const LOOKUP_FAILURES_TOTAL: &str = "timeline_lookup_failures_total";

// ── Trigger ─────────────────────────────────────────────────────

/// Counter: write events handled. Labels: kind.
pub const EVENTS_TOTAL: &str = "timeline_events_total";

/// Counter: patches written to the store.
pub const PATCHES_WRITTEN_TOTAL: &str = "timeline_patches_written_total";

/// Counter: patches not written because the document already matched.
pub const PATCHES_SKIPPED_TOTAL: &str = "timeline_patches_skipped_total";

/// Counter: items that failed during bulk re-validation.
pub const REVALIDATION_FAILURES_TOTAL: &str = "timeline_revalidation_failures_total";

// ── Journal ─────────────────────────────────────────────────────

/// Histogram: journal group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "timeline_journal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (records per flush).
pub const JOURNAL_FLUSH_BATCH_SIZE: &str = "timeline_journal_flush_batch_size";

/// Counter: completed journal compactions.
pub const JOURNAL_COMPACTIONS_TOTAL: &str = "timeline_journal_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for the result of one validation pass.
pub fn outcome_label(result: &Result<Outcome, &ValidationError>) -> &'static str {
    match result {
        Ok(Outcome::DateOrder) => "date_order",
        Ok(Outcome::Cycle) => "cycle",
        Ok(Outcome::Clean) => "clean",
        Err(ValidationError::InvalidDate { .. }) => "invalid_date",
        Err(ValidationError::Lookup(_)) => "lookup_error",
    }
}

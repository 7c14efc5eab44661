//! Prometheus metrics for monitoring
//!
//! The market maker runs one pass per invocation and exposes no network
//! surface, so the registry is written in text exposition format to a file
//! that a node exporter textfile collector can pick up.
//!
//! Exposes metrics for:
//! - Transaction attempts by operation and outcome
//! - Reconciliation actions and state drift
//! - Pass health and duration

use crate::error::MarketResult;

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram, CounterVec,
    Encoder, Gauge, GaugeVec, Histogram, TextEncoder,
};
use std::fs;
use std::path::Path;
use tracing::debug;

lazy_static! {
    // Transaction metrics
    pub static ref TX_ATTEMPTS: CounterVec = register_counter_vec!(
        "rental_tx_attempts_total",
        "Transaction lifecycle attempts by operation and outcome",
        &["operation", "outcome"]
    ).unwrap();

    // Reconciliation metrics
    pub static ref ACTIONS: CounterVec = register_counter_vec!(
        "rental_actions_total",
        "Reconciliation actions taken",
        &["action"]
    ).unwrap();

    pub static ref STATE_DRIFT: CounterVec = register_counter_vec!(
        "rental_state_drift_total",
        "Local records corrected toward chain state, by kind",
        &["kind"]
    ).unwrap();

    pub static ref TRACKED_ASSETS: GaugeVec = register_gauge_vec!(
        "rental_tracked_assets",
        "Assets in the tracking store",
        &["status"]
    ).unwrap();

    // Health metrics
    pub static ref PASS_HEALTHY: Gauge = register_gauge!(
        "rental_pass_healthy",
        "Whether the last pass passed the ledger health gate (1=healthy)"
    ).unwrap();

    pub static ref PASS_DURATION: Histogram = register_histogram!(
        "rental_pass_duration_seconds",
        "Wall time of a reconciliation pass",
        vec![5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]
    ).unwrap();
}

/// Write all registered metrics to `path` in text exposition format
pub fn write_textfile(path: &Path) -> MarketResult<()> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| crate::error::MarketError::Store(format!("metrics encoding: {}", e)))?;

    let tmp_path = path.with_extension("prom.tmp");
    fs::write(&tmp_path, &buffer)?;
    fs::rename(&tmp_path, path)?;
    debug!("Wrote metrics textfile {:?}", path);
    Ok(())
}

// Helper functions to record metrics

pub fn record_tx_attempt(operation: &str, outcome: &str) {
    TX_ATTEMPTS
        .with_label_values(&[operation, outcome])
        .inc();
}

pub fn record_action(action: &str) {
    ACTIONS.with_label_values(&[action]).inc();
}

pub fn record_state_drift(kind: &str) {
    STATE_DRIFT.with_label_values(&[kind]).inc();
}

pub fn record_tracked_assets(listed: usize, unlisted: usize) {
    TRACKED_ASSETS
        .with_label_values(&["listed"])
        .set(listed as f64);
    TRACKED_ASSETS
        .with_label_values(&["unlisted"])
        .set(unlisted as f64);
}

pub fn record_health(healthy: bool) {
    PASS_HEALTHY.set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_pass_duration(secs: f64) {
    PASS_DURATION.observe(secs);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_textfile_contains_recorded_metrics() {
        record_tx_attempt("cancel", "confirmed");
        record_state_drift("canceled_elsewhere");

        let dir = tempdir().unwrap();
        let path = dir.path().join("rental.prom");
        write_textfile(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("rental_tx_attempts_total"));
        assert!(text.contains("rental_state_drift_total"));
    }
}

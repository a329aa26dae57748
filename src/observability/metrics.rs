//! # Metrics
//!
//! Prometheus metrics for monitoring both sidecars.
//!
//! ## Metrics Exposed
//!
//! - `csi_sidecar_reconciliations_total` - Reconciliations started, by controller
//! - `csi_sidecar_reconciliation_errors_total` - Failed reconciliations, by controller
//! - `csi_sidecar_reconciliation_duration_seconds` - Reconciliation latency, by controller
//! - `csi_sidecar_requeues_total` - Requeues, by reason
//! - `csi_sidecar_driver_operations_total` - Driver calls, by operation and outcome
//! - `csi_sidecar_driver_operation_duration_seconds` - Driver call latency, by operation

use anyhow::Result;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "csi_sidecar_reconciliations_total",
            "Total number of reconciliations",
        ),
        &["controller"],
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "csi_sidecar_reconciliation_errors_total",
            "Total number of reconciliation errors",
        ),
        &["controller", "kind"],
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "csi_sidecar_reconciliation_duration_seconds",
            "Duration of reconciliation in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 300.0]),
        &["controller"],
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static REQUEUES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("csi_sidecar_requeues_total", "Total number of requeues"),
        &["reason"],
    )
    .expect("Failed to create REQUEUES_TOTAL metric - this should never happen")
});

static DRIVER_OPERATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "csi_sidecar_driver_operations_total",
            "Total number of CSI driver calls",
        ),
        &["operation", "outcome"],
    )
    .expect("Failed to create DRIVER_OPERATIONS_TOTAL metric - this should never happen")
});

static DRIVER_OPERATION_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "csi_sidecar_driver_operation_duration_seconds",
            "Duration of CSI driver calls in seconds",
        )
        .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
        &["operation"],
    )
    .expect("Failed to create DRIVER_OPERATION_DURATION metric - this should never happen")
});

pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(REQUEUES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DRIVER_OPERATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DRIVER_OPERATION_DURATION.clone()))?;
    Ok(())
}

pub fn increment_reconciliations(controller: &str) {
    RECONCILIATIONS_TOTAL.with_label_values(&[controller]).inc();
}

pub fn increment_reconciliation_errors(controller: &str, kind: &str) {
    RECONCILIATION_ERRORS_TOTAL
        .with_label_values(&[controller, kind])
        .inc();
}

pub fn observe_reconciliation_duration(controller: &str, duration: f64) {
    RECONCILIATION_DURATION
        .with_label_values(&[controller])
        .observe(duration);
}

pub fn increment_requeues_total(reason: &str) {
    REQUEUES_TOTAL.with_label_values(&[reason]).inc();
}

pub fn observe_driver_operation(operation: &str, success: bool, duration: f64) {
    let outcome = if success { "success" } else { "error" };
    DRIVER_OPERATIONS_TOTAL
        .with_label_values(&[operation, outcome])
        .inc();
    DRIVER_OPERATION_DURATION
        .with_label_values(&[operation])
        .observe(duration);
}

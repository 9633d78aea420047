//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `gitops_reconciler_passes_total{result}` - Finished reconciliation passes by result
//! - `gitops_reconciler_pass_duration_seconds` - Duration of reconciliation passes
//! - `gitops_reconciler_resources_applied_total{action}` - Resources created or updated
//! - `gitops_reconciler_resources_pruned_total` - Resources deleted by prune
//! - `gitops_reconciler_resource_errors_total` - Resource-scoped failures
//! - `gitops_reconciler_health_check_failures_total` - Failed or timed-out health checks
//! - `gitops_reconciler_secret_renders_total{outcome}` - Secret materializations by outcome
//! - `gitops_reconciler_load_errors_total` - Rejected snapshot loads
//! - `gitops_reconciler_snapshot_fetch_errors_total` - Failed snapshot fetches
//! - `gitops_reconciler_invariant_violations_total` - Dependency ordering violations observed
//! - `gitops_reconciler_units{state}` - Current number of units per state
//! - `gitops_reconciler_target_operation_duration_seconds{operation}` - Target call latency

use anyhow::Result;
use prometheus::{
    Histogram, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
};
use std::sync::{LazyLock, OnceLock};

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static REGISTERED: OnceLock<()> = OnceLock::new();

static PASSES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "gitops_reconciler_passes_total",
            "Total number of finished reconciliation passes",
        ),
        &["result"],
    )
    .expect("Failed to create PASSES_TOTAL metric - this should never happen")
});

static PASS_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "gitops_reconciler_pass_duration_seconds",
            "Duration of reconciliation passes in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
    )
    .expect("Failed to create PASS_DURATION metric - this should never happen")
});

static RESOURCES_APPLIED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "gitops_reconciler_resources_applied_total",
            "Total number of resources created or updated",
        ),
        &["action"],
    )
    .expect("Failed to create RESOURCES_APPLIED_TOTAL metric - this should never happen")
});

static RESOURCES_PRUNED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gitops_reconciler_resources_pruned_total",
        "Total number of resources deleted by prune",
    )
    .expect("Failed to create RESOURCES_PRUNED_TOTAL metric - this should never happen")
});

static RESOURCE_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gitops_reconciler_resource_errors_total",
        "Total number of resource-scoped failures (malformed or unsupported documents)",
    )
    .expect("Failed to create RESOURCE_ERRORS_TOTAL metric - this should never happen")
});

static HEALTH_CHECK_FAILURES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gitops_reconciler_health_check_failures_total",
        "Total number of failed or timed-out health checks",
    )
    .expect("Failed to create HEALTH_CHECK_FAILURES_TOTAL metric - this should never happen")
});

static SECRET_RENDERS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "gitops_reconciler_secret_renders_total",
            "Total number of secret materializations by outcome",
        ),
        &["outcome"],
    )
    .expect("Failed to create SECRET_RENDERS_TOTAL metric - this should never happen")
});

static LOAD_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gitops_reconciler_load_errors_total",
        "Total number of rejected snapshot loads",
    )
    .expect("Failed to create LOAD_ERRORS_TOTAL metric - this should never happen")
});

static SNAPSHOT_FETCH_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gitops_reconciler_snapshot_fetch_errors_total",
        "Total number of failed snapshot fetches",
    )
    .expect("Failed to create SNAPSHOT_FETCH_ERRORS_TOTAL metric - this should never happen")
});

static INVARIANT_VIOLATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gitops_reconciler_invariant_violations_total",
        "Total number of dependency ordering violations observed",
    )
    .expect("Failed to create INVARIANT_VIOLATIONS_TOTAL metric - this should never happen")
});

static UNITS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        Opts::new("gitops_reconciler_units", "Current number of units per state"),
        &["state"],
    )
    .expect("Failed to create UNITS metric - this should never happen")
});

static TARGET_OPERATION_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new(
            "gitops_reconciler_target_operation_duration_seconds",
            "Duration of target system get/apply/delete calls in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        &["operation"],
    )
    .expect("Failed to create TARGET_OPERATION_DURATION metric - this should never happen")
});

/// Register all metrics with the registry
///
/// Safe to call more than once; only the first call registers.
pub fn register_metrics() -> Result<()> {
    if REGISTERED.get().is_some() {
        return Ok(());
    }
    REGISTRY.register(Box::new(PASSES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PASS_DURATION.clone()))?;
    REGISTRY.register(Box::new(RESOURCES_APPLIED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RESOURCES_PRUNED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RESOURCE_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(HEALTH_CHECK_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SECRET_RENDERS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(LOAD_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SNAPSHOT_FETCH_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INVARIANT_VIOLATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(UNITS.clone()))?;
    REGISTRY.register(Box::new(TARGET_OPERATION_DURATION.clone()))?;
    let _ = REGISTERED.set(());

    Ok(())
}

pub fn increment_passes(result: &str) {
    PASSES_TOTAL.with_label_values(&[result]).inc();
}

pub fn observe_pass_duration(duration: f64) {
    PASS_DURATION.observe(duration);
}

pub fn increment_resources_applied(action: &str) {
    RESOURCES_APPLIED_TOTAL.with_label_values(&[action]).inc();
}

pub fn increment_resources_pruned() {
    RESOURCES_PRUNED_TOTAL.inc();
}

pub fn increment_resource_errors() {
    RESOURCE_ERRORS_TOTAL.inc();
}

pub fn increment_health_check_failures() {
    HEALTH_CHECK_FAILURES_TOTAL.inc();
}

pub fn increment_secret_renders(outcome: &str) {
    SECRET_RENDERS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn increment_load_errors() {
    LOAD_ERRORS_TOTAL.inc();
}

pub fn increment_snapshot_fetch_errors() {
    SNAPSHOT_FETCH_ERRORS_TOTAL.inc();
}

pub fn increment_invariant_violations() {
    INVARIANT_VIOLATIONS_TOTAL.inc();
}

pub fn set_units_in_state(state: &str, count: i64) {
    UNITS.with_label_values(&[state]).set(count);
}

pub fn observe_target_operation_duration(operation: &str, duration: f64) {
    TARGET_OPERATION_DURATION
        .with_label_values(&[operation])
        .observe(duration);
}

//! Prometheus metrics for the agent
//!
//! Everything registers into the default prometheus registry; [`render`]
//! produces the text exposition format for whoever scrapes it.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, Counter, CounterVec, Encoder, Gauge,
    TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Weaving
    // ─────────────────────────────────────────────────────────────────────────────

    /// Load hook results.
    ///
    /// Labels:
    /// - result: "woven", "unchanged" or "failed"
    pub static ref WEAVE_RESULTS: CounterVec = register_counter_vec!(
        "spotlight_weave_results_total",
        "Classes seen by the load hook, by result",
        &["result"]
    ).expect("failed to register WEAVE_RESULTS metric");

    /// Classes skipped before parsing because the matcher rejected them.
    pub static ref CLASSES_IGNORED: Counter = register_counter!(
        "spotlight_classes_ignored_total",
        "Classes the matcher did not select for weaving"
    ).expect("failed to register CLASSES_IGNORED metric");

    pub static ref METHODS_INSTRUMENTED: Counter = register_counter!(
        "spotlight_methods_instrumented_total",
        "Methods that received trace probes"
    ).expect("failed to register METHODS_INSTRUMENTED metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Trace gate
    // ─────────────────────────────────────────────────────────────────────────────

    /// Probe callbacks that reached the tracer.
    ///
    /// Labels:
    /// - event: "start", "end" or "error"
    pub static ref PROBE_EVENTS: CounterVec = register_counter_vec!(
        "spotlight_probe_events_total",
        "Probe callbacks forwarded to the tracer",
        &["event"]
    ).expect("failed to register PROBE_EVENTS metric");

    /// Tracer calls that failed or panicked and were swallowed.
    pub static ref PROBE_FAILURES: Counter = register_counter!(
        "spotlight_probe_failures_total",
        "Tracer failures swallowed by the trace gate"
    ).expect("failed to register PROBE_FAILURES metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Subscription sync
    // ─────────────────────────────────────────────────────────────────────────────

    /// Synchronizer ticks.
    ///
    /// Labels:
    /// - outcome: "completed", "skipped", "disabled" or "failed"
    pub static ref SYNC_TICKS: CounterVec = register_counter_vec!(
        "spotlight_sync_ticks_total",
        "Subscription sync ticks by outcome",
        &["outcome"]
    ).expect("failed to register SYNC_TICKS metric");

    /// Labels:
    /// - change: "added" or "removed"
    pub static ref SUBSCRIPTION_CHANGES: CounterVec = register_counter_vec!(
        "spotlight_subscription_changes_total",
        "Artifact keys added to or removed from the active set",
        &["change"]
    ).expect("failed to register SUBSCRIPTION_CHANGES metric");

    pub static ref SUBSCRIPTIONS_ACTIVE: Gauge = register_gauge!(
        "spotlight_subscriptions_active",
        "Artifact keys currently subscribed for tracing"
    ).expect("failed to register SUBSCRIPTIONS_ACTIVE metric");

    /// Whether the sync loop is enabled (1) or paused (0).
    pub static ref SYNC_ENABLED: Gauge = register_gauge!(
        "spotlight_sync_enabled",
        "Whether subscription sync is enabled (1) or disabled (0)"
    ).expect("failed to register SYNC_ENABLED metric");
}

/// Initialize gauges so they show up before the first update.
pub fn init() {
    SUBSCRIPTIONS_ACTIVE.set(0.0);
    SYNC_ENABLED.set(1.0);
}

pub fn set_sync_enabled(enabled: bool) {
    SYNC_ENABLED.set(if enabled { 1.0 } else { 0.0 });
}

pub fn set_active_subscriptions(count: usize) {
    SUBSCRIPTIONS_ACTIVE.set(count as f64);
}

/// Text exposition of every registered metric.
pub fn render() -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

//! Trace gate - the runtime side of the woven probes
//!
//! Every instrumented method calls into the gate on entry, before each
//! return and on abrupt exit. The gate checks the subscription registry and
//! only then talks to the tracer, so an unsubscribed method costs one
//! read-locked set lookup per probe.
//!
//! # Architecture
//!
//! ```text
//! woven method ──► bridge class (JNI) ──► trigger_* (global gate)
//!                                              │
//!                                              ▼
//!                                   TraceGate::trigger_*
//!                                              │
//!                           registry.contains(key)? ── no ──► return
//!                                              │ yes
//!                                              ▼
//!                                    dyn Tracer (OtelTracer)
//! ```
//!
//! Tracer calls are isolated with `catch_unwind`: a broken tracer never
//! unwinds into application code.

pub mod otel;

use std::error::Error;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

use tracing::warn;

use crate::metrics::{PROBE_EVENTS, PROBE_FAILURES};
use crate::registry::SubscriptionRegistry;

pub use otel::OtelTracer;

/// The external tracer the gate drives.
///
/// Implementations own the per-thread context: `start_*_span` must make the
/// new span current for the calling thread and `stop_span` must end the
/// current span and restore its parent.
pub trait Tracer: Send + Sync {
    /// Whether the calling thread currently has an active trace context.
    fn has_active_context(&self) -> bool;
    fn start_root_span(&self, name: &str);
    fn start_local_span(&self, name: &str);
    fn stop_span(&self);
    /// Attach an error to the current span.
    fn record_error(&self, error: &dyn Error);
}

/// An exception that escaped an instrumented method, as reported by the
/// bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeError {
    /// Dotted class name of the throwable
    pub class: String,
    pub message: Option<String>,
}

impl ProbeError {
    pub fn new(class: impl Into<String>, message: Option<String>) -> Self {
        Self {
            class: class.into(),
            message,
        }
    }
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.class, message),
            None => f.write_str(&self.class),
        }
    }
}

impl Error for ProbeError {}

/// Gates probe callbacks on the subscription registry.
#[derive(Clone)]
pub struct TraceGate {
    registry: Arc<SubscriptionRegistry>,
    tracer: Arc<dyn Tracer>,
}

impl fmt::Debug for TraceGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceGate")
            .field("subscriptions", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl TraceGate {
    pub fn new(registry: Arc<SubscriptionRegistry>, tracer: Arc<dyn Tracer>) -> Self {
        Self { registry, tracer }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Method entry. Starts a root span when the thread has no context,
    /// otherwise a child of the current span.
    pub fn trigger_start(&self, key: &str) {
        if !self.registry.contains(key) {
            return;
        }
        self.guarded("start", key, |tracer| {
            if tracer.has_active_context() {
                tracer.start_local_span(key);
            } else {
                tracer.start_root_span(key);
            }
        });
    }

    /// Normal method exit.
    pub fn trigger_end(&self, key: &str) {
        if !self.registry.contains(key) {
            return;
        }
        self.guarded("end", key, |tracer| {
            if tracer.has_active_context() {
                tracer.stop_span();
            }
        });
    }

    /// Abrupt method exit. The error is recorded on the current span before
    /// it is stopped; the exception itself keeps propagating in the host.
    pub fn trigger_end_with_error(&self, error: &dyn Error, key: &str) {
        if !self.registry.contains(key) {
            return;
        }
        self.guarded("error", key, |tracer| {
            if tracer.has_active_context() {
                tracer.record_error(error);
                tracer.stop_span();
            }
        });
    }

    fn guarded<F>(&self, event: &'static str, key: &str, call: F)
    where
        F: FnOnce(&dyn Tracer),
    {
        let tracer = self.tracer.as_ref();
        match panic::catch_unwind(AssertUnwindSafe(|| call(tracer))) {
            Ok(()) => PROBE_EVENTS.with_label_values(&[event]).inc(),
            Err(_) => {
                PROBE_FAILURES.inc();
                warn!(event, key, "Tracer panicked inside probe callback");
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Process-wide gate for the bridge class
// ─────────────────────────────────────────────────────────────────────────────

static GLOBAL_GATE: OnceLock<TraceGate> = OnceLock::new();

/// Install the gate the bridge entry points forward to. Only the first call
/// wins; returns `false` if a gate was already installed.
pub fn install(gate: TraceGate) -> bool {
    GLOBAL_GATE.set(gate).is_ok()
}

pub fn installed() -> Option<&'static TraceGate> {
    GLOBAL_GATE.get()
}

/// Bridge entry for `triggerStart(String)`.
pub fn trigger_start(key: &str) {
    if let Some(gate) = GLOBAL_GATE.get() {
        gate.trigger_start(key);
    }
}

/// Bridge entry for `triggerEnd(String)`.
pub fn trigger_end(key: &str) {
    if let Some(gate) = GLOBAL_GATE.get() {
        gate.trigger_end(key);
    }
}

/// Bridge entry for `triggerEndWithError(Throwable, String)`.
pub fn trigger_end_with_error(error: &dyn Error, key: &str) {
    if let Some(gate) = GLOBAL_GATE.get() {
        gate.trigger_end_with_error(error, key);
    }
}

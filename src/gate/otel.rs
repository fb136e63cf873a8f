//! OpenTelemetry adapter for the trace gate
//!
//! Spans are created through the globally installed tracer provider (the
//! one [`crate::tracing::init_tracing`] sets up), so probe spans and the
//! agent's own `tracing` spans land in the same backend.
//!
//! Each thread keeps a stack of attached contexts. Starting a span attaches
//! a context holding it; stopping ends the current span and drops the top
//! guard, which restores the parent context.

use std::cell::RefCell;
use std::error::Error;

use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer as _};
use opentelemetry::{Context, ContextGuard, KeyValue};

use super::Tracer;

/// Instrumentation scope name used for probe spans.
pub const INSTRUMENTATION_NAME: &str = "spotlight";

thread_local! {
    static ATTACHED: RefCell<Vec<ContextGuard>> = const { RefCell::new(Vec::new()) };
}

pub struct OtelTracer {
    tracer: BoxedTracer,
}

impl Default for OtelTracer {
    fn default() -> Self {
        Self::new()
    }
}

impl OtelTracer {
    pub fn new() -> Self {
        Self {
            tracer: global::tracer(INSTRUMENTATION_NAME),
        }
    }

    fn start(&self, name: &str, parent: &Context, root: bool) {
        let span = self
            .tracer
            .span_builder(name.to_string())
            .with_kind(SpanKind::Internal)
            .with_attributes(vec![
                KeyValue::new("code.function", name.to_string()),
                KeyValue::new("spotlight.root", root),
            ])
            .start_with_context(&self.tracer, parent);

        let guard = parent.with_span(span).attach();
        ATTACHED.with(|stack| stack.borrow_mut().push(guard));
    }

    /// Spans this thread has started and not yet stopped.
    pub fn open_spans() -> usize {
        ATTACHED.with(|stack| stack.borrow().len())
    }
}

impl Tracer for OtelTracer {
    fn has_active_context(&self) -> bool {
        Context::current().has_active_span()
    }

    fn start_root_span(&self, name: &str) {
        // A fresh context: no parent span even if something upstream left
        // one attached.
        self.start(name, &Context::new(), true);
    }

    fn start_local_span(&self, name: &str) {
        self.start(name, &Context::current(), false);
    }

    fn stop_span(&self) {
        Context::current().span().end();
        ATTACHED.with(|stack| {
            stack.borrow_mut().pop();
        });
    }

    fn record_error(&self, error: &dyn Error) {
        let cx = Context::current();
        let span = cx.span();
        span.record_error(error);
        span.set_status(Status::error(error.to_string()));
    }
}

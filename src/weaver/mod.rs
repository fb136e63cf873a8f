//! Method probe weaver
//!
//! Rewrites an eligible class so that every weavable method calls into the
//! trace gate bridge on entry, before every return, and on abrupt exit.
//!
//! # Architecture
//!
//! ```text
//! bytes ──► ClassFile::parse
//!              │
//!              ├─ for each method: MethodFilter::skip_reason ──► skip
//!              │                    format_artifact_key       ──► key
//!              │
//!              ├─ ProbeRefs::register (gate methodrefs, once per class)
//!              ├─ method::instrument  (decode → insert → assemble → remap)
//!              │
//!              └─ ClassFile::to_bytes ──► woven bytes
//! ```
//!
//! # Fail-open
//!
//! [`Weaver::transform`] never fails and never panics: any error (or a
//! panic inside the weaver) is logged and the original bytes are handed
//! back, so a broken weave only costs tracing coverage for that class.

pub mod filter;
mod method;

use std::borrow::Cow;
use std::panic::{self, AssertUnwindSafe};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, trace};

use crate::classfile::{ClassFile, ClassFileError, CodeAttribute};
use crate::descriptor::{dotted, format_artifact_key, DescriptorError};
use crate::metrics::{METHODS_INSTRUMENTED, WEAVE_RESULTS};

pub use filter::{MethodFilter, SkipReason, DEFAULT_DENIED_METHODS};
pub use method::{ERROR_DESCRIPTOR, KEY_DESCRIPTOR};

/// The static methods probes call, in JVM internal naming.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GateTarget {
    /// Internal name of the bridge class (`a/b/C`)
    pub owner: String,
    /// `static void start(String key)`
    pub start: String,
    /// `static void end(String key)`
    pub end: String,
    /// `static void endWithError(Throwable error, String key)`
    pub end_with_error: String,
}

impl Default for GateTarget {
    fn default() -> Self {
        Self {
            owner: "spotlight/agent/TraceGate".to_string(),
            start: "triggerStart".to_string(),
            end: "triggerEnd".to_string(),
            end_with_error: "triggerEndWithError".to_string(),
        }
    }
}

/// Why a class could not be woven.
#[derive(Debug, Error)]
pub enum WeaveError {
    #[error(transparent)]
    MalformedDescriptor(#[from] DescriptorError),
    #[error("transformation failed: {0}")]
    TransformationFailure(#[from] ClassFileError),
    #[error("weaver panicked: {0}")]
    Panicked(String),
}

/// A successfully rewritten class.
#[derive(Debug, Clone)]
pub struct WovenClass {
    /// Dotted class name taken from the class file itself
    pub class_name: String,
    pub bytes: Vec<u8>,
    /// Artifact keys of every instrumented method, in declaration order
    pub instrumented: Vec<String>,
}

#[derive(Debug)]
pub enum TransformOutcome {
    Woven { instrumented: Vec<String> },
    /// Nothing to instrument (or not eligible)
    Unchanged,
    Failed(WeaveError),
}

/// Result of the load hook: the bytes to hand back plus what happened.
#[derive(Debug)]
pub struct Transformed<'a> {
    pub bytes: Cow<'a, [u8]>,
    pub outcome: TransformOutcome,
}

impl<'a> Transformed<'a> {
    pub fn unchanged(bytes: &'a [u8]) -> Self {
        Self {
            bytes: Cow::Borrowed(bytes),
            outcome: TransformOutcome::Unchanged,
        }
    }
}

/// Stateless class rewriter. Safe to share across loader threads.
#[derive(Debug, Clone, Default)]
pub struct Weaver {
    gate: GateTarget,
    filter: MethodFilter,
}

impl Weaver {
    pub fn new(gate: GateTarget, filter: MethodFilter) -> Self {
        Self { gate, filter }
    }

    pub fn gate(&self) -> &GateTarget {
        &self.gate
    }

    /// Rewrite a class. `Ok(None)` means no method qualified for probes.
    pub fn weave(&self, bytes: &[u8]) -> Result<Option<WovenClass>, WeaveError> {
        let mut class = ClassFile::parse(bytes)?;
        if class.is_module() {
            return Ok(None);
        }
        let class_name = class.name()?;

        // (method index, Code attribute index, artifact key)
        let mut plan = Vec::new();
        for (index, method) in class.methods.iter().enumerate() {
            let name = method.name(&class.constant_pool)?;
            let descriptor = method.descriptor(&class.constant_pool)?;

            if let Some(reason) = self.filter.skip_reason(method.access_flags, &name, &descriptor) {
                trace!(class = %class_name, method = %name, ?reason, "Skipping method");
                continue;
            }
            let Some(code_index) = method.find_attribute(&class.constant_pool, "Code")? else {
                continue;
            };

            let key = format_artifact_key(&class_name, &name, &descriptor)?;
            plan.push((index, code_index, key));
        }

        if plan.is_empty() {
            return Ok(None);
        }

        let refs = method::ProbeRefs::register(&mut class.constant_pool, &self.gate)?;
        let stack_maps = class.uses_stack_maps();
        let mut instrumented = Vec::with_capacity(plan.len());

        for (method_index, code_index, key) in plan {
            let key_index = class.constant_pool.add_string(&key)?;
            let code = CodeAttribute::parse(&class.methods[method_index].attributes[code_index].info)?;
            let woven = method::instrument(&code, &mut class.constant_pool, key_index, &refs, stack_maps)?;
            class.methods[method_index].attributes[code_index].info = woven.to_bytes()?;
            instrumented.push(key);
        }

        Ok(Some(WovenClass {
            class_name: dotted(&class_name),
            bytes: class.to_bytes()?,
            instrumented,
        }))
    }

    /// Fail-open wrapper used by the load hook.
    pub fn transform<'a>(&self, class_name: &str, bytes: &'a [u8]) -> Transformed<'a> {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.weave(bytes)))
            .unwrap_or_else(|payload| Err(WeaveError::Panicked(panic_message(payload.as_ref()))));

        match result {
            Ok(Some(woven)) => {
                WEAVE_RESULTS.with_label_values(&["woven"]).inc();
                METHODS_INSTRUMENTED.inc_by(woven.instrumented.len() as f64);
                debug!(
                    class = %class_name,
                    methods = woven.instrumented.len(),
                    size = woven.bytes.len(),
                    "Woven class"
                );
                Transformed {
                    bytes: Cow::Owned(woven.bytes),
                    outcome: TransformOutcome::Woven {
                        instrumented: woven.instrumented,
                    },
                }
            }
            Ok(None) => {
                WEAVE_RESULTS.with_label_values(&["unchanged"]).inc();
                Transformed::unchanged(bytes)
            }
            Err(e) => {
                WEAVE_RESULTS.with_label_values(&["failed"]).inc();
                error!(class = %class_name, error = %e, "Weaving failed, loading original class");
                Transformed {
                    bytes: Cow::Borrowed(bytes),
                    outcome: TransformOutcome::Failed(e),
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests;

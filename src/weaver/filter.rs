//! Methods that are never wrapped with probes.

use std::collections::HashSet;

use crate::classfile::{ACC_ABSTRACT, ACC_BRIDGE, ACC_NATIVE, ACC_STATIC, ACC_SYNTHETIC};

/// Dynamic-dispatch plumbing and injected introspection accessors.
///
/// Wrapping these breaks dispatch layers built on top of the host language
/// (metaclass lookups, call site caches, missing-member fallbacks).
pub const DEFAULT_DENIED_METHODS: &[&str] = &[
    // Metaclass accessors
    "getMetaClass",
    "setMetaClass",
    "$getStaticMetaClass",
    // Dynamic invocation and property fallbacks
    "invokeMethod",
    "getProperty",
    "setProperty",
    "methodMissing",
    "propertyMissing",
    "$static_methodMissing",
    "$static_propertyMissing",
    // Call site bootstrapping
    "$getCallSiteArray",
    "$createCallSiteArray",
    // Coverage agent accessor
    "$jacocoInit",
];

const MAIN_DESCRIPTOR: &str = "([Ljava/lang/String;)V";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Abstract or native, nothing to wrap.
    NoCode,
    /// `public static void main(String[])`
    EntryPoint,
    /// `<init>` or `<clinit>`
    Initializer,
    /// Compiler generated (synthetic or bridge)
    Synthetic,
    /// On the method denylist
    Denied,
}

#[derive(Debug, Clone)]
pub struct MethodFilter {
    denied: HashSet<String>,
}

impl Default for MethodFilter {
    fn default() -> Self {
        Self::new(std::iter::empty::<String>())
    }
}

impl MethodFilter {
    /// Default denylist plus `extra_denied` method names.
    pub fn new<I>(extra_denied: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let denied = DEFAULT_DENIED_METHODS
            .iter()
            .map(|s| s.to_string())
            .chain(extra_denied.into_iter().map(Into::into))
            .collect();
        Self { denied }
    }

    pub fn is_denied(&self, name: &str) -> bool {
        self.denied.contains(name)
    }

    /// Why a method must be left alone, or `None` if it gets probes.
    pub fn skip_reason(&self, access_flags: u16, name: &str, descriptor: &str) -> Option<SkipReason> {
        if access_flags & (ACC_ABSTRACT | ACC_NATIVE) != 0 {
            return Some(SkipReason::NoCode);
        }
        if name == "<init>" || name == "<clinit>" {
            return Some(SkipReason::Initializer);
        }
        if access_flags & ACC_STATIC != 0 && name == "main" && descriptor == MAIN_DESCRIPTOR {
            return Some(SkipReason::EntryPoint);
        }
        if access_flags & (ACC_SYNTHETIC | ACC_BRIDGE) != 0 {
            return Some(SkipReason::Synthetic);
        }
        if self.is_denied(name) {
            return Some(SkipReason::Denied);
        }
        None
    }
}

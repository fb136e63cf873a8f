//! Class eligibility for weaving
//!
//! Decides, per class name, whether the weaver may touch it.
//!
//! ```text
//! name ──► normalize (a/b/C → a.b.C)
//!            │
//!            ├─ excluded prefix?              ──► false   (always wins)
//!            ├─ no inclusion pattern matches? ──► false
//!            ├─ own namespace && !test_mode?  ──► false
//!            └────────────────────────────────► true
//! ```
//!
//! The own-namespace rule keeps the agent from instrumenting its own
//! control code, which would recurse through the trace gate.

use regex::Regex;

use crate::descriptor::dotted;

/// Platform internals, the tracer runtime and the agent's own runtime.
pub const DEFAULT_EXCLUDED_PREFIXES: &[&str] = &[
    // Class loading and platform internals
    "java.",
    "javax.",
    "jdk.",
    "sun.",
    "com.sun.",
    // External tracer runtime
    "io.opentelemetry.",
    // Gate bridge and subscription synchronizer
    "spotlight.agent.",
];

/// Everything shipped by this project lives under this package.
pub const OWN_NAMESPACE: &str = "spotlight.";

/// Compiled inclusion patterns plus the exclusion prefix list.
#[derive(Debug, Clone)]
pub struct ClassMatcher {
    patterns: Vec<Regex>,
    excluded_prefixes: Vec<String>,
    test_mode: bool,
}

impl ClassMatcher {
    /// Compile `patterns` as full-match regular expressions.
    ///
    /// `extra_excluded` is appended to [`DEFAULT_EXCLUDED_PREFIXES`].
    pub fn new<P, E>(patterns: P, extra_excluded: E, test_mode: bool) -> Result<Self, regex::Error>
    where
        P: IntoIterator,
        P::Item: AsRef<str>,
        E: IntoIterator,
        E::Item: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| Regex::new(&format!("^(?:{})$", p.as_ref())))
            .collect::<Result<Vec<_>, _>>()?;

        let excluded_prefixes = DEFAULT_EXCLUDED_PREFIXES
            .iter()
            .map(|s| s.to_string())
            .chain(extra_excluded.into_iter().map(|p| dotted(p.as_ref())))
            .collect();

        Ok(Self {
            patterns,
            excluded_prefixes,
            test_mode,
        })
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    /// Check if a class name hits an exclusion prefix.
    pub fn is_excluded(&self, class_name: &str) -> bool {
        let name = dotted(class_name);
        self.excluded_prefixes
            .iter()
            .any(|prefix| name.starts_with(prefix.as_str()))
    }

    /// Check if a class may be woven.
    pub fn is_eligible(&self, class_name: &str) -> bool {
        // Array pseudo-classes and anonymous (hidden) loads carry no usable name.
        if class_name.is_empty() || class_name.starts_with('[') {
            return false;
        }
        if self.is_excluded(class_name) {
            return false;
        }

        let name = dotted(class_name);
        if !self.patterns.iter().any(|p| p.is_match(&name)) {
            return false;
        }

        self.test_mode || !name.starts_with(OWN_NAMESPACE)
    }
}

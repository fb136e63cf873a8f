//! Spotlight - selective method tracing agent for the JVM
//!
//! Injects entry/exit probes into selected methods as classes load, and
//! keeps the set of traced methods in sync with a remote control plane so
//! tracing cost is only paid for methods someone is watching.
//!
//! # Modules
//!
//! - `descriptor` - method descriptor to artifact key formatting
//! - `matcher` - which classes are eligible for weaving
//! - `classfile` - class file parser, instruction IR and writer
//! - `weaver` - probe injection (fail-open load hook)
//! - `registry` - the shared set of subscribed artifact keys
//! - `gate` - runtime side of the probes, drives the tracer
//! - `sync` - control plane client and the subscription synchronizer
//! - `config` - TOML + environment configuration
//! - `agent` - composition root and lifecycle
//! - `metrics` - Prometheus metrics for observability
//! - `tracing` - logging and OTLP span export
//!
//! # Quick Start
//!
//! ```ignore
//! use spotlight::{Agent, AgentConfig};
//!
//! let config = AgentConfig::load("spotlight.toml")?;
//! let agent = Agent::from_config(config)?;
//! agent.start()?;
//!
//! // from the class load hook
//! let bytes = agent.transform("com/acme/Checkout", &original);
//! ```

pub mod agent;
pub mod classfile;
pub mod config;
pub mod descriptor;
pub mod gate;
pub mod matcher;
pub mod metrics;
pub mod registry;
pub mod sync;
pub mod tracing;
pub mod weaver;

// Re-export commonly used types at crate root for convenience
pub use agent::{Agent, AgentError};
pub use config::{AgentConfig, ConfigError};
pub use descriptor::{format_artifact_key, DescriptorError};
pub use gate::{ProbeError, TraceGate, Tracer};
pub use matcher::ClassMatcher;
pub use registry::{SubscriptionDiff, SubscriptionRegistry};
pub use sync::{ControlPlane, Subscription, SubscriptionSynchronizer, TickOutcome};
pub use weaver::{TransformOutcome, Weaver, WeaveError};

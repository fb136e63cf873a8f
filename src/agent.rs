//! Agent - wires the load hook, the trace gate and subscription sync
//!
//! # Architecture
//!
//! ```text
//!  host class loader
//!        │ transform(name, bytes)
//!        ▼
//!  ClassMatcher ── not eligible ──► original bytes
//!        │
//!        ▼
//!  Weaver (fail-open) ──► woven or original bytes
//!
//!  woven probes ──► TraceGate ──read──► SubscriptionRegistry ◄──write── SubscriptionSynchronizer
//!                      │                                                      │
//!                      ▼                                                      ▼
//!                 dyn Tracer                                         dyn ControlPlane
//! ```
//!
//! The registry is created here and handed to both the gate and the
//! synchronizer; neither reaches it through a global.

use std::borrow::Cow;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, trace};

use crate::config::{AgentConfig, ConfigError};
use crate::gate::{self, OtelTracer, TraceGate, Tracer};
use crate::matcher::ClassMatcher;
use crate::metrics::{self, CLASSES_IGNORED};
use crate::registry::SubscriptionRegistry;
use crate::sync::{ControlPlane, HttpControlPlane, SubscriptionSynchronizer, SyncError};
use crate::weaver::{Transformed, Weaver};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to build control plane client: {0}")]
    Client(#[from] SyncError),
    #[error("agent must be started from inside a tokio runtime")]
    NoRuntime,
}

pub struct Agent {
    config: AgentConfig,
    matcher: ClassMatcher,
    weaver: Weaver,
    registry: Arc<SubscriptionRegistry>,
    gate: TraceGate,
    synchronizer: Arc<SubscriptionSynchronizer>,
    sync_task: Mutex<Option<JoinHandle<()>>>,
}

impl Agent {
    /// Build an agent around an explicit tracer and control plane client.
    pub fn new(
        config: AgentConfig,
        tracer: Arc<dyn Tracer>,
        client: Arc<dyn ControlPlane>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        metrics::init();

        let matcher = config.matcher()?;
        let weaver = Weaver::new(config.gate.clone(), config.method_filter());
        let registry = Arc::new(SubscriptionRegistry::new());
        let gate = TraceGate::new(Arc::clone(&registry), tracer);

        let synchronizer = Arc::new(SubscriptionSynchronizer::new(
            Arc::clone(&registry),
            client,
            config.identity()?,
            config.sync_interval(),
        ));
        synchronizer.set_enabled(config.sync.enabled);

        Ok(Self {
            config,
            matcher,
            weaver,
            registry,
            gate,
            synchronizer,
            sync_task: Mutex::new(None),
        })
    }

    /// Production wiring: OpenTelemetry tracer and the HTTP control plane.
    pub fn from_config(config: AgentConfig) -> Result<Self, AgentError> {
        config.validate()?;
        let url = config
            .control_plane
            .url
            .clone()
            .ok_or(ConfigError::MissingControlPlaneUrl)?;
        let client = HttpControlPlane::new(
            url,
            config.control_plane.token.clone(),
            config.request_timeout(),
        )?;
        Ok(Self::new(config, Arc::new(OtelTracer::new()), Arc::new(client))?)
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn gate(&self) -> &TraceGate {
        &self.gate
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn synchronizer(&self) -> &Arc<SubscriptionSynchronizer> {
        &self.synchronizer
    }

    /// Load hook with the outcome attached.
    pub fn transform_class<'a>(&self, class_name: &str, bytes: &'a [u8]) -> Transformed<'a> {
        if !self.matcher.is_eligible(class_name) {
            CLASSES_IGNORED.inc();
            trace!(class = %class_name, "Class not selected for weaving");
            return Transformed::unchanged(bytes);
        }
        self.weaver.transform(class_name, bytes)
    }

    /// Load hook: returns the bytes the host should define. Never fails.
    pub fn transform<'a>(&self, class_name: &str, bytes: &'a [u8]) -> Cow<'a, [u8]> {
        self.transform_class(class_name, bytes).bytes
    }

    /// Install the bridge gate and start the sync loop. Idempotent.
    pub fn start(&self) -> Result<(), AgentError> {
        tokio::runtime::Handle::try_current().map_err(|_| AgentError::NoRuntime)?;

        if !gate::install(self.gate.clone()) {
            info!("Bridge gate already installed, keeping the existing one");
        }

        let mut task = self.task();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }
        *task = Some(Arc::clone(&self.synchronizer).spawn());

        info!(
            application = %self.synchronizer.identity().application_id,
            instance = %self.synchronizer.identity().instance_id,
            patterns = self.matcher.pattern_count(),
            sync_enabled = self.synchronizer.is_enabled(),
            "Spotlight agent started"
        );
        Ok(())
    }

    pub fn set_sync_enabled(&self, enabled: bool) {
        self.synchronizer.set_enabled(enabled);
    }

    /// Stop the sync loop and clear all subscriptions.
    pub fn shutdown(&self) {
        if let Some(task) = self.task().take() {
            task.abort();
        }
        self.registry.clear();
        info!("Spotlight agent stopped");
    }

    fn task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.sync_task.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        if let Some(task) = self.task().take() {
            task.abort();
        }
    }
}

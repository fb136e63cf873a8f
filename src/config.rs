//! Agent configuration
//!
//! Loaded from a TOML file, then overridden by `SPOTLIGHT_*` environment
//! variables, then validated.
//!
//! ```toml
//! patterns = ["com\\.acme\\..*"]
//! excluded_prefixes = ["com.acme.generated."]
//! denied_methods = ["toString"]
//! test_mode = false
//! otlp_endpoint = "http://localhost:4317"
//!
//! [control_plane]
//! url = "https://spotlight.example.com"
//! token = "..."
//! application_id = "checkout"
//! timeout_secs = 10
//!
//! [sync]
//! enabled = true
//! interval_secs = 5
//!
//! [gate]
//! owner = "spotlight/agent/TraceGate"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::matcher::ClassMatcher;
use crate::sync::AgentIdentity;
use crate::weaver::{GateTarget, MethodFilter};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("no class patterns configured")]
    MissingPatterns,
    #[error("no control plane URL configured")]
    MissingControlPlaneUrl,
    #[error("no application id configured")]
    MissingApplicationId,
    #[error("invalid class pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
    #[error("invalid value {value:?} for {name}")]
    InvalidEnv { name: &'static str, value: String },
    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },
}

/// Where and as whom to sync subscriptions.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Base URL of the control plane API
    pub url: Option<String>,
    /// Bearer token, if the control plane requires one
    pub token: Option<String>,
    pub application_id: Option<String>,
    /// Generated per process when unset
    pub instance_id: Option<String>,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            application_id: None,
            instance_id: None,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 5,
        }
    }
}

/// Top-level agent configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Class name regexes; a class must fully match one to be woven
    pub patterns: Vec<String>,
    /// Dotted prefixes excluded on top of the built-in list
    pub excluded_prefixes: Vec<String>,
    /// Method names never woven, on top of the built-in denylist
    pub denied_methods: Vec<String>,
    /// Allow weaving classes in the agent's own namespace
    pub test_mode: bool,
    pub gate: GateTarget,
    pub control_plane: ControlPlaneConfig,
    pub sync: SyncConfig,
    /// OTLP collector endpoint for spans
    pub otlp_endpoint: Option<String>,
}

impl AgentConfig {
    /// Parse TOML text.
    pub fn from_toml(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Read a TOML file and apply environment overrides. Callers pick the
    /// validation they need.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml(&text, path)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `SPOTLIGHT_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any variable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(patterns) = lookup("SPOTLIGHT_PATTERNS") {
            self.patterns = split_list(&patterns);
        }
        if let Some(prefixes) = lookup("SPOTLIGHT_EXCLUDED_PREFIXES") {
            self.excluded_prefixes = split_list(&prefixes);
        }
        if let Some(url) = lookup("SPOTLIGHT_CONTROL_PLANE_URL") {
            self.control_plane.url = Some(url);
        }
        if let Some(id) = lookup("SPOTLIGHT_APPLICATION_ID") {
            self.control_plane.application_id = Some(id);
        }
        if let Some(id) = lookup("SPOTLIGHT_INSTANCE_ID") {
            self.control_plane.instance_id = Some(id);
        }
        if let Some(token) = lookup("SPOTLIGHT_TOKEN") {
            self.control_plane.token = Some(token);
        }
        if let Some(value) = lookup("SPOTLIGHT_SYNC_ENABLED") {
            self.sync.enabled = parse_bool("SPOTLIGHT_SYNC_ENABLED", &value)?;
        }
        if let Some(value) = lookup("SPOTLIGHT_SYNC_INTERVAL_SECS") {
            self.sync.interval_secs = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                name: "SPOTLIGHT_SYNC_INTERVAL_SECS",
                value,
            })?;
        }
        if let Some(value) = lookup("SPOTLIGHT_TEST_MODE") {
            self.test_mode = parse_bool("SPOTLIGHT_TEST_MODE", &value)?;
        }
        if let Some(endpoint) = lookup("SPOTLIGHT_OTLP_ENDPOINT") {
            self.otlp_endpoint = Some(endpoint);
        }
        Ok(())
    }

    /// Everything the load hook needs: patterns present and compilable.
    pub fn validate_weaving(&self) -> Result<(), ConfigError> {
        if self.patterns.is_empty() {
            return Err(ConfigError::MissingPatterns);
        }
        self.matcher()?;
        Ok(())
    }

    /// Full validation for a running agent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_weaving()?;
        if is_blank(&self.control_plane.url) {
            return Err(ConfigError::MissingControlPlaneUrl);
        }
        if is_blank(&self.control_plane.application_id) {
            return Err(ConfigError::MissingApplicationId);
        }
        if self.control_plane.timeout_secs == 0 {
            return Err(ConfigError::ZeroDuration {
                field: "control_plane.timeout_secs",
            });
        }
        if self.sync.interval_secs == 0 {
            return Err(ConfigError::ZeroDuration {
                field: "sync.interval_secs",
            });
        }
        Ok(())
    }

    pub fn matcher(&self) -> Result<ClassMatcher, ConfigError> {
        Ok(ClassMatcher::new(
            &self.patterns,
            &self.excluded_prefixes,
            self.test_mode,
        )?)
    }

    pub fn method_filter(&self) -> MethodFilter {
        MethodFilter::new(self.denied_methods.iter().cloned())
    }

    /// Identity reported to the control plane. A missing instance id is
    /// generated (UUID v7), so call this once per process.
    pub fn identity(&self) -> Result<AgentIdentity, ConfigError> {
        let application_id = self
            .control_plane
            .application_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .ok_or(ConfigError::MissingApplicationId)?;
        let instance_id = self
            .control_plane
            .instance_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
        Ok(AgentIdentity::new(application_id, instance_id))
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.control_plane.timeout_secs)
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            name,
            value: value.to_string(),
        }),
    }
}

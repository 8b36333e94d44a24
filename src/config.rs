//! Service configuration
//!
//! Loaded from TOML or assembled with `with_*` methods:
//!
//! ```rust
//! use trueno_ab::config::{EmptyRemotePolicy, ServiceConfig};
//!
//! let config = ServiceConfig::from_toml_str(
//!     r#"
//!     remote_timeout_ms = 1500
//!     empty_remote = "adopt-empty"
//!     "#,
//! )?;
//! assert_eq!(config.remote_timeout_ms, 1500);
//! assert_eq!(config.empty_remote, EmptyRemotePolicy::AdoptEmpty);
//! assert_eq!(config.event_log_capacity, 1000);
//! # Ok::<(), trueno_ab::Error>(())
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::registry::SyncMode;
use crate::{Error, Result};

/// Default bound on every remote call.
pub const DEFAULT_REMOTE_TIMEOUT_MS: u64 = 5_000;

/// Default cap on the local event log.
pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 1_000;

/// What the registry does when the remote authority answers with zero
/// enabled experiments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmptyRemotePolicy {
    /// Treat an empty answer like a failure and serve the active baseline.
    #[default]
    FallbackToBaseline,
    /// Trust the remote: no experiment is active.
    AdoptEmpty,
}

/// Configuration for [`crate::ExperimentService`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Timeout applied to every remote fetch, write and event delivery.
    pub remote_timeout_ms: u64,
    /// Maximum number of events retained by the local log.
    pub event_log_capacity: usize,
    /// Namespace for persisted keys.
    pub key_prefix: String,
    /// Behavior on a legitimately empty remote result.
    pub empty_remote: EmptyRemotePolicy,
    /// Subscribe to remote changes during `init()` when remote-enabled.
    pub live_updates: bool,
    /// Mode used until one has been persisted.
    pub default_mode: SyncMode,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            remote_timeout_ms: DEFAULT_REMOTE_TIMEOUT_MS,
            event_log_capacity: DEFAULT_EVENT_LOG_CAPACITY,
            key_prefix: "ab".to_string(),
            empty_remote: EmptyRemotePolicy::default(),
            live_updates: false,
            default_mode: SyncMode::default(),
        }
    }
}

impl ServiceConfig {
    /// Parse a TOML document. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the document is not valid TOML or a field
    /// has the wrong type, and `Error::Configuration` if
    /// `event_log_capacity` is zero.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        if config.event_log_capacity == 0 {
            return Err(Error::Configuration(
                "event_log_capacity must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }

    /// Read and parse a TOML config file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the file cannot be read and `Error::Config` if
    /// it cannot be parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "loaded experiment service config");
        Ok(config)
    }

    /// Set the remote timeout.
    #[must_use]
    pub const fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        // Saturate rather than wrap for absurd durations.
        self.remote_timeout_ms = if timeout.as_millis() > u64::MAX as u128 {
            u64::MAX
        } else {
            timeout.as_millis() as u64
        };
        self
    }

    /// Set the event log capacity. Zero is raised to one.
    #[must_use]
    pub const fn with_event_log_capacity(mut self, capacity: usize) -> Self {
        self.event_log_capacity = if capacity == 0 { 1 } else { capacity };
        self
    }

    /// Set the persisted key namespace.
    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the empty-remote policy.
    #[must_use]
    pub const fn with_empty_remote(mut self, policy: EmptyRemotePolicy) -> Self {
        self.empty_remote = policy;
        self
    }

    /// Enable or disable live updates during `init()`.
    #[must_use]
    pub const fn with_live_updates(mut self, enabled: bool) -> Self {
        self.live_updates = enabled;
        self
    }

    /// Set the mode used before any mode has been persisted.
    #[must_use]
    pub const fn with_default_mode(mut self, mode: SyncMode) -> Self {
        self.default_mode = mode;
        self
    }

    /// Remote timeout as a `Duration`.
    #[must_use]
    pub const fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    /// Fully qualified persisted key, e.g. `ab.identity`.
    #[must_use]
    pub fn key(&self, name: &str) -> String {
        if self.key_prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{name}", self.key_prefix)
        }
    }
}

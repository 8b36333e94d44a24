//! Error types for Trueno-AB
//!
//! Two families live here. Programmer errors (`Configuration`, `Assignment`)
//! are returned loudly from registration and bucketing. Environmental errors
//! (`Persistence`, `RemoteUnavailable`) are recovered inside the crate and
//! only surface from admin operations.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Trueno-AB error types
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed experiment definition or catalog
    #[error("Invalid experiment configuration: {0}\nFix the definition before rolling it out.")]
    Configuration(String),

    /// Bucketing could not produce a variant
    #[error("Assignment failed: {0}")]
    Assignment(String),

    /// Local state is corrupt or unreadable
    #[error("Persistence error: {0}\nCached state will be recomputed.")]
    Persistence(String),

    /// Remote authority could not be reached (network, auth or timeout)
    #[error("Remote store unavailable: {0}\nFalling back to baseline experiments.")]
    RemoteUnavailable(String),

    /// Admin operation referenced an unknown experiment
    #[error("Experiment not found: {0}")]
    ExperimentNotFound(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file could not be parsed
    #[error("Config parse error: {0}")]
    Config(#[from] toml::de::Error),
}

impl Error {
    /// Environmental errors are recovered automatically and never block
    /// the product feature under test.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Persistence(_) | Self::RemoteUnavailable(_) | Self::Io(_) | Self::Json(_)
        )
    }
}

//! Persisted sync mode flag

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Which source is authoritative for experiment definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// Only the compiled-in baseline is used.
    #[default]
    LocalOnly,
    /// The remote authority is consulted, with baseline fallback.
    RemoteEnabled,
}

impl SyncMode {
    /// Wire name of the mode.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::LocalOnly => "local-only",
            Self::RemoteEnabled => "remote-enabled",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "local-only" => Ok(Self::LocalOnly),
            "remote-enabled" => Ok(Self::RemoteEnabled),
            other => Err(Error::Persistence(format!("unknown sync mode {other:?}"))),
        }
    }
}

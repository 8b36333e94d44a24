//! Variant - one treatment arm of an experiment

use serde::{Deserialize, Serialize};

/// One arm of an experiment with its selection weight.
///
/// Weights are expected in `[0, 1]` and to sum to `1.0` across an
/// experiment. A drifting sum only distorts probability mass; bucketing
/// still produces a variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    id: String,
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    weight: f64,
}

impl Variant {
    /// Create a variant with the given ID, display name and weight.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, weight: f64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            weight,
        }
    }

    /// Attach a description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Get the variant ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the description, if any.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Get the selection weight.
    #[must_use]
    pub const fn weight(&self) -> f64 {
        self.weight
    }
}

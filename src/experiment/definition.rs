//! Experiment definition - the root entity of the registry

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Variant;
use crate::{Error, Result};

/// Tolerance for the weight-sum check. Sums outside `1.0 ± WEIGHT_EPSILON`
/// are logged, not rejected.
const WEIGHT_EPSILON: f64 = 1e-6;

/// A named A/B test with ordered variants and an optional activity window.
/// Serializes to the camelCase document exchanged with the remote store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    id: String,
    name: String,
    #[serde(default)]
    description: String,
    enabled: bool,
    variants: Vec<Variant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    end_date: Option<DateTime<Utc>>,
}

impl Experiment {
    /// Create a builder. Experiments are enabled by default.
    #[must_use]
    pub fn builder(id: impl Into<String>, name: impl Into<String>) -> ExperimentBuilder {
        ExperimentBuilder::new(id, name)
    }

    /// Convert a remote document into a validated experiment.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the document does not match the
    /// schema or fails validation.
    pub fn from_document(document: serde_json::Value) -> Result<Self> {
        let label = document
            .get("id")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("<missing id>")
            .to_string();
        let experiment: Self = serde_json::from_value(document)
            .map_err(|e| Error::Configuration(format!("document {label}: {e}")))?;
        experiment.validate()?;
        Ok(experiment)
    }

    /// Serialize into the remote document shape.
    ///
    /// # Errors
    ///
    /// Returns `Error::Json` if serialization fails.
    pub fn to_document(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Check structural invariants: non-empty id, at least one variant,
    /// unique non-empty variant ids, finite weights in `[0, 1]`, and an
    /// ordered activity window.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Configuration("experiment id is empty".to_string()));
        }
        if self.variants.is_empty() {
            return Err(Error::Configuration(format!(
                "experiment {} has no variants",
                self.id
            )));
        }

        let mut seen = HashSet::with_capacity(self.variants.len());
        for variant in &self.variants {
            if variant.id().trim().is_empty() {
                return Err(Error::Configuration(format!(
                    "experiment {} has a variant with an empty id",
                    self.id
                )));
            }
            if !seen.insert(variant.id()) {
                return Err(Error::Configuration(format!(
                    "experiment {} declares variant {} twice",
                    self.id,
                    variant.id()
                )));
            }
            let weight = variant.weight();
            if !weight.is_finite() || !(0.0..=1.0).contains(&weight) {
                return Err(Error::Configuration(format!(
                    "experiment {} variant {} has weight {weight} outside [0, 1]",
                    self.id,
                    variant.id()
                )));
            }
        }

        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if start > end {
                return Err(Error::Configuration(format!(
                    "experiment {} starts after it ends",
                    self.id
                )));
            }
        }

        let total = self.total_weight();
        if (total - 1.0).abs() > WEIGHT_EPSILON {
            tracing::warn!(
                experiment = %self.id,
                total_weight = total,
                "variant weights do not sum to 1.0; assignment probabilities are distorted"
            );
        }

        Ok(())
    }

    /// Active iff enabled and `now` lies inside `[start_date, end_date]`.
    /// Unset bounds are unbounded.
    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.enabled
            && self.start_date.map_or(true, |start| now >= start)
            && self.end_date.map_or(true, |end| now <= end)
    }

    /// `is_active_at(Utc::now())`.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.is_active_at(Utc::now())
    }

    /// Digest of the variant layout (ids, order, weights to six decimals).
    /// Persisted assignments are recomputed when it changes.
    #[must_use]
    pub fn fingerprint(&self) -> u32 {
        let layout = self
            .variants
            .iter()
            .map(|v| format!("{}={:.6}", v.id(), v.weight()))
            .collect::<Vec<_>>()
            .join("|");
        crate::bucketing::bucket_hash(&format!("{}#{layout}", self.id))
    }

    /// Return a copy with the enabled flag replaced.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Get the experiment ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the experiment name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Whether the experiment is switched on.
    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    /// Variants in declared order.
    #[must_use]
    pub fn variants(&self) -> &[Variant] {
        &self.variants
    }

    /// Look up a variant by ID.
    #[must_use]
    pub fn variant(&self, variant_id: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id() == variant_id)
    }

    /// Get the start of the activity window, if bounded.
    #[must_use]
    pub const fn start_date(&self) -> Option<DateTime<Utc>> {
        self.start_date
    }

    /// Get the end of the activity window, if bounded.
    #[must_use]
    pub const fn end_date(&self) -> Option<DateTime<Utc>> {
        self.end_date
    }

    /// Sum of all variant weights.
    #[must_use]
    pub fn total_weight(&self) -> f64 {
        self.variants.iter().map(Variant::weight).sum()
    }
}

/// Builder for `Experiment`.
#[derive(Debug)]
pub struct ExperimentBuilder {
    id: String,
    name: String,
    description: String,
    enabled: bool,
    variants: Vec<Variant>,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
}

impl ExperimentBuilder {
    /// Create a new builder with required fields.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            enabled: true,
            variants: Vec::new(),
            start_date: None,
            end_date: None,
        }
    }

    /// Set the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the enabled flag.
    #[must_use]
    pub const fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Append a variant. Declaration order is bucketing order.
    #[must_use]
    pub fn variant(mut self, variant: Variant) -> Self {
        self.variants.push(variant);
        self
    }

    /// Start of the activity window.
    #[must_use]
    pub const fn starts_at(mut self, start: DateTime<Utc>) -> Self {
        self.start_date = Some(start);
        self
    }

    /// End of the activity window.
    #[must_use]
    pub const fn ends_at(mut self, end: DateTime<Utc>) -> Self {
        self.end_date = Some(end);
        self
    }

    /// Build and validate the `Experiment`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the definition is malformed.
    pub fn build(self) -> Result<Experiment> {
        let experiment = Experiment {
            id: self.id,
            name: self.name,
            description: self.description,
            enabled: self.enabled,
            variants: self.variants,
            start_date: self.start_date,
            end_date: self.end_date,
        };
        experiment.validate()?;
        Ok(experiment)
    }
}

/// Validate a whole catalog: every experiment individually, plus unique ids.
///
/// # Errors
///
/// Returns `Error::Configuration` on the first malformed or duplicate entry.
pub fn validate_catalog(experiments: &[Experiment]) -> Result<()> {
    let mut seen = HashSet::with_capacity(experiments.len());
    for experiment in experiments {
        experiment.validate()?;
        if !seen.insert(experiment.id()) {
            return Err(Error::Configuration(format!(
                "duplicate experiment id {}",
                experiment.id()
            )));
        }
    }
    Ok(())
}

//! Per-variant reporting
//!
//! Stateless fold over `(events, experiments)`: raw counts and conversion
//! rate, no significance testing.

use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::events::{Event, EventKind};
use crate::experiment::Experiment;

/// Counts for one variant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantStats {
    /// Variant ID.
    pub variant_id: String,
    /// Variant display name.
    pub name: String,
    /// Recorded views.
    pub views: u64,
    /// Recorded conversions.
    pub conversions: u64,
    /// Recorded assignments.
    pub assignments: u64,
    /// `conversions / views`, `0.0` when there are no views.
    pub conversion_rate: f64,
}

impl VariantStats {
    /// Conversion rate as a percentage.
    #[must_use]
    pub fn conversion_rate_percent(&self) -> f64 {
        self.conversion_rate * 100.0
    }
}

/// Counts for every variant of one experiment, in declared order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentReport {
    /// Experiment ID.
    pub experiment_id: String,
    /// Experiment display name.
    pub name: String,
    /// Per-variant stats.
    pub variants: Vec<VariantStats>,
}

impl ExperimentReport {
    /// Stats for one variant.
    #[must_use]
    pub fn variant(&self, variant_id: &str) -> Option<&VariantStats> {
        self.variants.iter().find(|v| v.variant_id == variant_id)
    }

    /// Views across all variants.
    #[must_use]
    pub fn total_views(&self) -> u64 {
        self.variants.iter().map(|v| v.views).sum()
    }

    /// Conversions across all variants.
    #[must_use]
    pub fn total_conversions(&self) -> u64 {
        self.variants.iter().map(|v| v.conversions).sum()
    }
}

/// `conversions / views`, defined as `0.0` when `views == 0`.
#[must_use]
pub fn conversion_rate(conversions: u64, views: u64) -> f64 {
    if views == 0 {
        0.0
    } else {
        conversions as f64 / views as f64
    }
}

#[derive(Default, Clone, Copy)]
struct Counts {
    views: u64,
    conversions: u64,
    assignments: u64,
}

/// Aggregate events into one report per experiment.
///
/// Events for experiments or variants not in `experiments` are ignored.
#[must_use]
pub fn summarize(events: &[Event], experiments: &[Experiment]) -> Vec<ExperimentReport> {
    let mut counts: FxHashMap<(&str, &str), Counts> = FxHashMap::default();
    for event in events {
        let entry = counts
            .entry((event.test_id(), event.variant_id()))
            .or_default();
        match event.kind() {
            EventKind::View => entry.views += 1,
            EventKind::Conversion => entry.conversions += 1,
            EventKind::Assignment => entry.assignments += 1,
        }
    }

    experiments
        .iter()
        .map(|experiment| ExperimentReport {
            experiment_id: experiment.id().to_string(),
            name: experiment.name().to_string(),
            variants: experiment
                .variants()
                .iter()
                .map(|variant| {
                    let c = counts
                        .get(&(experiment.id(), variant.id()))
                        .copied()
                        .unwrap_or_default();
                    VariantStats {
                        variant_id: variant.id().to_string(),
                        name: variant.name().to_string(),
                        views: c.views,
                        conversions: c.conversions,
                        assignments: c.assignments,
                        conversion_rate: conversion_rate(c.conversions, c.views),
                    }
                })
                .collect(),
        })
        .collect()
}

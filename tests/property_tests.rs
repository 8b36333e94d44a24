//! Property-based tests for bucketing and validation
//!
//! - Test determinism and range invariants of the bucket point
//! - Test that assignment always lands on a declared variant
//! - Run with ProptestConfig::with_cases(256)

use proptest::prelude::*;
use trueno_ab::bucketing::{assign, bucket_point, select_variant};
use trueno_ab::experiment::{Experiment, Variant};

// ============================================================================
// Property Test Generators (Strategies)
// ============================================================================

/// Generate 1..=6 positive weights normalized to sum to 1.
fn arb_weights() -> impl Strategy<Value = Vec<f64>> {
    proptest::collection::vec(1u32..1000, 1..=6).prop_map(|raw| {
        let total: u32 = raw.iter().sum();
        raw.iter()
            .map(|&w| f64::from(w) / f64::from(total))
            .collect()
    })
}

fn experiment(id: &str, weights: &[f64]) -> Experiment {
    let mut builder = Experiment::builder(id, id);
    for (i, &weight) in weights.iter().enumerate() {
        builder = builder.variant(Variant::new(format!("v{i}"), format!("V{i}"), weight));
    }
    builder.build().unwrap()
}

// ============================================================================
// Bucketing Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Property: the bucket point is in [0, 1)
    #[test]
    fn prop_bucket_point_in_unit_interval(identity in ".{0,64}", exp_id in "[a-z-]{1,32}") {
        let point = bucket_point(&identity, &exp_id);
        prop_assert!((0.0..1.0).contains(&point));
    }

    /// Property: same inputs, same variant
    #[test]
    fn prop_assign_is_deterministic(identity in "[a-z0-9-]{1,40}", weights in arb_weights()) {
        let exp = experiment("checkout-cta", &weights);
        let first = assign(&identity, &exp).unwrap().to_string();
        let rebuilt = experiment("checkout-cta", &weights);
        prop_assert_eq!(assign(&identity, &rebuilt).unwrap(), first.as_str());
    }

    /// Property: the result is always one of the declared variants
    #[test]
    fn prop_assign_returns_declared_variant(identity in ".{0,40}", weights in arb_weights()) {
        let exp = experiment("split", &weights);
        let variant = assign(&identity, &exp).unwrap();
        prop_assert!(exp.variant(variant).is_some());
    }

    /// Property: a single variant receives everyone
    #[test]
    fn prop_single_variant_gets_everyone(identity in ".{0,40}") {
        let exp = experiment("solo", &[1.0]);
        prop_assert_eq!(assign(&identity, &exp).unwrap(), "v0");
    }

    /// Property: a zero-weight variant never receives anyone
    #[test]
    fn prop_zero_weight_variant_is_never_chosen(identity in ".{0,40}") {
        let exp = experiment("holdout", &[0.0, 1.0]);
        prop_assert_eq!(assign(&identity, &exp).unwrap(), "v1");
    }

    /// Property: selection is monotone in the bucket point
    #[test]
    fn prop_select_is_monotone(weights in arb_weights(), a in 0.0f64..1.0, b in 0.0f64..1.0) {
        let exp = experiment("mono", &weights);
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let index = |point: f64| {
            let id = select_variant(exp.variants(), point).unwrap().id();
            exp.variants().iter().position(|v| v.id() == id).unwrap()
        };
        prop_assert!(index(lo) <= index(hi));
    }

    /// Property: empty variant lists select nothing
    #[test]
    fn prop_empty_variants_select_nothing(point in 0.0f64..1.0) {
        prop_assert!(select_variant(&[], point).is_none());
    }
}

// ============================================================================
// Validation Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: weights outside [0, 1] are rejected
    #[test]
    fn prop_out_of_range_weight_rejected(weight in prop_oneof![-100.0f64..-0.001, 1.001f64..100.0]) {
        let result = Experiment::builder("bad", "bad")
            .variant(Variant::new("A", "A", weight))
            .build();
        prop_assert!(result.is_err());
    }

    /// Property: documents keep variant order and weights through JSON
    #[test]
    fn prop_document_round_trip(weights in arb_weights()) {
        let exp = experiment("doc", &weights);
        let back = Experiment::from_document(exp.to_document().unwrap()).unwrap();
        prop_assert_eq!(back.id(), exp.id());
        prop_assert_eq!(back.variants().len(), exp.variants().len());
        for (a, b) in back.variants().iter().zip(exp.variants()) {
            prop_assert_eq!(a.id(), b.id());
            prop_assert!((a.weight() - b.weight()).abs() < 1e-12);
        }
    }
}

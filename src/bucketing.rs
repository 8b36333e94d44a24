//! Deterministic weighted bucketing
//!
//! `assign` is a pure function of `(identity, experiment id, variant order
//! and weights)`: no I/O, no clock, no process-local seed. The same inputs
//! produce the same variant on every machine and after every restart.
//!
//! ## Algorithm
//!
//! 1. `h = |rolling_hash(identity + ":" + experiment_id)|` (32-bit, base 31)
//! 2. `r = (h mod 10000) / 10000`, so `r ∈ [0, 1)`
//! 3. Walk variants in declared order accumulating weight; the first
//!    variant whose cumulative weight exceeds `r` wins.
//! 4. If weights sum below `r`, the last variant wins.

use crate::experiment::{Experiment, Variant};
use crate::{Error, Result};

/// Resolution of the bucket point.
pub const BUCKET_RESOLUTION: u32 = 10_000;

/// 32-bit polynomial rolling hash (`h = h * 31 + unit`) over UTF-16 code
/// units, wrapped to `i32` and returned as its absolute value.
///
/// Hashing UTF-16 units keeps results identical to clients that bucket
/// with string char codes.
#[must_use]
pub fn bucket_hash(input: &str) -> u32 {
    let hash = input.encode_utf16().fold(0_i32, |hash, unit| {
        hash.wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(i32::from(unit))
    });
    hash.unsigned_abs()
}

/// Bucket point `r ∈ [0, 1)` for an identity within an experiment.
#[must_use]
pub fn bucket_point(identity: &str, experiment_id: &str) -> f64 {
    let hash = bucket_hash(&format!("{identity}:{experiment_id}"));
    f64::from(hash % BUCKET_RESOLUTION) / f64::from(BUCKET_RESOLUTION)
}

/// Select a variant from an ordered, weighted list for a bucket point.
///
/// Returns `None` only when `variants` is empty.
#[must_use]
pub fn select_variant(variants: &[Variant], point: f64) -> Option<&Variant> {
    let mut cumulative = 0.0;
    for variant in variants {
        cumulative += variant.weight();
        if point < cumulative {
            return Some(variant);
        }
    }
    // Weights summing below the point: rounding or a misconfigured catalog.
    variants.last()
}

/// Assign `identity` to a variant of `experiment`.
///
/// # Errors
///
/// Returns `Error::Assignment` if the experiment has no variants.
///
/// # Example
///
/// ```rust
/// use trueno_ab::bucketing::assign;
/// use trueno_ab::experiment::{Experiment, Variant};
///
/// let exp = Experiment::builder("checkout-cta", "Checkout CTA")
///     .variant(Variant::new("A", "Control", 0.5))
///     .variant(Variant::new("B", "Treatment", 0.5))
///     .build()?;
///
/// let first = assign("user-42", &exp)?;
/// assert_eq!(assign("user-42", &exp)?, first);
/// # Ok::<(), trueno_ab::Error>(())
/// ```
pub fn assign<'a>(identity: &str, experiment: &'a Experiment) -> Result<&'a str> {
    let point = bucket_point(identity, experiment.id());
    select_variant(experiment.variants(), point)
        .map(Variant::id)
        .ok_or_else(|| {
            Error::Assignment(format!(
                "experiment {} has zero variants",
                experiment.id()
            ))
        })
}

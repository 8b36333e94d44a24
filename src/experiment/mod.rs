//! Experiment definitions
//!
//! ## Schema Overview
//!
//! ```text
//! Experiment (1) ──< Variant (N)   [ordered, weighted]
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use trueno_ab::experiment::{Experiment, Variant};
//!
//! let experiment = Experiment::builder("checkout-cta", "Checkout CTA")
//!     .description("Button copy on the checkout page")
//!     .variant(Variant::new("A", "Buy now", 0.5))
//!     .variant(Variant::new("B", "Complete purchase", 0.5))
//!     .build()?;
//!
//! assert!(experiment.is_active());
//! # Ok::<(), trueno_ab::Error>(())
//! ```

mod definition;
mod variant;

pub use definition::{validate_catalog, Experiment, ExperimentBuilder};
pub use variant::Variant;

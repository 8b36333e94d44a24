//! # Trueno-AB: Deterministic Experiment Assignment Engine
//!
//! Trueno-AB buckets an anonymous identity into a variant of every active
//! experiment, persists the assignment, keeps experiment definitions in
//! sync between a compiled-in baseline and an optional remote authority,
//! and records view/conversion events for reporting.
//!
//! ## Design Principles
//!
//! - **Determinism**: bucketing is a pure hash of identity and experiment id
//! - **Fail-soft**: remote or storage failures degrade to the baseline, never
//!   to an error in the product feature under test
//! - **Fail-loud**: malformed experiment definitions are rejected at
//!   registration
//! - **Atomic swaps**: registry readers see a whole snapshot, old or new
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use trueno_ab::experiment::{Experiment, Variant};
//! use trueno_ab::ExperimentService;
//!
//! # async fn example() -> trueno_ab::Result<()> {
//! let service = ExperimentService::builder()
//!     .baseline(vec![Experiment::builder("checkout-cta", "Checkout CTA")
//!         .variant(Variant::new("A", "Buy now", 0.5))
//!         .variant(Variant::new("B", "Complete purchase", 0.5))
//!         .build()?])
//!     .build()?;
//!
//! service.init().await;
//!
//! if service.is_variant("checkout-cta", "B").await {
//!     // render variant B
//! }
//! service.record_view("checkout-cta").await;
//! service.record_conversion("checkout-cta", None).await;
//!
//! for report in service.report().await {
//!     println!("{}: {:?}", report.experiment_id, report.variants);
//! }
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod assignment;
pub mod bucketing;
pub mod config;
pub mod error;
pub mod events;
pub mod experiment;
pub mod identity;
pub mod kv;
pub mod registry;
pub mod report;
pub mod service;

pub use config::ServiceConfig;
pub use error::{Error, Result};
pub use service::{ExperimentService, ExperimentServiceBuilder};

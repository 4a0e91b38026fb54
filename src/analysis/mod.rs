//! Hierarchical reduction.
//!
//! Units are costed by the estimator, grouped by the chunker, evaluated
//! batch by batch and recombined by the reducer until one result remains.

pub mod chunker;
pub mod critique;
pub mod estimator;
pub mod evaluator;
pub mod reducer;
pub mod relevance;

pub use estimator::CharRatioEstimator;
pub use evaluator::BatchEvaluator;
pub use reducer::{Reducer, RunRequest};

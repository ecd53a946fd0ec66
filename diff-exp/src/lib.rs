//! Differential expression between two sets of cells
#![deny(missing_docs)]

/// differential expression algo
#[allow(clippy::module_inception)]
pub mod diff_exp;
/// p-value adjustment and combination
pub mod dist;
/// Wilcoxon rank-sum test
pub mod rank_sum;

pub use crate::diff_exp::{wilcoxon_differential_expression, DiffExpParams, DiffExpResult, PValueAdjust};

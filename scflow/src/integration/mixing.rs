//! Local batch mixing: for every cell, how far down its neighbour list one has
//! to go to meet `k` cells of each batch. Lower is better mixed.

use crate::nn::knn;
use crate::stats::median;
use ndarray::parallel::prelude::*;
use ndarray::{s, ArrayView2, Axis};
use scflow_types::Embedding;
use serde::{Deserialize, Serialize};

/// Settings for the mixing metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixingParams {
    /// neighbours required from each batch
    pub k: usize,
    /// neighbour list length; also the score when a batch is not reached
    pub max_k: usize,
    /// leading embedding dimensions used; 0 means all
    pub dims: usize,
}

impl Default for MixingParams {
    fn default() -> Self {
        MixingParams {
            k: 5,
            max_k: 300,
            dims: 0,
        }
    }
}

/// Per-cell mixing scores for `values` (cells x dims). `batches` holds one
/// batch code per row, `n_batches` the number of codes.
pub fn mixing_metric(values: &ArrayView2<f64>, batches: &[usize], n_batches: usize, params: &MixingParams) -> Vec<f64> {
    let dims = if params.dims == 0 {
        values.ncols()
    } else {
        params.dims.min(values.ncols())
    };
    let values = values.slice(s![.., ..dims]);
    let max_k = params.max_k.min(values.nrows());
    let nbrs = knn(&values, max_k, true);

    nbrs.indices
        .axis_iter(Axis(0))
        .into_par_iter()
        .map(|row| {
            let ranks = (0..n_batches)
                .map(|b| {
                    row.iter()
                        .enumerate()
                        .filter(|&(_, &j)| batches[j] == b)
                        .nth(params.k.saturating_sub(1))
                        .map_or(params.max_k, |(rank, _)| rank + 1) as f64
                })
                .collect::<Vec<_>>();
            median(&ranks)
        })
        .collect()
}

/// Summary of the per-cell mixing scores of one embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixingSummary {
    pub embedding: String,
    pub method: String,
    pub mean: f64,
    pub median: f64,
}

impl MixingSummary {
    pub fn new(embedding: &Embedding, scores: &[f64]) -> MixingSummary {
        let mean = if scores.is_empty() {
            f64::NAN
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        };
        MixingSummary {
            embedding: embedding.name.clone(),
            method: embedding.method.clone(),
            mean,
            median: median(scores),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::Array2;

    fn line(interleaved: bool) -> (Array2<f64>, Vec<usize>) {
        let n = 40;
        let values = Array2::from_shape_fn((n, 1), |(i, _)| i as f64);
        let batches = (0..n)
            .map(|i| if interleaved { i % 2 } else { usize::from(i >= n / 2) })
            .collect();
        (values, batches)
    }

    #[test]
    fn test_interleaved_beats_separated() {
        let params = MixingParams { k: 3, max_k: 40, dims: 0 };
        let (v, b) = line(true);
        let mixed = mixing_metric(&v.view(), &b, 2, &params);
        let (v, b) = line(false);
        let separated = mixing_metric(&v.view(), &b, 2, &params);
        assert!(median(&mixed) < median(&separated));
        assert_eq!(mixed.len(), 40);
    }

    #[test]
    fn test_unreached_batch_scores_max_k() {
        let params = MixingParams { k: 2, max_k: 3, dims: 0 };
        let (v, b) = line(false);
        let scores = mixing_metric(&v.view(), &b, 2, &params);
        // cell 0 sees only batch 0 in its 3 nearest; median of (2, 3)
        assert_eq!(scores[0], 2.5);
    }

    #[test]
    fn test_summary() {
        let emb = Embedding::new("integrated.cca", "cca", vec!["a".into(), "b".into(), "c".into()], Array2::zeros((3, 1)));
        let s = MixingSummary::new(&emb, &[1.0, 2.0, 6.0]);
        assert_eq!(s.mean, 3.0);
        assert_eq!(s.median, 2.0);
        assert_eq!(s.method, "cca");
    }
}

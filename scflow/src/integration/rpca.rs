//! Reciprocal PCA anchors.
//!
//! Each batch gets its own PCA and the other batch is projected into it.
//! A pair is an anchor when the query cell is a neighbour of the reference
//! cell in the reference space and the reference cell is a neighbour of the
//! query cell in the query space.

use super::anchors::{anchor_integrate, AnchorParams};
use super::{IntegrationInput, IntegrationMethod, MethodName};
use crate::dim_red::{fit_pca, l2_normalize_rows};
use crate::nn::knn_query;
use anyhow::Error;
use fxhash::FxHashSet;
use log::warn;
use ndarray::{ArrayView2, Axis};
use scflow_types::Embedding;

/// Anchors between reference rows `xr` and query rows `xq` (cells x features,
/// each scaled on its own), as `(reference, query)` positions sorted.
pub fn reciprocal_anchors(
    xr: &ArrayView2<f64>,
    xq: &ArrayView2<f64>,
    dims: usize,
    k: usize,
    seed: u64,
) -> Result<Vec<(usize, usize)>, Error> {
    let pr = fit_pca(xr, dims, seed)?;
    let pq = fit_pca(xq, dims, seed)?;

    let r_in_r = l2_normalize_rows(&pr.embedding);
    let q_in_r = l2_normalize_rows(&pr.project(xq));
    let r_in_q = l2_normalize_rows(&pq.project(xr));
    let q_in_q = l2_normalize_rows(&pq.embedding);

    // query neighbours of each reference cell, reference space
    let forward = knn_query(&q_in_r.view(), &r_in_r.view(), k);
    // reference neighbours of each query cell, query space
    let backward = knn_query(&r_in_q.view(), &q_in_q.view(), k);

    let mut back = FxHashSet::default();
    for (q, row) in backward.indices.axis_iter(Axis(0)).enumerate() {
        for &r in row.iter() {
            back.insert((r, q));
        }
    }
    let mut anchors = Vec::new();
    for (r, row) in forward.indices.axis_iter(Axis(0)).enumerate() {
        for &q in row.iter() {
            if back.contains(&(r, q)) {
                anchors.push((r, q));
            }
        }
    }
    anchors.sort_unstable();
    Ok(anchors)
}

pub struct Rpca {
    params: AnchorParams,
}

impl Rpca {
    pub fn new(params: AnchorParams) -> Rpca {
        Rpca { params }
    }
}

impl IntegrationMethod for Rpca {
    fn name(&self) -> MethodName {
        MethodName::Rpca
    }

    fn integrate(&self, input: &IntegrationInput, base: &Embedding) -> Result<Embedding, Error> {
        anchor_integrate(input, base, self.name(), &self.params, |reference, query| {
            if reference.len() < 2 || query.len() < 2 {
                warn!("rpca: batch too small for anchor search");
                return Ok(Vec::new());
            }
            let xr = input.batch_scaled(reference);
            let xq = input.batch_scaled(query);
            reciprocal_anchors(&xr.view(), &xq.view(), input.n_dims, self.params.k_anchor, input.seed)
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn test_identical_batches_anchor_to_themselves() {
        let x = Array2::from_shape_fn((20, 6), |(i, j)| ((i * 7 + j * 13) % 11) as f64 + ((i * j) % 5) as f64 * 0.3);
        let anchors = reciprocal_anchors(&x.view(), &x.view(), 4, 3, 1).unwrap();
        for i in 0..20 {
            assert!(anchors.contains(&(i, i)), "missing ({i}, {i})");
        }
        assert!(anchors.windows(2).all(|w| w[0] < w[1]));
    }
}

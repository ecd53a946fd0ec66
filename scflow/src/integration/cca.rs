//! Canonical correlation anchors.
//!
//! The cross-product of two batches' scaled expression is decomposed; its left
//! and right singular vectors give both batches coordinates in a shared space
//! of maximally correlated directions, where mutual neighbours become anchors.

use super::anchors::{anchor_integrate, AnchorParams};
use super::{IntegrationInput, IntegrationMethod, MethodName};
use crate::dim_red::rand_svd::RandSvd;
use crate::dim_red::{l2_normalize_rows, Pca};
use crate::nn::mutual_nearest_neighbors;
use anyhow::Error;
use log::warn;
use ndarray::{Array2, ArrayView2};
use scflow_types::Embedding;

/// Row-normalized canonical coordinates of the reference (`xr`) and query
/// (`xq`) cells, both cells x features.
pub fn canonical_embeddings(
    xr: &ArrayView2<f64>,
    xq: &ArrayView2<f64>,
    dims: usize,
    seed: u64,
) -> Result<(Array2<f64>, Array2<f64>), Error> {
    let cross = xr.dot(&xq.t());
    let k = dims.min(cross.nrows()).min(cross.ncols());
    let (u, _, v) = RandSvd::with_seed(seed).run_pca(&cross.view(), k)?;
    Ok((l2_normalize_rows(&u), l2_normalize_rows(&v)))
}

pub struct Cca {
    params: AnchorParams,
}

impl Cca {
    pub fn new(params: AnchorParams) -> Cca {
        Cca { params }
    }
}

impl IntegrationMethod for Cca {
    fn name(&self) -> MethodName {
        MethodName::Cca
    }

    fn integrate(&self, input: &IntegrationInput, base: &Embedding) -> Result<Embedding, Error> {
        anchor_integrate(input, base, self.name(), &self.params, |reference, query| {
            if reference.len() < 2 || query.len() < 2 {
                warn!("cca: batch too small for anchor search");
                return Ok(Vec::new());
            }
            let xr = input.batch_scaled(reference);
            let xq = input.batch_scaled(query);
            let (cr, cq) = canonical_embeddings(&xr.view(), &xq.view(), input.n_dims, input.seed)?;
            Ok(mutual_nearest_neighbors(&cr.view(), &cq.view(), self.params.k_anchor))
        })
    }
}

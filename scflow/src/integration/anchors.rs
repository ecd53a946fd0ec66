//! Anchor-based correction shared by the CCA, RPCA and JointPCA methods.
//!
//! An anchor pairs a reference cell with a query cell judged to be in the same
//! biological state. Each query cell is moved by a weighted average of the
//! `reference - query` difference vectors of its nearest anchors, measured in
//! the base embedding.

use super::{IntegrationInput, MethodName};
use crate::nn::knn_query;
use anyhow::Error;
use log::{info, warn};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis, Zip};
use scflow_types::{Embedding, PipelineError};
use serde::{Deserialize, Serialize};

/// Settings for anchor search and correction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorParams {
    /// neighbourhood size for mutual-neighbour anchor search
    pub k_anchor: usize,
    /// anchors consulted per query cell during correction
    pub k_weight: usize,
    /// bandwidth of the anchor weighting kernel
    pub sd_weight: f64,
}

impl Default for AnchorParams {
    fn default() -> Self {
        AnchorParams {
            k_anchor: 5,
            k_weight: 100,
            sd_weight: 1.0,
        }
    }
}

/// Move the `query` rows of `base` toward the `reference` rows. `anchors` hold
/// `(reference position, query position)` pairs, positions being indices into
/// the two slices. Returns the corrected query rows.
pub fn correct_query(
    base: &ArrayView2<f64>,
    reference: &[usize],
    query: &[usize],
    anchors: &[(usize, usize)],
    params: &AnchorParams,
) -> Array2<f64> {
    let mut out = base.select(Axis(0), query);
    if anchors.is_empty() {
        warn!("no anchors between {} reference and {} query cells", reference.len(), query.len());
        return out;
    }

    let anchor_rows = anchors.iter().map(|&(_, q)| query[q]).collect::<Vec<_>>();
    let anchor_pos = base.select(Axis(0), &anchor_rows);
    let shifts = &base.select(Axis(0), &anchors.iter().map(|&(r, _)| reference[r]).collect::<Vec<_>>()) - &anchor_pos;

    let nbrs = knn_query(&anchor_pos.view(), &out.view(), params.k_weight.max(1));

    Zip::from(out.rows_mut())
        .and(nbrs.indices.rows())
        .and(nbrs.distances.rows())
        .par_for_each(|mut row, idx, dist| {
            for (&a, w) in idx.iter().zip(anchor_weights(&dist, params.sd_weight)) {
                row.scaled_add(w, &shifts.row(a));
            }
        });
    out
}

/// Kernel weights for a sorted list of distances to the nearest anchors,
/// normalized to sum to 1. The farthest anchor gets the least weight; if every
/// weight vanishes they are made uniform.
pub fn anchor_weights(dist: &ArrayView1<f64>, sd: f64) -> Vec<f64> {
    let bandwidth = (2.0 / sd).powi(2);
    let d_max = dist.iter().cloned().fold(0.0, f64::max);
    let mut weights = dist
        .iter()
        .map(|&d| {
            let u = if d_max > 0.0 { 1.0 - d / d_max } else { 1.0 };
            1.0 - (-u / bandwidth).exp()
        })
        .collect::<Vec<_>>();
    let total: f64 = weights.iter().sum();
    if total > 0.0 {
        weights.iter_mut().for_each(|w| *w /= total);
    } else {
        let n = weights.len() as f64;
        weights.iter_mut().for_each(|w| *w = 1.0 / n);
    }
    weights
}

/// Correct every non-reference batch toward the reference batch (the largest)
/// using anchors from `find`, which receives the reference and query row
/// indices and returns `(reference position, query position)` pairs.
pub fn anchor_integrate<F>(
    input: &IntegrationInput,
    base: &Embedding,
    method: MethodName,
    params: &AnchorParams,
    mut find: F,
) -> Result<Embedding, Error>
where
    F: FnMut(&[usize], &[usize]) -> Result<Vec<(usize, usize)>, Error>,
{
    let mut values = base.values.clone();
    let reference_idx = input.reference_batch();
    let batches = input.batches.iter().collect::<Vec<_>>();
    if batches.len() < 2 {
        warn!("{}: single batch, nothing to integrate", method);
    }
    let Some(&(ref_name, reference)) = batches.get(reference_idx) else {
        return Err(PipelineError::EmptyInput(format!("{method}: no batches")).into());
    };

    for (b, &(name, query)) in batches.iter().enumerate() {
        if b == reference_idx {
            continue;
        }
        let anchors = find(reference, query)?;
        info!("{}: {} anchors between {} and {}", method, anchors.len(), ref_name, name);
        let corrected = correct_query(&base.values.view(), reference, query, &anchors, params);
        for (row, &cell) in corrected.axis_iter(Axis(0)).zip(query) {
            values.row_mut(cell).assign(&row);
        }
    }

    Ok(Embedding::new(
        method.embedding_name(),
        method.as_str(),
        base.cell_ids.clone(),
        values,
    ))
}

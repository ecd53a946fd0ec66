//! Label transfer from a reference atlas onto query cells.

use super::reference::ReferenceAtlas;
use crate::dim_red::{fit_pca, l2_normalize_rows};
use crate::features::find_variable_features;
use crate::integration::anchors::anchor_weights;
use crate::nn::{knn_query, mutual_nearest_neighbors};
use crate::normalization::{dense_features, normalize, Normalization, ScaleStats, SCALE_MAX_DEFAULT};
use anyhow::{Context, Error};
use fxhash::{FxHashMap, FxHashSet};
use log::{info, warn};
use ndarray::parallel::prelude::*;
use ndarray::Axis;
use scflow_types::{Dataset, PipelineError};
use serde::{Deserialize, Serialize};

/// Predicted label of one query cell. `score` is the share of the vote won by
/// the predicted label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelPrediction {
    pub cell_id: String,
    pub predicted_label: String,
    pub score: f64,
}

/// Predicts a reference label for every query cell. No confidence threshold is
/// applied: every cell gets a label.
pub trait LabelPredictor {
    fn name(&self) -> &'static str;

    /// `reference` rows must already be named by the query's gene symbols.
    fn predict(&self, reference: &ReferenceAtlas, query: &Dataset) -> Result<Vec<LabelPrediction>, Error>;
}

/// Settings for anchor-based label transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferParams {
    pub normalization: Normalization,
    /// reference variable genes used
    pub n_features: usize,
    pub n_pcs: usize,
    pub scale_max: f64,
    /// neighbourhood size for anchor search
    pub k_anchor: usize,
    /// anchors (or reference cells) voting for each query cell
    pub k_weight: usize,
    pub sd_weight: f64,
}

impl Default for TransferParams {
    fn default() -> Self {
        TransferParams {
            normalization: Normalization::SeuratLog,
            n_features: 2000,
            n_pcs: 30,
            scale_max: SCALE_MAX_DEFAULT,
            k_anchor: 5,
            k_weight: 50,
            sd_weight: 1.0,
        }
    }
}

/// Projects the query into the reference PCA, pairs mutual nearest neighbours
/// as anchors and lets each query cell's nearest anchors vote. Falls back to a
/// vote of the nearest reference cells when no anchor is found.
pub struct AnchorLabelTransfer {
    pub params: TransferParams,
    pub seed: u64,
}

impl AnchorLabelTransfer {
    pub fn new(params: TransferParams, seed: u64) -> AnchorLabelTransfer {
        AnchorLabelTransfer { params, seed }
    }
}

impl LabelPredictor for AnchorLabelTransfer {
    fn name(&self) -> &'static str {
        "anchor"
    }

    fn predict(&self, reference: &ReferenceAtlas, query: &Dataset) -> Result<Vec<LabelPrediction>, Error> {
        let p = &self.params;
        let query_rows: FxHashMap<&str, usize> = query
            .counts
            .feature_names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();
        let shared: FxHashSet<usize> = reference
            .counts
            .feature_names
            .iter()
            .enumerate()
            .filter(|(_, n)| query_rows.contains_key(n.as_str()))
            .map(|(i, _)| i)
            .collect();
        if shared.is_empty() {
            return Err(PipelineError::EmptyInput("genes shared by reference and query".to_string()).into());
        }

        let ref_lognorm = normalize(&reference.counts, p.normalization);
        let query_lognorm = normalize(&query.counts, p.normalization);

        let mut ref_features = find_variable_features(&ref_lognorm, reference.counts.num_features())
            .into_iter()
            .filter(|r| shared.contains(r))
            .take(p.n_features)
            .collect::<Vec<_>>();
        if ref_features.is_empty() {
            warn!("no variable reference genes among shared genes, using all {}", shared.len());
            ref_features = shared.iter().copied().collect();
            ref_features.sort_unstable();
        }
        let query_features = ref_features
            .iter()
            .map(|&r| query_rows[reference.counts.feature_names[r].as_str()])
            .collect::<Vec<_>>();
        info!("label transfer on {} genes", ref_features.len());

        let xr = dense_features(&ref_lognorm, &ref_features);
        let xq = dense_features(&query_lognorm, &query_features);
        let stats = ScaleStats::fit(&xr.view(), p.scale_max);
        let pca = fit_pca(&stats.apply(&xr.view()).view(), p.n_pcs, self.seed).context("reference PCA")?;
        let er = l2_normalize_rows(&pca.embedding);
        let eq = l2_normalize_rows(&pca.project(&stats.apply(&xq.view()).view()));

        let classes = reference.label_class();
        let codes = classes.codes(reference.labels.len());
        let anchors = mutual_nearest_neighbors(&eq.view(), &er.view(), p.k_anchor);
        let (nbrs, voter_labels) = if anchors.is_empty() {
            warn!("no anchors between query and reference, voting with nearest reference cells");
            (knn_query(&er.view(), &eq.view(), p.k_weight.max(1)), codes)
        } else {
            info!("{} anchors between query and reference", anchors.len());
            let anchor_rows = anchors.iter().map(|&(q, _)| q).collect::<Vec<_>>();
            let labels = anchors.iter().map(|&(_, r)| codes[r]).collect::<Vec<_>>();
            (knn_query(&eq.select(Axis(0), &anchor_rows).view(), &eq.view(), p.k_weight.max(1)), labels)
        };

        let n_labels = classes.num_labels();
        let cell_ids = query.cell_ids();
        let predictions = nbrs
            .indices
            .axis_iter(Axis(0))
            .into_par_iter()
            .zip(nbrs.distances.axis_iter(Axis(0)))
            .enumerate()
            .map(|(cell, (idx, dist))| {
                let mut votes = vec![0.0; n_labels];
                for (&v, w) in idx.iter().zip(anchor_weights(&dist, p.sd_weight)) {
                    votes[voter_labels[v]] += w;
                }
                let (best, score) = votes
                    .iter()
                    .enumerate()
                    .fold((0, f64::NEG_INFINITY), |acc, (l, &w)| if w > acc.1 { (l, w) } else { acc });
                LabelPrediction {
                    cell_id: cell_ids[cell].clone(),
                    predicted_label: classes.labels[best].clone(),
                    score,
                }
            })
            .collect::<Vec<_>>();
        Ok(predictions)
    }
}

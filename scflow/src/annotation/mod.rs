//! Annotation: conserved markers per cluster and reference label transfer.

use crate::integration::{IntegratedDataset, MethodName};
use crate::normalization::{normalize, Normalization};
use anyhow::{Context, Error};
use itertools::Itertools;
use log::info;
use scflow_types::{Dataset, PipelineError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Gene symbol / accession harmonization
pub mod harmonize;
/// Reference label transfer
pub mod label_transfer;
/// Conserved marker discovery
pub mod markers;
/// Reference atlas loading
pub mod reference;

pub use harmonize::{harmonize_reference, AmbiguityPolicy, GeneMapping};
pub use label_transfer::{AnchorLabelTransfer, LabelPrediction, LabelPredictor, TransferParams};
pub use markers::{filter_markers, find_conserved_markers, ConservedMarker, MarkerParams};
pub use reference::{load_reference, ReferenceAtlas};

/// Where to find the reference atlas and how to match its genes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceParams {
    pub path: PathBuf,
    #[serde(default)]
    pub ambiguity: AmbiguityPolicy,
}

/// Settings for the annotation stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotationParams {
    /// integration method whose clustering is annotated; required when more
    /// than one method was run
    pub method: Option<MethodName>,
    pub normalization: Normalization,
    pub markers: MarkerParams,
    pub reference: Option<ReferenceParams>,
    pub transfer: TransferParams,
}

impl Default for AnnotationParams {
    fn default() -> Self {
        AnnotationParams {
            method: None,
            normalization: Normalization::SeuratLog,
            markers: MarkerParams::default(),
            reference: None,
            transfer: TransferParams::default(),
        }
    }
}

/// Result of the annotation stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotatedDataset {
    pub dataset: Dataset,
    pub method: MethodName,
    /// key of the clustering the markers refer to
    pub cluster_key: String,
    pub conserved_markers: Vec<ConservedMarker>,
    /// conserved markers passing the detection margin in every group
    pub filtered_markers: Vec<ConservedMarker>,
    /// empty when no reference was given
    pub predictions: Vec<LabelPrediction>,
    pub gene_mapping: Option<GeneMapping>,
}

/// The method to annotate: the requested one, which must have been run, or
/// the only one that was run.
pub fn select_method(integrated: &IntegratedDataset, requested: Option<MethodName>) -> Result<MethodName, PipelineError> {
    match (requested, integrated.methods.as_slice()) {
        (Some(m), run) if run.contains(&m) => Ok(m),
        (Some(m), _) => Err(PipelineError::InvalidConfig(format!(
            "integration method {m} was not run"
        ))),
        (None, [only]) => Ok(*only),
        (None, []) => Err(PipelineError::InvalidConfig("no integration method was run".to_string())),
        (None, run) => Err(PipelineError::InvalidConfig(format!(
            "several integration methods were run ({}); choose one to annotate",
            run.iter().map(|m| m.as_str()).join(", ")
        ))),
    }
}

/// Find conserved markers for the chosen method's clustering and, when a
/// reference is given, transfer its labels onto every cell.
pub fn annotate(
    integrated: &IntegratedDataset,
    params: &AnnotationParams,
    reference: Option<&ReferenceAtlas>,
    predictor: &dyn LabelPredictor,
) -> Result<AnnotatedDataset, Error> {
    let method = select_method(integrated, params.method)?;
    let cluster_key = integrated.cluster_key(method);
    let clusters = integrated
        .dataset
        .clusters
        .get(&cluster_key)
        .ok_or_else(|| PipelineError::InvalidConfig(format!("no clustering {cluster_key}")))?;
    info!("annotating {} ({} clusters)", cluster_key, clusters.num_clusters());

    let dataset = &integrated.dataset;
    let lognorm = normalize(&dataset.counts, params.normalization).to_csr();
    let conserved_markers = find_conserved_markers(dataset, &lognorm, clusters, &params.markers)?;
    let filtered_markers = filter_markers(&conserved_markers, params.markers.margin);
    info!(
        "{} conserved markers, {} pass margin {}",
        conserved_markers.len(),
        filtered_markers.len(),
        params.markers.margin
    );

    let (predictions, gene_mapping) = match reference {
        Some(atlas) => {
            let policy = params.reference.as_ref().map(|r| r.ambiguity).unwrap_or_default();
            let (counts, mapping) = harmonize_reference(&atlas.counts, &dataset.counts.feature_names, policy)?;
            let harmonized = ReferenceAtlas::new(counts, atlas.labels.clone())?;
            let predictions = predictor
                .predict(&harmonized, dataset)
                .with_context(|| format!("label transfer ({})", predictor.name()))?;
            (predictions, Some(mapping))
        }
        None => (Vec::new(), None),
    };

    Ok(AnnotatedDataset {
        dataset: dataset.clone(),
        method,
        cluster_key,
        conserved_markers,
        filtered_markers,
        predictions,
        gene_mapping,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cluster::ClusterParams;
    use crate::doublets::test::synthetic;
    use crate::integration::{integrate, IntegrationParams, MixingParams};
    use crate::partition::split_by_sample;

    fn integrated(methods: Vec<MethodName>) -> IntegratedDataset {
        let ds = synthetic(&[("a", "ctrl", 60), ("b", "stim", 60)], 30, 3, 9);
        let parts = split_by_sample(&ds).unwrap();
        let params = IntegrationParams {
            n_features: 30,
            n_pcs: 6,
            projection_dims: 6,
            methods,
            ..Default::default()
        };
        integrate(&parts, &params, &ClusterParams::default(), &MixingParams::default(), 1).unwrap()
    }

    #[test]
    fn test_select_method() {
        let one = integrated(vec![MethodName::JointPca]);
        assert_eq!(select_method(&one, None).unwrap(), MethodName::JointPca);
        assert!(select_method(&one, Some(MethodName::Cca)).is_err());

        let mut two = one.clone();
        two.methods.push(MethodName::Harmony);
        assert!(matches!(select_method(&two, None), Err(PipelineError::InvalidConfig(_))));
        assert_eq!(select_method(&two, Some(MethodName::Harmony)).unwrap(), MethodName::Harmony);
    }

    #[test]
    fn test_annotate_with_reference() {
        let data = integrated(vec![MethodName::Harmony]);
        let reference = synthetic(&[("ref", "ref", 60)], 30, 3, 5);
        let atlas = ReferenceAtlas::new(reference.counts, (0..60).map(|c| format!("type{}", c % 3)).collect()).unwrap();
        let params = AnnotationParams {
            transfer: TransferParams {
                n_pcs: 5,
                ..Default::default()
            },
            ..Default::default()
        };
        let predictor = AnchorLabelTransfer::new(params.transfer.clone(), 0);
        let out = annotate(&data, &params, Some(&atlas), &predictor).unwrap();
        assert_eq!(out.method, MethodName::Harmony);
        assert_eq!(out.predictions.len(), 120);
        assert!(out.gene_mapping.unwrap().len() == 30);
        assert!(out.filtered_markers.iter().all(|m| m.passes_margin(0.5)));
        assert!(!out.conserved_markers.is_empty());

        let without = annotate(&data, &params, None, &predictor).unwrap();
        assert!(without.predictions.is_empty());
        assert!(without.gene_mapping.is_none());
    }
}

//! Batch integration.
//!
//! Every method consumes the same [`IntegrationInput`] (per-sample membership,
//! log-normalized and scaled expression over the integration features) plus the
//! shared base PCA embedding, and returns a corrected embedding named
//! `integrated.<method>`. Clustering, projection and the mixing metric then run
//! identically on each corrected embedding.

use crate::cluster::{cluster_embedding, ClusterParams};
use crate::dim_red::fit_pca;
use crate::features::{find_variable_features, select_integration_features, SampleFeatures};
use crate::normalization::{dense_features, normalize, scale_data, ScaleStats, Normalization, SCALE_MAX_DEFAULT};
use crate::partition::{concat_partitions, SamplePartition};
use crate::projection::{PrincipalPlaneProjector, Projector};
use anyhow::{Context, Error};
use fxhash::FxHashMap;
use log::info;
use ndarray::{Array2, Axis};
use scflow_types::{Dataset, Embedding, LabelClass, PipelineError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Anchor search and anchor-based correction
pub mod anchors;
/// Canonical correlation anchors
pub mod cca;
/// Soft clustering with diversity penalty and ridge correction
pub mod harmony;
/// Anchors in the shared PCA space
pub mod jointpca;
/// Local batch mixing quality metric
pub mod mixing;
/// Reciprocal PCA anchors
pub mod rpca;

pub use anchors::AnchorParams;
pub use harmony::HarmonyParams;
pub use mixing::{MixingParams, MixingSummary};

/// Name of the shared starting embedding
pub const BASE_EMBEDDING: &str = "pca";

/// The interchangeable integration strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MethodName {
    Cca,
    Harmony,
    Rpca,
    JointPca,
}

impl MethodName {
    /// All methods, in the order they are run by default.
    pub const ALL: [MethodName; 4] = [MethodName::Cca, MethodName::Rpca, MethodName::Harmony, MethodName::JointPca];

    pub fn as_str(&self) -> &'static str {
        match self {
            MethodName::Cca => "cca",
            MethodName::Harmony => "harmony",
            MethodName::Rpca => "rpca",
            MethodName::JointPca => "jointpca",
        }
    }

    /// Name of the corrected embedding.
    pub fn embedding_name(&self) -> String {
        format!("integrated.{}", self.as_str())
    }

    /// Name of the 2-D projection of the corrected embedding.
    pub fn projection_name(&self) -> String {
        format!("proj.{}", self.as_str())
    }
}

impl fmt::Display for MethodName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MethodName {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cca" => Ok(MethodName::Cca),
            "harmony" => Ok(MethodName::Harmony),
            "rpca" => Ok(MethodName::Rpca),
            "jointpca" | "joint_pca" => Ok(MethodName::JointPca),
            _ => Err(PipelineError::UnknownMethod {
                kind: "integration",
                name: s.to_string(),
            }),
        }
    }
}

/// What every integration method sees.
#[derive(Debug, Clone)]
pub struct IntegrationInput {
    /// sample id -> row indices
    pub batches: LabelClass,
    /// cells x features log-normalized expression
    pub data: Array2<f64>,
    /// cells x features, scaled over all cells
    pub scaled: Array2<f64>,
    /// the integration features, column order of `data`
    pub features: Vec<String>,
    /// dimensions of the corrected embedding
    pub n_dims: usize,
    pub scale_max: f64,
    pub seed: u64,
}

impl IntegrationInput {
    /// Per-cell batch code, following the label order of `batches`.
    pub fn batch_codes(&self) -> Vec<usize> {
        self.batches.codes(self.data.nrows())
    }

    /// Index of the reference batch: the largest one, earliest on ties.
    pub fn reference_batch(&self) -> usize {
        let mut best = (0, 0);
        for (b, (_, cells)) in self.batches.iter().enumerate() {
            if cells.len() > best.1 {
                best = (b, cells.len());
            }
        }
        best.0
    }

    /// Rows of one batch, scaled by that batch's own statistics.
    pub fn batch_scaled(&self, cells: &[usize]) -> Array2<f64> {
        let sub = self.data.select(Axis(0), cells);
        let stats = ScaleStats::fit(&sub.view(), self.scale_max);
        stats.apply(&sub.view())
    }
}

/// A batch-correction strategy: `(input, base embedding) -> corrected embedding`.
pub trait IntegrationMethod: Send + Sync {
    fn name(&self) -> MethodName;

    /// Produce the corrected embedding (same cells and row order as `base`).
    fn integrate(&self, input: &IntegrationInput, base: &Embedding) -> Result<Embedding, Error>;
}

/// Build the strategy for `name`.
pub fn method_for(name: MethodName, params: &IntegrationParams) -> Box<dyn IntegrationMethod> {
    match name {
        MethodName::Cca => Box::new(cca::Cca::new(params.anchors.clone())),
        MethodName::Rpca => Box::new(rpca::Rpca::new(params.anchors.clone())),
        MethodName::JointPca => Box::new(jointpca::JointPca::new(params.anchors.clone())),
        MethodName::Harmony => Box::new(harmony::Harmony::new(params.harmony.clone())),
    }
}

/// Settings for the integration stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationParams {
    pub normalization: Normalization,
    /// variable genes per sample, and integration features overall
    pub n_features: usize,
    /// principal components of the base embedding
    pub n_pcs: usize,
    pub scale_max: f64,
    pub methods: Vec<MethodName>,
    /// leading dimensions fed to the 2-D projection; 0 means all
    pub projection_dims: usize,
    pub anchors: AnchorParams,
    pub harmony: HarmonyParams,
}

impl Default for IntegrationParams {
    fn default() -> Self {
        IntegrationParams {
            normalization: Normalization::SeuratLog,
            n_features: 2000,
            n_pcs: 30,
            scale_max: SCALE_MAX_DEFAULT,
            methods: MethodName::ALL.to_vec(),
            projection_dims: 30,
            anchors: AnchorParams::default(),
            harmony: HarmonyParams::default(),
        }
    }
}

/// Result of the integration stage: the joined dataset with the base and
/// corrected embeddings, their clusterings and projections attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegratedDataset {
    pub dataset: Dataset,
    pub features: Vec<String>,
    pub methods: Vec<MethodName>,
    /// clustering resolution used for every embedding
    pub resolution: f64,
    /// one entry for the base embedding, then one per method
    pub mixing: Vec<MixingSummary>,
}

impl IntegratedDataset {
    /// Cluster assignment key for `method`.
    pub fn cluster_key(&self, method: MethodName) -> String {
        scflow_types::embedding::cluster_key(&method.embedding_name(), self.resolution)
    }
}

/// Normalize each sample, pick variable genes per sample and across samples,
/// scale, compute the base PCA, then run every requested method and evaluate
/// each embedding.
pub fn integrate(
    partitions: &[SamplePartition],
    params: &IntegrationParams,
    cluster: &ClusterParams,
    mixing: &MixingParams,
    seed: u64,
) -> Result<IntegratedDataset, Error> {
    let dataset = concat_partitions(partitions, "integrated")?;
    info!(
        "integrating {} samples, {} cells",
        partitions.len(),
        dataset.num_cells()
    );

    let per_sample = partitions
        .iter()
        .map(|p| {
            let lognorm = normalize(&p.dataset.counts, params.normalization);
            let names = &p.dataset.counts.feature_names;
            SampleFeatures {
                genes: names.clone(),
                variable: find_variable_features(&lognorm, params.n_features)
                    .into_iter()
                    .map(|g| names[g].clone())
                    .collect(),
            }
        })
        .collect::<Vec<_>>();
    let features = select_integration_features(&per_sample, params.n_features)?;
    if features.is_empty() {
        return Err(PipelineError::EmptyInput("integration features".to_string()).into());
    }
    info!("{} integration features", features.len());

    let gene_index: FxHashMap<&str, usize> = dataset
        .counts
        .feature_names
        .iter()
        .enumerate()
        .map(|(i, n)| (n.as_str(), i))
        .collect();
    let rows = features.iter().map(|f| gene_index[f.as_str()]).collect::<Vec<_>>();
    let lognorm = normalize(&dataset.counts, params.normalization);
    let data = dense_features(&lognorm, &rows);
    let (scaled, _) = scale_data(&data.view(), params.scale_max);

    let pca = fit_pca(&scaled.view(), params.n_pcs, seed).context("base PCA")?;
    let base = Embedding::new(BASE_EMBEDDING, BASE_EMBEDDING, dataset.cell_ids(), pca.embedding);
    let input = IntegrationInput {
        batches: dataset.group_by("sample_id")?,
        data,
        scaled,
        features: features.clone(),
        n_dims: base.dims(),
        scale_max: params.scale_max,
        seed,
    };
    let codes = input.batch_codes();

    let mut embeddings = vec![base.clone()];
    for &m in &params.methods {
        info!("running integration method {}", m);
        let corrected = method_for(m, params)
            .integrate(&input, &base)
            .with_context(|| format!("integration method {m}"))?;
        embeddings.push(corrected);
    }

    let projector = PrincipalPlaneProjector {
        dims: params.projection_dims,
        seed,
    };
    let mut dataset = dataset;
    let mut summaries = Vec::new();
    for emb in embeddings {
        let proj_name = if emb.name == BASE_EMBEDDING {
            format!("proj.{BASE_EMBEDDING}")
        } else {
            format!("proj.{}", emb.method)
        };
        let clusters = cluster_embedding(&emb, cluster, seed)?;
        let projection = projector.project(&emb, &proj_name)?;
        let scores = mixing::mixing_metric(&emb.values.view(), &codes, input.batches.num_labels(), mixing);
        let summary = MixingSummary::new(&emb, &scores);
        info!(
            "{}: mixing metric mean {:.2}, median {:.2}",
            emb.name, summary.mean, summary.median
        );
        summaries.push(summary);
        dataset = dataset
            .with_embedding(emb)?
            .with_embedding(projection)?
            .with_clusters(clusters)?;
    }

    Ok(IntegratedDataset {
        dataset,
        features,
        methods: params.methods.clone(),
        resolution: cluster.resolution,
        mixing: summaries,
    })
}

//! Graph-based clustering of any embedding: kNN -> SNN -> Louvain.

use crate::nn::{knn, shared_nn_graph};
use anyhow::{bail, Error};
use log::info;
use louvain::{cluster_network, Network};
use scflow_types::{ClusterAssignment, Embedding, PipelineError};
use serde::{Deserialize, Serialize};

/// Settings for graph clustering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterParams {
    /// neighbours per cell, the cell itself included
    pub k: usize,
    /// SNN edges with a smaller Jaccard index are dropped
    pub prune: f64,
    /// modularity resolution
    pub resolution: f64,
    /// random restarts of Louvain; the best modularity wins
    pub n_starts: usize,
    /// leading embedding dimensions used; 0 means all
    pub dims: usize,
}

impl Default for ClusterParams {
    fn default() -> Self {
        ClusterParams {
            k: 20,
            prune: 1.0 / 15.0,
            resolution: 0.5,
            n_starts: 10,
            dims: 0,
        }
    }
}

/// Relabel so that cluster 0 is the largest; equal sizes are ordered by their
/// first cell. Fails if the clusters do not fit in `u16` labels.
pub fn relabel_by_size(labels: &[usize]) -> Result<Vec<u16>, Error> {
    let n_clusters = labels.iter().map(|&l| l + 1).max().unwrap_or(0);
    let mut size = vec![0usize; n_clusters];
    let mut first = vec![usize::MAX; n_clusters];
    for (i, &l) in labels.iter().enumerate() {
        size[l] += 1;
        first[l] = first[l].min(i);
    }
    let mut order = (0..n_clusters).filter(|&c| size[c] > 0).collect::<Vec<_>>();
    order.sort_by(|&a, &b| size[b].cmp(&size[a]).then(first[a].cmp(&first[b])));
    let mut new_label = vec![0u16; n_clusters];
    for (new, &old) in order.iter().enumerate() {
        new_label[old] = match u16::try_from(new) {
            Ok(l) => l,
            Err(_) => bail!("{} clusters exceed the {} supported labels", order.len(), u16::MAX as usize + 1),
        };
    }
    Ok(labels.iter().map(|&l| new_label[l]).collect())
}

/// Cluster the cells of `embedding`.
pub fn cluster_embedding(embedding: &Embedding, params: &ClusterParams, seed: u64) -> Result<ClusterAssignment, Error> {
    let n = embedding.num_cells();
    if n == 0 {
        return Err(PipelineError::EmptyInput(format!("clustering {}", embedding.name)).into());
    }
    let dims = if params.dims == 0 { embedding.dims() } else { params.dims.min(embedding.dims()) };
    let values = embedding.values.slice(ndarray::s![.., ..dims]);

    let nn = knn(&values, params.k, true);
    let edges = shared_nn_graph(&nn.indices, params.prune);
    let network = Network::from_edges(n, edges);
    let (clustering, modularity) = cluster_network(&network, params.resolution, params.n_starts.max(1), seed);
    let labels = relabel_by_size(clustering.labels())?;
    let n_clusters = labels.iter().map(|&l| l as usize + 1).max().unwrap_or(0);
    info!(
        "{}: {} clusters at resolution {} (modularity {:.4})",
        embedding.name, n_clusters, params.resolution, modularity
    );
    Ok(ClusterAssignment {
        embedding: embedding.name.clone(),
        resolution: params.resolution,
        labels,
        modularity,
    })
}

use crate::{Clustering, Network};
use rayon::prelude::*;

/// Newman-Girvan modularity of `clustering` with a resolution parameter:
/// `Q = 1/2m * sum_ij (A_ij - resolution * k_i k_j / 2m) delta(c_i, c_j)`.
///
/// Only meaningful on a network built directly from edges (not a reduced one).
pub fn modularity<C: Clustering + Sync>(resolution: f64, graph: &Network, clustering: &C) -> f64 {
    let total_edge_weight = graph.get_total_edge_weight();
    if total_edge_weight <= 0.0 {
        return 0.0;
    }

    // Chunked so the floating point sums are reduced in a fixed order.
    let chunk_size = std::cmp::max(1, graph.nodes() / 64);
    let nodes = (0..graph.nodes()).collect::<Vec<usize>>();
    let internal = nodes
        .par_chunks(chunk_size)
        .map(|chunk| {
            let mut w = 0.0;
            for &i in chunk {
                let c_i = clustering.cluster_of(i);
                for (j, edge_weight) in graph.neighbors(i) {
                    if clustering.cluster_of(j) == c_i {
                        w += edge_weight;
                    }
                }
            }
            w
        })
        .collect::<Vec<f64>>()
        .into_iter()
        .sum::<f64>();

    let mut cluster_weights = vec![0.0; clustering.num_clusters()];
    for i in 0..graph.nodes() {
        cluster_weights[clustering.cluster_of(i)] += graph.weight(i);
    }
    let expected = cluster_weights.iter().map(|w| w * w).sum::<f64>() * resolution / (2.0 * total_edge_weight);

    (internal - expected) / (2.0 * total_edge_weight)
}

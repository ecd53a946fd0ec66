use crate::{Clustering, Network, ZeroVec};
use rand::{seq::SliceRandom, Rng};

/// One sweep of the Louvain local-moving heuristic: every node, visited in a
/// random order, is moved to the neighboring cluster giving the largest gain
/// in modularity.
#[derive(Default)]
pub(crate) struct LocalMoving {
    resolution: f64,
    cluster_weights: Vec<f64>,
    nodes_per_cluster: Vec<usize>,
    unused_clusters: Vec<usize>,
    node_order: Vec<usize>,
    edge_weight_per_cluster: Vec<f64>,
    neighboring_clusters: Vec<usize>,
}

impl LocalMoving {
    pub fn new(resolution: f64) -> Self {
        LocalMoving {
            resolution,
            ..LocalMoving::default()
        }
    }

    /// Returns true if any node changed cluster.
    pub fn iterate(&mut self, n: &Network, c: &mut impl Clustering, rng: &mut impl Rng) -> bool {
        let nodes = n.nodes();
        let total_edge_weight = n.get_total_edge_weight();
        if nodes == 0 || total_edge_weight <= 0.0 {
            return false;
        }
        let penalty = self.resolution / (2.0 * total_edge_weight);

        self.cluster_weights.zero_len(nodes);
        self.nodes_per_cluster.zero_len(nodes);
        for i in 0..nodes {
            self.cluster_weights[c.cluster_of(i)] += n.weight(i);
            self.nodes_per_cluster[c.cluster_of(i)] += 1;
        }

        // stack of empty cluster ids, a node can always be moved to the top one
        self.unused_clusters.clear();
        for i in (0..nodes).rev() {
            if self.nodes_per_cluster[i] == 0 {
                self.unused_clusters.push(i);
            }
        }

        self.node_order.clear();
        self.node_order.extend(0..nodes);
        self.node_order.shuffle(rng);

        self.edge_weight_per_cluster.zero_len(nodes);
        let mut update = false;

        for idx in 0..nodes {
            let j = self.node_order[idx];
            let current_cluster = c.cluster_of(j);
            let w_j = n.weight(j);

            self.cluster_weights[current_cluster] -= w_j;
            self.nodes_per_cluster[current_cluster] -= 1;
            if self.nodes_per_cluster[current_cluster] == 0 {
                self.unused_clusters.push(current_cluster);
            }

            // candidate clusters: one empty cluster plus every neighboring cluster
            self.neighboring_clusters.clear();
            let empty_cluster = self.unused_clusters[self.unused_clusters.len() - 1];
            self.neighboring_clusters.push(empty_cluster);
            for (target, edge_weight) in n.neighbors(j) {
                let neighbor_cluster = c.cluster_of(target);
                if self.edge_weight_per_cluster[neighbor_cluster] == 0.0 {
                    self.neighboring_clusters.push(neighbor_cluster);
                }
                self.edge_weight_per_cluster[neighbor_cluster] += edge_weight;
            }

            // staying put wins ties, otherwise the lowest cluster id does
            let mut best_cluster = current_cluster;
            let mut max_gain = self.edge_weight_per_cluster[current_cluster]
                - w_j * self.cluster_weights[current_cluster] * penalty;
            for &l in &self.neighboring_clusters {
                let gain = self.edge_weight_per_cluster[l] - w_j * self.cluster_weights[l] * penalty;
                if gain > max_gain || (gain == max_gain && l < best_cluster && best_cluster != current_cluster) {
                    best_cluster = l;
                    max_gain = gain;
                }
            }
            for &l in &self.neighboring_clusters {
                self.edge_weight_per_cluster[l] = 0.0;
            }
            self.edge_weight_per_cluster[current_cluster] = 0.0;

            self.cluster_weights[best_cluster] += w_j;
            self.nodes_per_cluster[best_cluster] += 1;
            if best_cluster == empty_cluster {
                self.unused_clusters.pop();
            }

            if best_cluster != current_cluster {
                c.assign(j, best_cluster);
                update = true;
            }
        }

        if update {
            c.compact();
        }

        update
    }
}

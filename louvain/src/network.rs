use crate::Clustering;
use fxhash::FxHashMap;

/// Weighted undirected graph. Node weights are the weighted degree of each node
/// in the original graph; edges between nodes of a reduced network carry the
/// summed weight of the original edges they replace.
#[derive(Debug, Clone, Default)]
pub struct Network {
    node_weights: Vec<f64>,
    adjacency: Vec<Vec<(usize, f64)>>,
    total_edge_weight: f64,
}

impl Network {
    /// Build a network over `n_nodes` from weighted edges. Self loops are ignored,
    /// and repeated `(i, j)` / `(j, i)` pairs have their weights summed.
    pub fn from_edges<I: IntoIterator<Item = (usize, usize, f64)>>(n_nodes: usize, edges: I) -> Network {
        let mut memo: FxHashMap<(usize, usize), f64> = FxHashMap::default();
        for (i, j, w) in edges {
            assert!(i < n_nodes && j < n_nodes, "edge ({i}, {j}) outside of {n_nodes} nodes");
            if i == j || w <= 0.0 {
                continue;
            }
            let key = if i < j { (i, j) } else { (j, i) };
            *memo.entry(key).or_insert(0.0) += w;
        }

        let mut edges = memo.into_iter().collect::<Vec<_>>();
        // hash order is arbitrary, fix it so neighbor iteration is deterministic
        edges.sort_unstable_by_key(|&(k, _)| k);

        let mut adjacency = vec![Vec::new(); n_nodes];
        let mut node_weights = vec![0.0; n_nodes];
        let mut total_edge_weight = 0.0;
        for ((i, j), w) in edges {
            adjacency[i].push((j, w));
            adjacency[j].push((i, w));
            node_weights[i] += w;
            node_weights[j] += w;
            total_edge_weight += w;
        }

        Network {
            node_weights,
            adjacency,
            total_edge_weight,
        }
    }

    /// Number of nodes in the graph
    pub fn nodes(&self) -> usize {
        self.node_weights.len()
    }

    /// Get the node weight of `node`.
    pub fn weight(&self, node: usize) -> f64 {
        self.node_weights[node]
    }

    /// Iterator over pairs of (adjacent node id, edge_weight) for all neighbors of `node`.
    pub fn neighbors(&self, node: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.adjacency[node].iter().copied()
    }

    /// Total weight of the edges of the original graph, including the edges a
    /// reduced network has folded inside its nodes.
    pub fn get_total_edge_weight(&self) -> f64 {
        self.total_edge_weight
    }

    /// Creates a reduced (or aggregate) network based on a clustering.
    /// Each node in the reduced network corresponds to a cluster of nodes in
    /// the original network. The weight of a node in the reduced network equals
    /// the sum of the weights of the nodes in the corresponding cluster in the
    /// original network. The weight of an edge between two nodes in the reduced
    /// network equals the sum of the weights of the edges between the nodes in
    /// the two corresponding clusters in the original network.
    pub fn create_reduced_network(&self, clustering: &impl Clustering) -> Network {
        let k = clustering.num_clusters();
        let mut node_weights = vec![0.0; k];
        for (i, &w) in self.node_weights.iter().enumerate() {
            node_weights[clustering.cluster_of(i)] += w;
        }

        let mut memo: FxHashMap<(usize, usize), f64> = FxHashMap::default();
        for (i, adj) in self.adjacency.iter().enumerate() {
            let c1 = clustering.cluster_of(i);
            for &(j, w) in adj {
                let c2 = clustering.cluster_of(j);
                // each undirected edge is stored twice, count it once
                if i < j && c1 != c2 {
                    let key = if c1 < c2 { (c1, c2) } else { (c2, c1) };
                    *memo.entry(key).or_insert(0.0) += w;
                }
            }
        }
        let mut edges = memo.into_iter().collect::<Vec<_>>();
        edges.sort_unstable_by_key(|&(key, _)| key);

        let mut adjacency = vec![Vec::new(); k];
        for ((c1, c2), w) in edges {
            adjacency[c1].push((c2, w));
            adjacency[c2].push((c1, w));
        }

        Network {
            node_weights,
            adjacency,
            total_edge_weight: self.total_edge_weight,
        }
    }
}

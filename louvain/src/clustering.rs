/// An assignment of every node of a network to exactly one cluster.
///
/// Cluster ids are dense after `compact`: `0..num_clusters()` with no gaps.
pub trait Clustering: std::fmt::Debug {
    /// Every node in a cluster of its own.
    fn singletons(num_nodes: usize) -> Self;

    /// Start from known labels; the ids are compacted.
    fn from_labels(labels: &[usize]) -> Self;

    /// Cluster of node `i`.
    fn cluster_of(&self, i: usize) -> usize;

    /// Move node `i` to `cluster`, growing the id range if needed.
    fn assign(&mut self, i: usize, cluster: usize);

    /// Number of nodes.
    fn len(&self) -> usize;

    /// Upper bound of the cluster ids in use.
    fn num_clusters(&self) -> usize;

    /// Renumber clusters densely, keeping their relative order.
    fn compact(&mut self);

    /// Replace every label by the label its cluster has in `coarse`, a
    /// clustering of this clustering's clusters.
    fn collapse<C: Clustering>(&mut self, coarse: &C) {
        for i in 0..self.len() {
            let cluster = coarse.cluster_of(self.cluster_of(i));
            self.assign(i, cluster);
        }
        self.compact();
    }
}

/// Labels stored in a plain vector, indexed by node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimpleClustering {
    labels: Vec<usize>,
    num_clusters: usize,
}

impl SimpleClustering {
    /// Label of every node.
    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Number of nodes per cluster id.
    pub fn sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.num_clusters];
        for &l in &self.labels {
            sizes[l] += 1;
        }
        sizes
    }
}

impl Clustering for SimpleClustering {
    fn singletons(num_nodes: usize) -> Self {
        SimpleClustering {
            labels: (0..num_nodes).collect(),
            num_clusters: num_nodes,
        }
    }

    fn from_labels(labels: &[usize]) -> Self {
        let mut c = SimpleClustering {
            labels: labels.to_vec(),
            num_clusters: labels.iter().map(|&l| l + 1).max().unwrap_or(0),
        };
        c.compact();
        c
    }

    fn cluster_of(&self, i: usize) -> usize {
        self.labels[i]
    }

    fn assign(&mut self, i: usize, cluster: usize) {
        self.labels[i] = cluster;
        self.num_clusters = self.num_clusters.max(cluster + 1);
    }

    fn len(&self) -> usize {
        self.labels.len()
    }

    fn num_clusters(&self) -> usize {
        self.num_clusters
    }

    fn compact(&mut self) {
        let mut remap = self.sizes();
        let mut next = 0;
        for slot in remap.iter_mut() {
            if *slot > 0 {
                *slot = next;
                next += 1;
            }
        }
        for l in self.labels.iter_mut() {
            *l = remap[*l];
        }
        self.num_clusters = next;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_compact_keeps_order() {
        let c = SimpleClustering::from_labels(&[4, 4, 1, 7]);
        assert_eq!(c.labels(), &[1, 1, 0, 2]);
        assert_eq!(c.num_clusters(), 3);
        assert_eq!(c.sizes(), vec![1, 2, 1]);
    }

    #[test]
    fn test_collapse() {
        let mut c = SimpleClustering::from_labels(&[0, 1, 2, 2]);
        let coarse = SimpleClustering::from_labels(&[0, 0, 1]);
        c.collapse(&coarse);
        assert_eq!(c.labels(), &[0, 0, 1, 1]);
        assert_eq!(c.num_clusters(), 2);
    }

    #[test]
    fn test_assign_grows_range() {
        let mut c = SimpleClustering::singletons(3);
        c.assign(1, 5);
        assert_eq!(c.num_clusters(), 6);
        c.compact();
        assert_eq!(c.labels(), &[0, 2, 1]);
    }
}

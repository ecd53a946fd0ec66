use crate::local_moving::LocalMoving;
use crate::objective::modularity;
use crate::{Clustering, Network, SimpleClustering};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

/// Perform the Louvain clustering algorithm
pub struct Louvain {
    rng: ChaCha20Rng,
    local_moving: LocalMoving,
}

/// Default resolution for Louvain
pub const DEFAULT_RESOLUTION: f64 = 1.0;

/// Upper bound on full Louvain passes per random start
pub const MAX_ITERATIONS: usize = 10;

impl Louvain {
    /// Initialize Louvain with the given resolution. An optional random seed
    /// can be supplied, otherwise a seed of 0 will be used.
    pub fn new(resolution: f64, seed: Option<u64>) -> Louvain {
        Louvain {
            rng: ChaCha20Rng::seed_from_u64(seed.unwrap_or_default()),
            local_moving: LocalMoving::new(resolution),
        }
    }

    /// Iterate the Louvain algorithm one step: local moving, then recursion on
    /// the aggregate network. Returns true if cluster labels were updated.
    pub fn iterate<C: Clustering>(&mut self, n: &Network, c: &mut C) -> bool {
        let mut update = self.local_moving.iterate(n, c, &mut self.rng);

        if c.num_clusters() == n.nodes() {
            return update;
        }

        let reduced_n = n.create_reduced_network(c);
        let mut reduced_clusters = C::singletons(reduced_n.nodes());
        update |= self.iterate(&reduced_n, &mut reduced_clusters);
        c.collapse(&reduced_clusters);

        update
    }

    /// Run passes from singleton clusters until nothing moves or `max_iterations` is hit.
    pub fn run(&mut self, n: &Network, max_iterations: usize) -> SimpleClustering {
        let mut c = SimpleClustering::singletons(n.nodes());
        for _ in 0..max_iterations {
            if !self.iterate(n, &mut c) {
                break;
            }
        }
        c
    }
}

/// Cluster `network` from `n_starts` random starts (seeds `seed`, `seed + 1`, ...)
/// and keep the clustering with the highest modularity. Ties go to the earliest start.
pub fn cluster_network(network: &Network, resolution: f64, n_starts: usize, seed: u64) -> (SimpleClustering, f64) {
    let mut best: Option<(SimpleClustering, f64)> = None;
    for start in 0..n_starts.max(1) {
        let mut louvain = Louvain::new(resolution, Some(seed + start as u64));
        let c = louvain.run(network, MAX_ITERATIONS);
        let q = modularity(resolution, network, &c);
        if best.as_ref().map_or(true, |(_, best_q)| q > *best_q) {
            best = Some((c, q));
        }
    }
    best.unwrap_or_default()
}

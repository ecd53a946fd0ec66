//! Louvain community detection on weighted, undirected graphs
#![deny(missing_docs)]

/// Data structure for storing a clustering of nodes
pub mod clustering;

/// Data structure for storing a weighted, undirected graph (aka network)
pub mod network;

/// Louvain clustering algorithm
pub mod louvain;

/// Clustering objective functions
pub mod objective;

mod local_moving;


pub use clustering::{Clustering, SimpleClustering};
pub use louvain::{cluster_network, Louvain};
pub use network::Network;

trait ZeroVec {
    fn zero(&mut self);
    fn zero_len(&mut self, len: usize);
}

impl<T: Default> ZeroVec for Vec<T> {
    fn zero(&mut self) {
        for i in self.iter_mut() {
            *i = T::default();
        }
    }

    fn zero_len(&mut self, len: usize) {
        self.zero();
        self.resize_with(len, T::default)
    }
}

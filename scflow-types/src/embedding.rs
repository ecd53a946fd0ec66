use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// A dense cells x components representation of a dataset, tagged with the
/// method that produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub name: String,
    pub method: String,
    /// row labels
    pub cell_ids: Vec<String>,
    pub values: Array2<f64>,
}

impl Embedding {
    pub fn new(name: impl Into<String>, method: impl Into<String>, cell_ids: Vec<String>, values: Array2<f64>) -> Self {
        Embedding {
            name: name.into(),
            method: method.into(),
            cell_ids,
            values,
        }
    }

    pub fn num_cells(&self) -> usize {
        self.values.nrows()
    }

    pub fn dims(&self) -> usize {
        self.values.ncols()
    }
}

/// Discrete cluster label per cell, computed from one embedding at one resolution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterAssignment {
    pub embedding: String,
    pub resolution: f64,
    /// label per cell, 0 is the largest cluster
    pub labels: Vec<u16>,
    pub modularity: f64,
}

impl ClusterAssignment {
    /// Key under which the assignment is stored in a dataset.
    pub fn key(&self) -> String {
        cluster_key(&self.embedding, self.resolution)
    }

    pub fn num_clusters(&self) -> usize {
        self.labels.iter().map(|&l| l as usize + 1).max().unwrap_or(0)
    }
}

/// `"<embedding>_res.<resolution>"`
pub fn cluster_key(embedding: &str, resolution: f64) -> String {
    format!("{embedding}_res.{resolution}")
}

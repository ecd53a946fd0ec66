//! # scflow-types: data model shared by the scflow stages
//!
//! A [`Dataset`](dataset::Dataset) is the value that flows between pipeline
//! stages: a gene x cell count matrix, one [`CellRecord`](cell::CellRecord) per
//! matrix column, and any embeddings or clusterings derived so far.

/// Per-cell metadata and QC metrics
pub mod cell;

/// Container threaded through the pipeline stages
pub mod dataset;

/// Low-dimensional embeddings and cluster assignments
pub mod embedding;

/// Error taxonomy
pub mod error;

/// Grouping of cell indices by a categorical label
pub mod label_class;

/// Sparse count matrices
pub mod matrix;

pub use cell::{CellRecord, DoubletCall, DoubletClass, QcMetrics};
pub use dataset::Dataset;
pub use embedding::{ClusterAssignment, Embedding};
pub use error::PipelineError;
pub use label_class::LabelClass;
pub use matrix::{CountMat, FeatureBarcodeMatrix};

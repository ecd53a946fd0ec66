//! # scflow: single-cell RNA-seq analysis pipeline
//!
//! Four stages, each a function from one serializable value to the next:
//! [`ingest`](ingest::ingest), [`quality_control`](qc::quality_control),
//! [`integrate`](integration::integrate) and [`annotate`](annotation::annotate).
//! [`Pipeline`](pipeline::Pipeline) composes them and persists every
//! intermediate result as a [`snapshot`].

/// Conserved markers and reference label transfer
pub mod annotation;

/// Graph-based clustering
pub mod cluster;

/// TOML configuration
pub mod config;

/// Dimensionality reduction methods
pub mod dim_red;

/// Doublet detection
pub mod doublets;

/// CSV / JSON exports
pub mod export;

/// Variable feature selection
pub mod features;

/// Sample loading and merging
pub mod ingest;

/// Batch integration methods
pub mod integration;

/// MTX loading routine
pub mod mtx;

/// Nearest-neighbor graphs
pub mod nn;

/// Count matrix normalization methods
pub mod normalization;

/// Per-sample partitions
pub mod partition;

/// Stage orchestration
pub mod pipeline;

/// 2-D projections
pub mod projection;

/// Quality control filter
pub mod qc;

/// Stage snapshots
pub mod snapshot;

pub mod stats;

pub use config::PipelineConfig;
pub use pipeline::Pipeline;
pub use scflow_types::{Dataset, PipelineError};

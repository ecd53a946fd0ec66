use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort a pipeline stage. Each variant names the sample, cell or
/// gene responsible so the input can be fixed and the stage re-run.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PipelineError {
    /// A declared input path does not exist.
    #[error("missing input {what}: {}", path.display())]
    MissingPath {
        /// what the path was expected to hold
        what: String,
        /// the missing path
        path: PathBuf,
    },

    /// Matrix, barcode, feature or metadata shapes disagree.
    #[error("dimension mismatch in {context}: expected {expected}, found {found}")]
    DimensionMismatch {
        /// sample, file or object being checked
        context: String,
        /// expected extent
        expected: usize,
        /// observed extent
        found: usize,
    },

    /// A gene symbol maps to more than one accession.
    #[error("gene symbol {symbol} is ambiguous: maps to {}", accessions.join(", "))]
    AmbiguousIdentifier {
        /// the colliding symbol
        symbol: String,
        /// every accession the symbol maps to
        accessions: Vec<String>,
    },

    /// A ratio metric is undefined because its denominator is zero.
    #[error("metric {metric} is undefined for cell {cell_id}: library size is 0")]
    DegenerateMetric {
        /// the metric name
        metric: &'static str,
        /// the offending cell
        cell_id: String,
    },

    /// Two samples contribute the same cell id.
    #[error("cell id {cell_id} occurs in samples {first} and {second}; enable cell id prefixing")]
    DuplicateCellId {
        /// the colliding id
        cell_id: String,
        /// sample seen first
        first: String,
        /// sample seen second
        second: String,
    },

    /// A configuration value is out of range or inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A snapshot file could not be decoded or belongs to another stage.
    #[error("bad snapshot {}: {reason}", path.display())]
    Snapshot {
        /// snapshot file
        path: PathBuf,
        /// why it was rejected
        reason: String,
    },

    /// A named method (integration, normalization, ...) is not known.
    #[error("unknown {kind} method: {name}")]
    UnknownMethod {
        /// kind of method
        kind: &'static str,
        /// the name given
        name: String,
    },

    /// An operation received no cells or no genes to work on.
    #[error("no data left for {0}")]
    EmptyInput(String),
}

impl PipelineError {
    /// Convenience constructor for [`PipelineError::DimensionMismatch`].
    pub fn dims(context: impl Into<String>, expected: usize, found: usize) -> Self {
        PipelineError::DimensionMismatch {
            context: context.into(),
            expected,
            found,
        }
    }
}

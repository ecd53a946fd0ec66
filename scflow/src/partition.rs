//! Splitting a dataset into per-sample partitions and joining them back.

use anyhow::Error;
use scflow_types::matrix::csc_from_columns;
use scflow_types::{Dataset, FeatureBarcodeMatrix, PipelineError};
use serde::{Deserialize, Serialize};

/// The cells of one originating sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplePartition {
    pub sample_id: String,
    pub dataset: Dataset,
}

/// Split by `sample_id`, in order of first appearance. Pure re-indexing: each
/// cell lands in exactly one partition with its matrix column unchanged.
pub fn split_by_sample(dataset: &Dataset) -> Result<Vec<SamplePartition>, Error> {
    let samples = dataset.group_by("sample_id")?;
    Ok(samples
        .iter()
        .map(|(sample_id, cells)| {
            let mut part = dataset.select_cells(cells);
            part.counts.name = sample_id.to_string();
            SamplePartition {
                sample_id: sample_id.to_string(),
                dataset: part,
            }
        })
        .collect())
}

/// Concatenate partitions that share one gene space, in partition order.
/// Embeddings and clusterings are not carried over.
pub fn concat_partitions(parts: &[SamplePartition], name: &str) -> Result<Dataset, Error> {
    let first = parts
        .first()
        .ok_or_else(|| PipelineError::EmptyInput("no partitions to concatenate".to_string()))?;
    let genes = &first.dataset.counts.feature_names;
    let mut columns = Vec::new();
    let mut cells = Vec::new();
    for p in parts {
        if &p.dataset.counts.feature_names != genes {
            return Err(PipelineError::dims(
                format!("partition {} genes vs partition {}", p.sample_id, first.sample_id),
                genes.len(),
                p.dataset.num_genes(),
            )
            .into());
        }
        for j in 0..p.dataset.num_cells() {
            columns.push(p.dataset.counts.column(j).collect::<Vec<_>>());
        }
        cells.extend(p.dataset.cells.iter().cloned());
    }
    let counts = FeatureBarcodeMatrix::new(
        name,
        cells.iter().map(|c| c.cell_id.clone()).collect(),
        first.dataset.counts.feature_ids.clone(),
        genes.clone(),
        csc_from_columns(genes.len(), columns),
    )?;
    Ok(Dataset::new(counts, cells)?)
}

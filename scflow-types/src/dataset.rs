use crate::cell::CellRecord;
use crate::embedding::{ClusterAssignment, Embedding};
use crate::error::PipelineError;
use crate::label_class::LabelClass;
use crate::matrix::FeatureBarcodeMatrix;
use ndarray::Axis;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The value threaded through the pipeline. Column `j` of `counts` and
/// `cells[j]` describe the same cell; `counts.barcodes[j] == cells[j].cell_id`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Dataset {
    pub counts: FeatureBarcodeMatrix,
    pub cells: Vec<CellRecord>,
    pub embeddings: BTreeMap<String, Embedding>,
    pub clusters: BTreeMap<String, ClusterAssignment>,
}

impl Dataset {
    pub fn new(counts: FeatureBarcodeMatrix, cells: Vec<CellRecord>) -> Result<Dataset, PipelineError> {
        let ds = Dataset {
            counts,
            cells,
            embeddings: BTreeMap::new(),
            clusters: BTreeMap::new(),
        };
        ds.validate()?;
        Ok(ds)
    }

    /// Check that metadata, embeddings and clusterings line up with the matrix.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let n = self.counts.num_barcodes();
        if self.cells.len() != n {
            return Err(PipelineError::dims(
                format!("{}: cell records vs matrix columns", self.counts.name),
                n,
                self.cells.len(),
            ));
        }
        if let Some((j, cell)) = self
            .cells
            .iter()
            .enumerate()
            .find(|(j, c)| c.cell_id != self.counts.barcodes[*j])
        {
            return Err(PipelineError::InvalidConfig(format!(
                "cell record {} is not aligned with matrix column {} ({})",
                cell.cell_id, j, self.counts.barcodes[j]
            )));
        }
        for e in self.embeddings.values() {
            if e.num_cells() != n {
                return Err(PipelineError::dims(format!("embedding {}", e.name), n, e.num_cells()));
            }
        }
        for c in self.clusters.values() {
            if c.labels.len() != n {
                return Err(PipelineError::dims(format!("clustering {}", c.key()), n, c.labels.len()));
            }
        }
        Ok(())
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn num_genes(&self) -> usize {
        self.counts.num_features()
    }

    pub fn cell_ids(&self) -> Vec<String> {
        self.cells.iter().map(|c| c.cell_id.clone()).collect()
    }

    /// Keep the given cells, in the given order, carrying every per-cell
    /// annotation along.
    pub fn select_cells(&self, idx: &[usize]) -> Dataset {
        let embeddings = self
            .embeddings
            .iter()
            .map(|(k, e)| {
                let e = Embedding::new(
                    e.name.clone(),
                    e.method.clone(),
                    idx.iter().map(|&i| e.cell_ids[i].clone()).collect(),
                    e.values.select(Axis(0), idx),
                );
                (k.clone(), e)
            })
            .collect();
        let clusters = self
            .clusters
            .iter()
            .map(|(k, c)| {
                let mut c = c.clone();
                c.labels = idx.iter().map(|&i| c.labels[i]).collect();
                (k.clone(), c)
            })
            .collect();
        Dataset {
            counts: self.counts.select_barcodes(idx),
            cells: idx.iter().map(|&i| self.cells[i].clone()).collect(),
            embeddings,
            clusters,
        }
    }

    /// Group cells by a metadata column (`sample_id`, `group`, ...).
    pub fn group_by(&self, field: &str) -> Result<LabelClass, PipelineError> {
        let values = self
            .cells
            .iter()
            .map(|c| {
                c.field(field)
                    .ok_or_else(|| PipelineError::InvalidConfig(format!("unknown metadata column {field}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(LabelClass::from_values(&values))
    }

    /// Attach an embedding, replacing any with the same name.
    pub fn with_embedding(mut self, embedding: Embedding) -> Result<Dataset, PipelineError> {
        if embedding.num_cells() != self.num_cells() {
            return Err(PipelineError::dims(
                format!("embedding {}", embedding.name),
                self.num_cells(),
                embedding.num_cells(),
            ));
        }
        self.embeddings.insert(embedding.name.clone(), embedding);
        Ok(self)
    }

    /// Attach a cluster assignment, replacing any with the same key.
    pub fn with_clusters(mut self, clusters: ClusterAssignment) -> Result<Dataset, PipelineError> {
        if clusters.labels.len() != self.num_cells() {
            return Err(PipelineError::dims(
                format!("clustering {}", clusters.key()),
                self.num_cells(),
                clusters.labels.len(),
            ));
        }
        self.clusters.insert(clusters.key(), clusters);
        Ok(self)
    }
}

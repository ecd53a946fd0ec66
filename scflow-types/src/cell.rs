use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-cell quality metrics computed from the raw counts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct QcMetrics {
    /// total UMI counts over all genes
    pub library_size: u64,
    /// number of genes with a non-zero count
    pub detected_genes: u32,
    /// total UMI counts over mitochondrial genes
    pub mt_counts: u64,
}

impl QcMetrics {
    /// Percentage of the library coming from mitochondrial genes.
    /// Undefined, and reported as [`PipelineError::DegenerateMetric`], when the
    /// library is empty.
    pub fn percent_mt(&self, cell_id: &str) -> Result<f64, PipelineError> {
        if self.library_size == 0 {
            return Err(PipelineError::DegenerateMetric {
                metric: "percent_mt",
                cell_id: cell_id.to_string(),
            });
        }
        Ok(100.0 * self.mt_counts as f64 / self.library_size as f64)
    }
}

/// Classification produced by doublet detection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DoubletClass {
    Singlet,
    Doublet,
}

impl fmt::Display for DoubletClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DoubletClass::Singlet => "singlet",
            DoubletClass::Doublet => "doublet",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DoubletCall {
    pub class: DoubletClass,
    pub score: f64,
}

/// One row of per-cell metadata, aligned with a column of the count matrix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CellRecord {
    /// unique id within the merged dataset
    pub cell_id: String,
    /// barcode as read from the sample's barcode list
    pub barcode: String,
    pub sample_id: String,
    /// experimental group / condition of the sample
    pub group: String,
    pub qc: Option<QcMetrics>,
    pub doublet: Option<DoubletCall>,
}

impl CellRecord {
    pub fn new(cell_id: String, barcode: String, sample_id: String, group: String) -> CellRecord {
        CellRecord {
            cell_id,
            barcode,
            sample_id,
            group,
            qc: None,
            doublet: None,
        }
    }

    /// Look up a categorical metadata column by name.
    pub fn field(&self, name: &str) -> Option<&str> {
        match name {
            "cell_id" => Some(&self.cell_id),
            "barcode" => Some(&self.barcode),
            "sample" | "sample_id" => Some(&self.sample_id),
            "group" => Some(&self.group),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_percent_mt() {
        let m = QcMetrics {
            library_size: 1000,
            detected_genes: 400,
            mt_counts: 50,
        };
        assert_eq!(m.percent_mt("c1"), Ok(5.0));
    }

    #[test]
    fn test_percent_mt_empty_library() {
        let m = QcMetrics::default();
        match m.percent_mt("c1") {
            Err(PipelineError::DegenerateMetric { cell_id, .. }) => assert_eq!(cell_id, "c1"),
            other => panic!("unexpected {other:?}"),
        }
    }
}

//! Ingestion: per-sample MEX loading, creation-time filtering, and merging.

use crate::mtx::{load_mex, make_unique};
use anyhow::{Context, Error};
use fxhash::{FxHashMap, FxHashSet};
use log::info;
use scflow_types::matrix::csc_from_columns;
use scflow_types::{CellRecord, Dataset, FeatureBarcodeMatrix, PipelineError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Name of the merged matrix
pub const MERGED_NAME: &str = "merged";

/// One input sample: a MEX directory plus its experimental group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleSpec {
    pub id: String,
    pub path: PathBuf,
    pub group: String,
}

/// Creation-time filters and cell naming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestParams {
    /// keep genes detected in at least this many cells
    pub min_cells: u32,
    /// keep cells with at least this many detected genes
    pub min_features: u32,
    /// name cells `<sample>_<barcode>`
    pub prefix_cell_ids: bool,
}

impl Default for IngestParams {
    fn default() -> Self {
        IngestParams {
            min_cells: 3,
            min_features: 200,
            prefix_cell_ids: true,
        }
    }
}

/// Drop cells with fewer than `min_features` detected genes, counted over
/// every gene, then genes detected in fewer than `min_cells` of the remaining
/// cells.
pub fn filter_matrix(matrix: &FeatureBarcodeMatrix, params: &IngestParams) -> FeatureBarcodeMatrix {
    let keep_cells = (0..matrix.num_barcodes())
        .filter(|&c| matrix.column(c).filter(|&(_, v)| v > 0).count() as u32 >= params.min_features)
        .collect::<Vec<_>>();
    let cells_filtered = matrix.select_barcodes(&keep_cells);
    let keep_genes = cells_filtered
        .feature_detection()
        .iter()
        .enumerate()
        .filter(|(_, &d)| d >= params.min_cells)
        .map(|(g, _)| g)
        .collect::<Vec<_>>();
    cells_filtered.select_features(&keep_genes)
}

/// Load and filter one sample, attaching sample id and group to every cell.
pub fn load_sample(spec: &SampleSpec, params: &IngestParams) -> Result<Dataset, Error> {
    let mut raw = load_mex(&spec.path, &spec.id).with_context(|| format!("loading sample {}", spec.id))?;
    raw.feature_names = make_unique(&raw.feature_names);
    let (genes_in, cells_in) = (raw.num_features(), raw.num_barcodes());
    let mut matrix = filter_matrix(&raw, params);
    info!(
        "sample {}: {} genes x {} cells, {} x {} after filtering",
        spec.id,
        genes_in,
        cells_in,
        matrix.num_features(),
        matrix.num_barcodes()
    );

    let mut cells = Vec::with_capacity(matrix.num_barcodes());
    let mut seen: FxHashSet<String> = FxHashSet::default();
    for bc in &matrix.barcodes {
        let cell_id = if params.prefix_cell_ids {
            format!("{}_{}", spec.id, bc)
        } else {
            bc.clone()
        };
        if !seen.insert(cell_id.clone()) {
            return Err(PipelineError::DuplicateCellId {
                cell_id,
                first: spec.id.clone(),
                second: spec.id.clone(),
            }
            .into());
        }
        cells.push(CellRecord::new(cell_id, bc.clone(), spec.id.clone(), spec.group.clone()));
    }
    matrix.barcodes = cells.iter().map(|c| c.cell_id.clone()).collect();
    matrix.name = spec.id.clone();
    Ok(Dataset::new(matrix, cells)?)
}

/// Concatenate samples along the cell axis over the union of their genes.
/// Genes are matched by (unique) name and ordered by first appearance; the
/// first sample's accession is kept for each name. A cell id present in two
/// samples is an error.
pub fn merge(samples: &[Dataset]) -> Result<Dataset, Error> {
    if samples.is_empty() {
        return Err(PipelineError::EmptyInput("no samples to merge".to_string()).into());
    }

    let mut gene_index: FxHashMap<&str, usize> = FxHashMap::default();
    let mut feature_ids = Vec::new();
    let mut feature_names = Vec::new();
    for ds in samples {
        for (id, name) in ds.counts.feature_ids.iter().zip(&ds.counts.feature_names) {
            if !gene_index.contains_key(name.as_str()) {
                gene_index.insert(name.as_str(), feature_names.len());
                feature_ids.push(id.clone());
                feature_names.push(name.clone());
            }
        }
    }

    let mut owner: FxHashMap<&str, &str> = FxHashMap::default();
    let mut columns = Vec::new();
    let mut cells = Vec::new();
    for ds in samples {
        let remap = ds
            .counts
            .feature_names
            .iter()
            .map(|n| gene_index[n.as_str()])
            .collect::<Vec<_>>();
        for (j, cell) in ds.cells.iter().enumerate() {
            if let Some(first) = owner.insert(cell.cell_id.as_str(), cell.sample_id.as_str()) {
                return Err(PipelineError::DuplicateCellId {
                    cell_id: cell.cell_id.clone(),
                    first: first.to_string(),
                    second: cell.sample_id.clone(),
                }
                .into());
            }
            columns.push(ds.counts.column(j).map(|(r, v)| (remap[r], v)).collect::<Vec<_>>());
            cells.push(cell.clone());
        }
    }

    let matrix = csc_from_columns(feature_names.len(), columns);
    let barcodes = cells.iter().map(|c| c.cell_id.clone()).collect();
    let counts = FeatureBarcodeMatrix::new(MERGED_NAME, barcodes, feature_ids, feature_names, matrix)?;
    info!(
        "merged {} samples: {} genes x {} cells",
        samples.len(),
        counts.num_features(),
        counts.num_barcodes()
    );
    Ok(Dataset::new(counts, cells)?)
}

/// Load, filter, and merge every sample.
pub fn ingest(specs: &[SampleSpec], params: &IngestParams) -> Result<Dataset, Error> {
    let mut ids: FxHashSet<&str> = FxHashSet::default();
    for s in specs {
        if !ids.insert(s.id.as_str()) {
            return Err(PipelineError::InvalidConfig(format!("sample id {} is listed twice", s.id)).into());
        }
    }
    let samples = specs
        .iter()
        .map(|s| load_sample(s, params))
        .collect::<Result<Vec<_>, _>>()?;
    merge(&samples)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mtx::test::write_mex;
    use std::collections::BTreeMap;
    use std::path::Path;

    fn loose() -> IngestParams {
        IngestParams {
            min_cells: 1,
            min_features: 1,
            prefix_cell_ids: true,
        }
    }

    fn spec(root: &Path, id: &str, group: &str) -> SampleSpec {
        SampleSpec {
            id: id.to_string(),
            path: root.join(id),
            group: group.to_string(),
        }
    }

    // per cell: (sample, group, {gene name: count})
    fn summary(ds: &Dataset) -> BTreeMap<String, (String, String, BTreeMap<String, u32>)> {
        ds.cells
            .iter()
            .enumerate()
            .map(|(j, c)| {
                let genes = ds
                    .counts
                    .column(j)
                    .map(|(r, v)| (ds.counts.feature_names[r].clone(), v))
                    .collect();
                (c.cell_id.clone(), (c.sample_id.clone(), c.group.clone(), genes))
            })
            .collect()
    }

    #[test]
    fn test_shared_barcode_prefixed() {
        let tmp = tempfile::tempdir().unwrap();
        write_mex(&tmp.path().join("s1"), &[("E1", "A")], &["AAAC-1"], &[(0, 0, 3)], true);
        write_mex(&tmp.path().join("s2"), &[("E1", "A")], &["AAAC-1"], &[(0, 0, 4)], true);
        let specs = [spec(tmp.path(), "s1", "ctrl"), spec(tmp.path(), "s2", "stim")];

        let ds = ingest(&specs, &loose()).unwrap();
        assert_eq!(ds.cell_ids(), vec!["s1_AAAC-1", "s2_AAAC-1"]);
        assert_eq!(ds.cells[0].barcode, ds.cells[1].barcode);
        assert_eq!(ds.cells[1].group, "stim");

        let bare = IngestParams {
            prefix_cell_ids: false,
            ..loose()
        };
        let err = ingest(&specs, &bare).unwrap_err();
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::DuplicateCellId { first, second, .. }) => {
                assert_eq!((first.as_str(), second.as_str()), ("s1", "s2"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_merge_gene_union() {
        let tmp = tempfile::tempdir().unwrap();
        write_mex(&tmp.path().join("a"), &[("E1", "A"), ("E2", "B")], &["x"], &[(0, 0, 1), (1, 0, 2)], false);
        write_mex(&tmp.path().join("b"), &[("E3", "C"), ("E1", "A")], &["y"], &[(0, 0, 5), (1, 0, 6)], false);
        let ds = ingest(&[spec(tmp.path(), "a", "g"), spec(tmp.path(), "b", "g")], &loose()).unwrap();
        assert_eq!(ds.counts.feature_names, vec!["A", "B", "C"]);
        assert_eq!(ds.counts.feature_row(0), vec![1, 6]);
        assert_eq!(ds.counts.feature_row(1), vec![2, 0]);
        assert_eq!(ds.counts.feature_row(2), vec![0, 5]);
    }

    #[test]
    fn test_merge_order_independent() {
        let tmp = tempfile::tempdir().unwrap();
        write_mex(&tmp.path().join("a"), &[("E1", "A"), ("E2", "B")], &["x", "y"], &[(0, 0, 1), (1, 1, 2)], false);
        write_mex(&tmp.path().join("b"), &[("E2", "B")], &["x"], &[(0, 0, 3)], false);
        write_mex(&tmp.path().join("c"), &[("E3", "C"), ("E1", "A")], &["z"], &[(0, 0, 4), (1, 0, 1)], false);
        let a = spec(tmp.path(), "a", "ctrl");
        let b = spec(tmp.path(), "b", "stim");
        let c = spec(tmp.path(), "c", "stim");

        let abc = ingest(&[a.clone(), b.clone(), c.clone()], &loose()).unwrap();
        let cab = ingest(&[c, a, b], &loose()).unwrap();
        assert_eq!(summary(&abc), summary(&cab));
        assert_ne!(abc.counts.feature_names, cab.counts.feature_names);
    }

    #[test]
    fn test_creation_filters() {
        // gene G2 only in one cell; cell "thin" expresses a single gene
        let tmp = tempfile::tempdir().unwrap();
        write_mex(
            &tmp.path().join("s"),
            &[("E0", "G0"), ("E1", "G1"), ("E2", "G2")],
            &["c0", "c1", "thin"],
            &[(0, 0, 1), (1, 0, 1), (0, 1, 2), (1, 1, 1), (2, 1, 9), (0, 2, 1)],
            false,
        );
        let params = IngestParams {
            min_cells: 2,
            min_features: 2,
            prefix_cell_ids: true,
        };
        let ds = load_sample(&spec(tmp.path(), "s", "g"), &params).unwrap();
        assert_eq!(ds.counts.feature_names, vec!["G0", "G1"]);
        assert_eq!(ds.cell_ids(), vec!["s_c0", "s_c1"]);
    }

    #[test]
    fn test_cells_filtered_before_genes() {
        // "edge" reaches min_features only through the rare gene G2
        let tmp = tempfile::tempdir().unwrap();
        write_mex(
            &tmp.path().join("s"),
            &[("E0", "G0"), ("E1", "G1"), ("E2", "G2")],
            &["c0", "c1", "edge"],
            &[(0, 0, 1), (1, 0, 1), (0, 1, 2), (1, 1, 1), (0, 2, 3), (2, 2, 1)],
            false,
        );
        let params = IngestParams {
            min_cells: 2,
            min_features: 2,
            prefix_cell_ids: true,
        };
        let ds = load_sample(&spec(tmp.path(), "s", "g"), &params).unwrap();
        assert_eq!(ds.cell_ids(), vec!["s_c0", "s_c1", "s_edge"]);
        assert_eq!(ds.counts.feature_names, vec!["G0", "G1"]);
        assert_eq!(ds.counts.column(2).collect::<Vec<_>>(), vec![(0, 3)]);
    }

    #[test]
    fn test_duplicate_names_made_unique() {
        let tmp = tempfile::tempdir().unwrap();
        write_mex(&tmp.path().join("s"), &[("E0", "A"), ("E1", "A")], &["c"], &[(0, 0, 1), (1, 0, 2)], false);
        let ds = load_sample(&spec(tmp.path(), "s", "g"), &loose()).unwrap();
        assert_eq!(ds.counts.feature_names, vec!["A", "A.1"]);
    }

    #[test]
    fn test_missing_sample() {
        let tmp = tempfile::tempdir().unwrap();
        let err = ingest(&[spec(tmp.path(), "ghost", "g")], &loose()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MissingPath { .. })
        ));
        assert!(ingest(&[], &loose()).is_err());
    }
}

use crate::stats::median_mut;
use anyhow::{bail, Error};
use ndarray::prelude::*;
use ndarray::parallel::prelude::*;
use scflow_types::FeatureBarcodeMatrix;
use serde::{Deserialize, Serialize};
use sprs::CsMat;
use std::str::FromStr;

/// Target total count per cell for Seurat style log normalization
pub const SEURAT_SCALE_FACTOR: f64 = 10_000.0;

/// Default upper clip for scaled values
pub const SCALE_MAX_DEFAULT: f64 = 10.0;

/// Normalization scheme for feature-barcode UMI count matrix
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Normalization {
    /// Seurat style log normalization. Barcode UMI count totals are scaled
    /// to 10,000 and the transformation `x -> ln(1 + x)` is applied
    #[default]
    SeuratLog,
    /// Cell Ranger style log normalization. Barcode UMI count totals are scaled to the median
    /// and the transformation `x -> log2(1 + x)` is applied
    CellRanger,
}

impl FromStr for Normalization {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "seuratlog" | "lognormalize" => Ok(Normalization::SeuratLog),
            "cellranger" => Ok(Normalization::CellRanger),
            _ => bail!("Normalization not recognized: {}", s),
        }
    }
}

/// Base of logarithm used by log_normalize
#[derive(Clone, Copy, Debug)]
pub enum LogBase {
    /// ln
    E,
    /// log2
    Two,
}

/// Normalize a count matrix with the given scheme. Returns genes x cells in
/// CSC layout with the sparsity pattern of the counts.
pub fn normalize(counts: &FeatureBarcodeMatrix, norm: Normalization) -> CsMat<f64> {
    match norm {
        Normalization::SeuratLog => log_normalize(counts, Some(SEURAT_SCALE_FACTOR), LogBase::E),
        Normalization::CellRanger => log_normalize(counts, None, LogBase::Two),
    }
}

/// Log-normalize a count matrix:
/// 1. Scale each column (barcode) to have the same total UMI count given by
///    `umi_count_sum`. If `umi_count_sum` is `None`, use the median total UMI count
/// 2. Apply a transform `x -> log_b(1 + x)`, with `b` specified by `log_base`
///
/// Cells with no counts stay all-zero.
pub fn log_normalize(counts: &FeatureBarcodeMatrix, umi_count_sum: Option<f64>, log_base: LogBase) -> CsMat<f64> {
    let umi_counts = counts.barcode_sums();
    let target_umi_count = match umi_count_sum {
        Some(x) => x,
        None => {
            let mut arr = Array1::from(umi_counts.clone());
            median_mut(&mut arr).map_or(1.0, |median: u64| (median as f64).max(1.0))
        }
    };
    let log1p_fn = match log_base {
        LogBase::E => |x: f64| x.ln_1p(),
        LogBase::Two => |x: f64| (x + 1.0).log2(),
    };

    let m = &counts.matrix;
    let mut data = Vec::with_capacity(m.nnz());
    for (col, &total) in m.outer_iterator().zip(&umi_counts) {
        let scale = if total == 0 { 0.0 } else { target_umi_count / total as f64 };
        data.extend(col.iter().map(|(_, &v)| log1p_fn(v as f64 * scale)));
    }
    CsMat::new_csc(
        (m.rows(), m.cols()),
        m.indptr().to_proper().into_owned(),
        m.indices().to_vec(),
        data,
    )
}

/// Densify the selected feature rows of a genes x cells CSC matrix into a
/// cells x features array.
pub fn dense_features(mat: &CsMat<f64>, features: &[usize]) -> Array2<f64> {
    let mut slot = vec![usize::MAX; mat.rows()];
    for (j, &f) in features.iter().enumerate() {
        slot[f] = j;
    }
    let mut out = Array2::zeros((mat.cols(), features.len()));
    out.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(cell, mut row)| {
            if let Some(col) = mat.outer_view(cell) {
                for (r, &v) in col.iter() {
                    if slot[r] != usize::MAX {
                        row[slot[r]] = v;
                    }
                }
            }
        });
    out
}

/// Per-feature centering and scaling learned from one matrix, so that other
/// matrices can be scaled the same way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleStats {
    /// per-feature mean
    pub mean: Array1<f64>,
    /// per-feature sample standard deviation
    pub sd: Array1<f64>,
    /// upper clip applied after scaling
    pub scale_max: f64,
}

impl ScaleStats {
    /// Learn means and standard deviations from a cells x features matrix.
    pub fn fit(data: &ArrayView2<f64>, scale_max: f64) -> ScaleStats {
        let n = data.nrows() as f64;
        let mean = data.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(data.ncols()));
        let sd = if n > 1.0 { data.std_axis(Axis(0), 1.0) } else { Array1::zeros(data.ncols()) };
        ScaleStats { mean, sd, scale_max }
    }

    /// Center and scale `data` column-wise, clipping at `scale_max`. Features
    /// with zero variance scale to 0.
    pub fn apply(&self, data: &ArrayView2<f64>) -> Array2<f64> {
        let mut out = data.to_owned();
        for ((mut col, &m), &s) in out.axis_iter_mut(Axis(1)).zip(&self.mean).zip(&self.sd) {
            if s > 0.0 {
                col.mapv_inplace(|v| ((v - m) / s).min(self.scale_max));
            } else {
                col.fill(0.0);
            }
        }
        out
    }
}

/// Scale a cells x features matrix by its own statistics.
pub fn scale_data(data: &ArrayView2<f64>, scale_max: f64) -> (Array2<f64>, ScaleStats) {
    let stats = ScaleStats::fit(data, scale_max);
    (stats.apply(data), stats)
}

#[cfg(test)]
mod test_normalization {
    use super::*;
    use approx::assert_abs_diff_eq;
    use scflow_types::matrix::csc_from_columns;

    fn counts() -> FeatureBarcodeMatrix {
        // 3 genes x 3 cells, last cell empty
        let m = csc_from_columns(3, vec![vec![(0, 1), (2, 3)], vec![(1, 10)], vec![]]);
        FeatureBarcodeMatrix::new(
            "t",
            vec!["a".into(), "b".into(), "c".into()],
            vec!["G0".into(), "G1".into(), "G2".into()],
            vec!["g0".into(), "g1".into(), "g2".into()],
            m,
        )
        .unwrap()
    }

    #[test]
    fn test_seurat_log() {
        let ln = normalize(&counts(), Normalization::SeuratLog);
        assert!(ln.is_csc());
        assert_eq!(ln.nnz(), 3);
        assert_abs_diff_eq!(*ln.get(0, 0).unwrap(), (1.0f64 / 4.0 * 1e4).ln_1p(), epsilon = 1e-12);
        assert_abs_diff_eq!(*ln.get(2, 0).unwrap(), (3.0f64 / 4.0 * 1e4).ln_1p(), epsilon = 1e-12);
        assert_abs_diff_eq!(*ln.get(1, 1).unwrap(), 1e4f64.ln_1p(), epsilon = 1e-12);
    }

    #[test]
    fn test_cellranger_median_target() {
        // totals are 4, 10, 0 -> median 4
        let ln = normalize(&counts(), Normalization::CellRanger);
        assert_abs_diff_eq!(*ln.get(1, 1).unwrap(), 5.0f64.log2(), epsilon = 1e-12);
        assert_eq!("cellranger".parse::<Normalization>().unwrap(), Normalization::CellRanger);
        assert!("sctransform".parse::<Normalization>().is_err());
    }

    #[test]
    fn test_dense_and_scale() {
        let ln = normalize(&counts(), Normalization::SeuratLog);
        let dense = dense_features(&ln, &[2, 0]);
        assert_eq!(dense.dim(), (3, 2));
        assert_eq!(dense[(1, 0)], 0.0);
        assert_eq!(dense[(0, 1)], *ln.get(0, 0).unwrap());

        let (scaled, stats) = scale_data(&dense.view(), 0.5);
        assert_eq!(stats.mean.len(), 2);
        // the one expressing cell sits at +1.15 sd, clipped to 0.5
        assert_abs_diff_eq!(scaled[(0, 0)], 0.5, epsilon = 1e-12);
        assert!(scaled[(1, 0)] < 0.0);

        let flat = Array2::from_elem((4, 1), 2.0);
        let (scaled, _) = scale_data(&flat.view(), 10.0);
        assert!(scaled.iter().all(|&v| v == 0.0));
    }
}

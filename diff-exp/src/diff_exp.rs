//! Wilcoxon differential expression between two cell sets
//!
use std::str::FromStr;

use crate::dist;
use crate::rank_sum::rank_sum_with_zeros;
use anyhow::{bail, Error};
use ndarray::Array1;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sprs::CsMatView;

/// Default minimum detection fraction in either set
pub static MIN_PCT_DEFAULT: f64 = 0.1;
/// Default minimum absolute log2 fold change
pub static LOGFC_THRESHOLD_DEFAULT: f64 = 0.1;

/// Multiple testing correction applied to the raw p-values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PValueAdjust {
    /// Bonferroni against every gene in the matrix
    #[default]
    Bonferroni,
    /// Benjamini-Hochberg over the tested genes
    #[serde(alias = "bh")]
    Fdr,
}

impl FromStr for PValueAdjust {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Error> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "bonferroni" => PValueAdjust::Bonferroni,
            "bh" | "fdr" => PValueAdjust::Fdr,
            _ => bail!("unknown p-value adjustment '{}'", s),
        })
    }
}

/// Gene pre-filters and correction for a pairwise test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffExpParams {
    /// genes must be detected in at least this fraction of one of the two sets
    pub min_pct: f64,
    /// genes must reach this absolute average log2 fold change
    pub logfc_threshold: f64,
    /// only test genes that go up in the first set
    pub only_pos: bool,
    /// p-value correction
    pub adjust: PValueAdjust,
}

impl Default for DiffExpParams {
    fn default() -> Self {
        DiffExpParams {
            min_pct: MIN_PCT_DEFAULT,
            logfc_threshold: LOGFC_THRESHOLD_DEFAULT,
            only_pos: false,
            adjust: PValueAdjust::Bonferroni,
        }
    }
}

/// Result of Differential expression
#[derive(Debug, Clone)]
pub struct DiffExpResult {
    /// genes that passed the pre-filters and were tested
    pub genes_tested: Array1<bool>,
    /// fraction of cells in cond_a with a nonzero value
    pub pct_in: Array1<f64>,
    /// fraction of cells in cond_b with a nonzero value
    pub pct_out: Array1<f64>,
    /// log2 ratio of mean expm1 expression, pseudo-count 1
    pub log2_fold_change: Array1<f64>,
    /// p_values, NaN for untested genes
    pub p_values: Array1<f64>,
    /// adjusted p_values, NaN for untested genes
    pub adjusted_p_values: Array1<f64>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Neither,
    A,
    B,
}

struct GeneSummary {
    pct_in: f64,
    pct_out: f64,
    log2_fc: f64,
    tested: bool,
    p_value: f64,
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// Run a Wilcoxon rank-sum test for every gene of `mat`, comparing the cells
/// (columns) in `cond_a` against those in `cond_b`.
///
/// `mat` holds log-normalized expression, genes x cells, in CSR layout so each
/// gene is one compressed row.
pub fn wilcoxon_differential_expression(
    mat: CsMatView<'_, f64>,
    cond_a: &[usize],
    cond_b: &[usize],
    params: &DiffExpParams,
) -> Result<DiffExpResult, Error> {
    if !mat.is_csr() {
        bail!("differential expression requires a gene-major (CSR) matrix");
    }
    if cond_a.is_empty() || cond_b.is_empty() {
        bail!(
            "differential expression needs cells on both sides ({} vs {})",
            cond_a.len(),
            cond_b.len()
        );
    }

    let mut side = vec![Side::Neither; mat.cols()];
    for (cells, s) in [(cond_a, Side::A), (cond_b, Side::B)] {
        for &c in cells {
            if c >= side.len() {
                bail!("cell index {} out of range for {} cells", c, side.len());
            }
            if side[c] != Side::Neither {
                bail!("cell index {} appears in both comparison sets", c);
            }
            side[c] = s;
        }
    }
    let (n_a, n_b) = (cond_a.len(), cond_b.len());

    let summaries = (0..mat.rows())
        .into_par_iter()
        .map(|g| {
            let mut vals_a = Vec::new();
            let mut vals_b = Vec::new();
            if let Some(row) = mat.outer_view(g) {
                for (c, &v) in row.iter() {
                    match side[c] {
                        Side::A => vals_a.push(v),
                        Side::B => vals_b.push(v),
                        Side::Neither => {}
                    }
                }
            }
            let detected = |vals: &[f64]| vals.iter().filter(|&&v| v > 0.0).count();
            let pct_in = round3(detected(&vals_a) as f64 / n_a as f64);
            let pct_out = round3(detected(&vals_b) as f64 / n_b as f64);
            let mean_expm1 = |vals: &[f64], n: usize| vals.iter().map(|v| v.exp_m1()).sum::<f64>() / n as f64;
            let log2_fc = (mean_expm1(&vals_a, n_a) + 1.0).log2() - (mean_expm1(&vals_b, n_b) + 1.0).log2();

            let tested = pct_in.max(pct_out) >= params.min_pct
                && log2_fc.abs() >= params.logfc_threshold
                && (!params.only_pos || log2_fc > 0.0);
            let p_value = if tested {
                rank_sum_with_zeros(&vals_a, n_a - vals_a.len(), &vals_b, n_b - vals_b.len()).p_value
            } else {
                f64::NAN
            };
            GeneSummary {
                pct_in,
                pct_out,
                log2_fc,
                tested,
                p_value,
            }
        })
        .collect::<Vec<_>>();

    let p_values = summaries.iter().map(|s| s.p_value).collect::<Array1<f64>>();
    let mut adjusted_p_values = Array1::from_elem(p_values.dim(), f64::NAN);
    match params.adjust {
        PValueAdjust::Bonferroni => {
            let n_tests = mat.rows();
            for (adj, s) in adjusted_p_values.iter_mut().zip(&summaries) {
                if s.tested {
                    *adj = dist::adjusted_pvalue_bonferroni(s.p_value, n_tests);
                }
            }
        }
        PValueAdjust::Fdr => {
            // Only adjust the genes that were actually tested
            let tested = summaries
                .iter()
                .enumerate()
                .filter(|(_, s)| s.tested)
                .map(|(i, s)| (i, s.p_value))
                .collect::<Vec<(usize, f64)>>();
            for (i, q) in dist::adjusted_pvalue_bh(&tested) {
                adjusted_p_values[i] = q;
            }
        }
    }

    Ok(DiffExpResult {
        genes_tested: summaries.iter().map(|s| s.tested).collect(),
        pct_in: summaries.iter().map(|s| s.pct_in).collect(),
        pct_out: summaries.iter().map(|s| s.pct_out).collect(),
        log2_fold_change: summaries.iter().map(|s| s.log2_fc).collect(),
        p_values,
        adjusted_p_values,
    })
}

///
/// test mod
#[cfg(test)]
pub mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use sprs::TriMat;

    // 3 genes x 8 cells; gene 0 marks cells 0..4, gene 1 is flat, gene 2 is off
    fn toy() -> sprs::CsMat<f64> {
        let mut tri = TriMat::new((3, 8));
        for c in 0..4 {
            tri.add_triplet(0, c, 2.0 + c as f64 * 0.1);
        }
        tri.add_triplet(0, 5, 0.2);
        for c in 0..8 {
            tri.add_triplet(1, c, 1.0);
        }
        tri.to_csr()
    }

    #[test]
    fn test_marker_gene_detected() {
        let mat = toy();
        let a = [0, 1, 2, 3];
        let b = [4, 5, 6, 7];
        let res = wilcoxon_differential_expression(mat.view(), &a, &b, &DiffExpParams::default()).unwrap();

        assert!(res.genes_tested[0]);
        assert_eq!(res.pct_in[0], 1.0);
        assert_eq!(res.pct_out[0], 0.25);
        assert!(res.log2_fold_change[0] > 1.0);
        assert!(res.p_values[0] < 0.05);
        assert_abs_diff_eq!(
            res.adjusted_p_values[0],
            (res.p_values[0] * 3.0).min(1.0),
            epsilon = 1e-12
        );

        // flat gene fails the fold-change filter, silent gene fails min_pct
        assert!(!res.genes_tested[1]);
        assert!(!res.genes_tested[2]);
        assert!(res.p_values[1].is_nan());
        assert_eq!(res.log2_fold_change[1], 0.0);
    }

    #[test]
    fn test_only_pos() {
        let mat = toy();
        let params = DiffExpParams {
            only_pos: true,
            ..Default::default()
        };
        let res = wilcoxon_differential_expression(mat.view(), &[4, 5, 6, 7], &[0, 1, 2, 3], &params).unwrap();
        assert!(res.log2_fold_change[0] < 0.0);
        assert!(!res.genes_tested[0]);
    }

    #[test]
    fn test_fdr() {
        let mat = toy();
        let params = DiffExpParams {
            adjust: PValueAdjust::Fdr,
            ..Default::default()
        };
        let res = wilcoxon_differential_expression(mat.view(), &[0, 1, 2, 3], &[4, 5, 6, 7], &params).unwrap();
        // a single tested gene is its own BH value
        assert_abs_diff_eq!(res.adjusted_p_values[0], res.p_values[0], epsilon = 1e-12);
    }

    #[test]
    fn test_bad_inputs() {
        let mat = toy();
        let p = DiffExpParams::default();
        assert!(wilcoxon_differential_expression(mat.view(), &[], &[1], &p).is_err());
        assert!(wilcoxon_differential_expression(mat.view(), &[0, 1], &[1, 2], &p).is_err());
        assert!(wilcoxon_differential_expression(mat.view(), &[0], &[42], &p).is_err());
        let csc = mat.to_csc();
        assert!(wilcoxon_differential_expression(csc.view(), &[0], &[1], &p).is_err());
    }

    #[test]
    fn test_parse_adjust() {
        assert_eq!("BH".parse::<PValueAdjust>().unwrap(), PValueAdjust::Fdr);
        assert_eq!("bonferroni".parse::<PValueAdjust>().unwrap(), PValueAdjust::Bonferroni);
        assert!("holm".parse::<PValueAdjust>().is_err());
    }
}

//! Variable-feature selection per sample and across samples

use crate::stats::{median, median_mut};
use anyhow::{bail, Error};
use fxhash::FxHashMap;
use ndarray::{Array, Array1};
use ndarray_stats::interpolate::Linear;
use ndarray_stats::Quantile1dExt;
use noisy_float::types::{n64, N64};
use sprs::CsMat;
use std::cmp::Ordering;
use std::collections::BTreeSet;

const DISPERSION_BINS: usize = 20;

/// Per-gene statistics behind variable-feature selection.
#[derive(Debug, Clone)]
pub struct FeatureDispersion {
    /// mean of normalized (non-log) expression
    pub mean: Array1<f64>,
    /// (var - mean) / mean^2, NaN for unexpressed genes
    pub dispersion: Array1<f64>,
    /// dispersion z-scored within its mean bin by median and MAD
    pub normalized: Array1<f64>,
}

fn binned_median(binned: &Array1<f64>, values: &Array1<f64>, bin_edges: &[N64]) -> (Vec<f64>, Vec<usize>) {
    let max_index = bin_edges.len() - 1;
    let mut bin_indices = Vec::with_capacity(values.len());
    let mut binned_values = vec![Vec::new(); max_index];
    for (i, &v) in binned.iter().enumerate() {
        let idx = match bin_edges[1..max_index].binary_search(&n64(v)) {
            Ok(i) => i + 1,
            Err(i) => i,
        };
        bin_indices.push(idx);
        binned_values[idx].push(n64(values[i]));
    }
    let medians = binned_values
        .into_iter()
        .map(|vec| median_mut(&mut Array1::from(vec)).map_or(f64::NAN, N64::raw))
        .collect();
    (medians, bin_indices)
}

/// Binned normalized dispersion of every gene of a log-normalized genes x cells
/// matrix. Means and variances are taken on `expm1` of the values.
pub fn compute_normalized_dispersion(lognorm: &CsMat<f64>) -> FeatureDispersion {
    let genes = lognorm.rows();
    let cells = lognorm.cols().max(1) as f64;
    let mut sum = vec![0.0; genes];
    let mut sum_sq = vec![0.0; genes];
    for col in lognorm.outer_iterator() {
        for (g, &v) in col.iter() {
            let x = v.exp_m1();
            sum[g] += x;
            sum_sq[g] += x * x;
        }
    }
    let mean = sum.iter().map(|s| s / cells).collect::<Array1<f64>>();
    let var = sum_sq
        .iter()
        .zip(&mean)
        .map(|(sq, m)| if cells > 1.0 { (sq - cells * m * m) / (cells - 1.0) } else { 0.0 })
        .collect::<Array1<f64>>();
    let dispersion = mean
        .iter()
        .zip(&var)
        .map(|(&m, &v)| if m > 0.0 { (v - m) / (m * m) } else { f64::NAN })
        .collect::<Array1<f64>>();

    // bin expressed genes by mean quantile
    let expressed = (0..genes).filter(|&g| mean[g] > 0.0).collect::<Vec<_>>();
    let mut normalized = Array1::from_elem(genes, f64::NAN);
    if expressed.is_empty() {
        return FeatureDispersion {
            mean,
            dispersion,
            normalized,
        };
    }
    let sub_mean = expressed.iter().map(|&g| mean[g]).collect::<Array1<f64>>();
    let sub_disp = expressed.iter().map(|&g| dispersion[g]).collect::<Array1<f64>>();
    let qs = Array::linspace(0.0, 1.0, DISPERSION_BINS + 1).mapv(n64);
    let mut quantiles = sub_mean
        .mapv(n64)
        .quantiles_mut(&qs, &Linear)
        .map(ndarray::ArrayBase::into_raw_vec)
        .unwrap_or_default();
    quantiles.dedup();

    let z = if quantiles.len() <= 1 {
        let med = median(sub_disp.as_slice().unwrap_or(&[]));
        let dev = sub_disp.mapv(|d| (d - med).abs());
        let mad = median(dev.as_slice().unwrap_or(&[]));
        sub_disp.mapv(|d| if mad > 0.0 { (d - med) / mad } else { d - med })
    } else {
        let (medians, bins) = binned_median(&sub_mean, &sub_disp, &quantiles);
        let deviations = sub_disp
            .iter()
            .zip(&bins)
            .map(|(&d, &b)| (d - medians[b]).abs())
            .collect::<Array1<f64>>();
        let (mads, _) = binned_median(&sub_mean, &deviations, &quantiles);
        sub_disp
            .iter()
            .zip(&bins)
            .map(|(&d, &b)| if mads[b] > 0.0 { (d - medians[b]) / mads[b] } else { d - medians[b] })
            .collect::<Array1<f64>>()
    };
    for (&g, &v) in expressed.iter().zip(z.iter()) {
        normalized[g] = v;
    }
    FeatureDispersion {
        mean,
        dispersion,
        normalized,
    }
}

/// Indices of the `n_features` most variable genes, most variable first.
/// Unexpressed genes are never selected.
pub fn find_variable_features(lognorm: &CsMat<f64>, n_features: usize) -> Vec<usize> {
    let disp = compute_normalized_dispersion(lognorm);
    let mut feature_indices = (0..lognorm.rows())
        .filter(|&g| !disp.normalized[g].is_nan())
        .collect::<Vec<_>>();
    // descending, ties by index
    feature_indices.sort_by(|&a, &b| {
        disp.normalized[b]
            .partial_cmp(&disp.normalized[a])
            .unwrap_or(Ordering::Equal)
            .then(a.cmp(&b))
    });
    feature_indices.truncate(n_features);
    feature_indices
}

/// Variable genes of one sample, by name, most variable first, together with
/// every gene name that sample carries.
#[derive(Debug, Clone)]
pub struct SampleFeatures {
    /// all gene names of the sample
    pub genes: Vec<String>,
    /// ranked variable genes
    pub variable: Vec<String>,
}

/// Pick genes that are repeatedly variable across samples: ranked by the number
/// of samples calling them variable (descending), ties by median rank across
/// those samples (ascending), then by name. Only genes present in every sample
/// are eligible.
pub fn select_integration_features(samples: &[SampleFeatures], n_features: usize) -> Result<Vec<String>, Error> {
    if samples.is_empty() {
        bail!("no samples to select integration features from");
    }
    let mut ranks: FxHashMap<&str, Vec<f64>> = FxHashMap::default();
    for s in samples {
        for (rank, g) in s.variable.iter().enumerate() {
            ranks.entry(g.as_str()).or_default().push(rank as f64 + 1.0);
        }
    }
    let mut common: BTreeSet<&str> = samples[0].genes.iter().map(String::as_str).collect();
    for s in &samples[1..] {
        let here: BTreeSet<&str> = s.genes.iter().map(String::as_str).collect();
        common = common.intersection(&here).copied().collect();
    }

    let mut candidates = ranks
        .into_iter()
        .filter(|(g, _)| common.contains(g))
        .map(|(g, r)| (g, r.len(), median(&r)))
        .collect::<Vec<_>>();
    candidates.sort_by(|a, b| {
        b.1.cmp(&a.1)
            .then(a.2.partial_cmp(&b.2).unwrap_or(Ordering::Equal))
            .then(a.0.cmp(b.0))
    });
    Ok(candidates
        .into_iter()
        .take(n_features)
        .map(|(g, _, _)| g.to_string())
        .collect())
}

#[cfg(test)]
mod test {
    use super::*;
    use sprs::TriMat;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_variable_gene_ranked_first() {
        // genes 0..20 are flat, gene 20 is bursty, gene 21 is off
        let mut tri = TriMat::new((22, 40));
        for c in 0..40 {
            for g in 0..20 {
                tri.add_triplet(g, c, 1.0f64);
            }
            tri.add_triplet(20, c, if c % 10 == 0 { 4.0 } else { 0.5 });
        }
        let m: CsMat<f64> = tri.to_csc();
        let hvg = find_variable_features(&m, 3);
        assert_eq!(hvg, vec![20, 0, 1]);
        let disp = compute_normalized_dispersion(&m);
        assert!(disp.dispersion[21].is_nan());
        assert!(disp.normalized[21].is_nan());
        assert!(disp.dispersion[20] > disp.dispersion[0]);
    }

    #[test]
    fn test_select_integration_features() {
        let samples = vec![
            SampleFeatures {
                genes: names(&["A", "B", "C", "D", "E"]),
                variable: names(&["A", "B", "C", "E"]),
            },
            SampleFeatures {
                genes: names(&["A", "B", "C", "D"]),
                variable: names(&["C", "B", "D"]),
            },
        ];
        // B and C are variable twice (median ranks 2 and 2, so by name),
        // E is absent from the second sample
        let f = select_integration_features(&samples, 3).unwrap();
        assert_eq!(f, names(&["B", "C", "A"]));
        assert!(select_integration_features(&[], 3).is_err());
    }
}

//! Doublet detection by comparison against simulated doublets.

use crate::dim_red::fit_pca;
use crate::features::find_variable_features;
use crate::nn::knn;
use crate::normalization::{dense_features, log_normalize, scale_data, LogBase, SEURAT_SCALE_FACTOR};
use anyhow::Error;
use log::{debug, info};
use rand::Rng;
use rand::SeedableRng;
use rand_pcg::Pcg64;
use scflow_types::matrix::csc_from_columns;
use scflow_types::{Dataset, DoubletCall, DoubletClass, FeatureBarcodeMatrix};
use serde::{Deserialize, Serialize};

/// Classifies every cell of a dataset as singlet or doublet.
pub trait DoubletDetector {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// One call per cell, aligned with `dataset.cells`. Must be deterministic
    /// for a fixed `seed`.
    fn detect(&self, dataset: &Dataset, seed: u64) -> Result<Vec<DoubletCall>, Error>;
}

/// Settings for doublet removal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DoubletParams {
    /// run doublet removal at all
    pub enabled: bool,
    /// expected doublet rate per 1000 cells
    pub rate_per_thousand: f64,
    /// upper bound on the expected doublet rate
    pub max_rate: f64,
    /// fraction of the combined real + artificial pool that is artificial
    pub artificial_fraction: f64,
    /// variable genes used for the embedding
    pub n_features: usize,
    /// principal components used for the neighbour search
    pub n_pcs: usize,
    /// neighbours inspected per cell
    pub k: usize,
    /// samples smaller than this are not scanned
    pub min_cells: usize,
}

impl Default for DoubletParams {
    fn default() -> Self {
        DoubletParams {
            enabled: true,
            rate_per_thousand: 0.01,
            max_rate: 0.25,
            artificial_fraction: 0.25,
            n_features: 2000,
            n_pcs: 10,
            k: 20,
            min_cells: 20,
        }
    }
}

impl DoubletParams {
    /// Number of doublets expected among `n` cells.
    pub fn expected_doublets(&self, n: usize) -> usize {
        let rate = (self.rate_per_thousand * n as f64 / 1000.0).min(self.max_rate);
        (rate * n as f64).round() as usize
    }
}

/// Simulates doublets by summing random pairs of real cells from the same
/// sample, embeds real and simulated cells together, and scores each real
/// cell by the fraction of its neighbours that are simulated.
#[derive(Debug, Clone, Default)]
pub struct SimulatedDoubletDetector {
    pub params: DoubletParams,
}

impl SimulatedDoubletDetector {
    pub fn new(params: DoubletParams) -> Self {
        SimulatedDoubletDetector { params }
    }

    /// Neighbour scores for the cells of one sample.
    fn score_sample(&self, counts: &FeatureBarcodeMatrix, seed: u64) -> Result<Vec<f64>, Error> {
        let n = counts.num_barcodes();
        let p = &self.params;
        let frac = p.artificial_fraction.clamp(0.01, 0.9);
        let n_sim = ((n as f64 * frac / (1.0 - frac)).round() as usize).max(1);

        let mut rng = Pcg64::seed_from_u64(seed);
        let mut columns = (0..n).map(|c| counts.column(c).collect::<Vec<_>>()).collect::<Vec<_>>();
        for _ in 0..n_sim {
            let a = rng.gen_range(0..n);
            let mut b = rng.gen_range(0..n - 1);
            if b >= a {
                b += 1;
            }
            let mut col = columns[a].clone();
            col.extend(columns[b].iter().copied());
            columns.push(col);
        }
        let total = columns.len();
        let pool = FeatureBarcodeMatrix::new(
            "doublet-pool",
            (0..total).map(|i| i.to_string()).collect(),
            counts.feature_ids.clone(),
            counts.feature_names.clone(),
            csc_from_columns(counts.num_features(), columns),
        )?;

        let lognorm = log_normalize(&pool, Some(SEURAT_SCALE_FACTOR), LogBase::E);
        let hvg = find_variable_features(&lognorm, p.n_features);
        if hvg.is_empty() {
            return Ok(vec![0.0; n]);
        }
        let (scaled, _) = scale_data(&dense_features(&lognorm, &hvg).view(), 10.0);
        let pca = fit_pca(&scaled.view(), p.n_pcs, seed)?;
        let nn = knn(&pca.embedding.view(), p.k, false);

        Ok((0..n)
            .map(|cell| {
                let row = nn.indices.row(cell);
                let artificial = row.iter().filter(|&&j| j >= n).count();
                if row.is_empty() {
                    0.0
                } else {
                    artificial as f64 / row.len() as f64
                }
            })
            .collect())
    }
}

impl DoubletDetector for SimulatedDoubletDetector {
    fn name(&self) -> &'static str {
        "simulated-doublets"
    }

    fn detect(&self, dataset: &Dataset, seed: u64) -> Result<Vec<DoubletCall>, Error> {
        let mut calls = vec![
            DoubletCall {
                class: DoubletClass::Singlet,
                score: 0.0,
            };
            dataset.num_cells()
        ];
        let samples = dataset.group_by("sample_id")?;
        for (sample_idx, (sample, cells)) in samples.iter().enumerate() {
            if cells.len() < self.params.min_cells.max(3) {
                debug!("sample {}: {} cells, skipping doublet scan", sample, cells.len());
                continue;
            }
            let counts = dataset.counts.select_barcodes(cells);
            let scores = self.score_sample(&counts, seed.wrapping_add(sample_idx as u64))?;

            let expected = self.params.expected_doublets(cells.len());
            let mut order = (0..cells.len()).filter(|&i| scores[i] > 0.0).collect::<Vec<_>>();
            order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
            order.truncate(expected);

            for (i, &cell) in cells.iter().enumerate() {
                calls[cell].score = scores[i];
            }
            for &i in &order {
                calls[cells[i]].class = DoubletClass::Doublet;
            }
            info!(
                "sample {}: {} of {} cells called doublets (expected {})",
                sample,
                order.len(),
                cells.len(),
                expected
            );
        }
        Ok(calls)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use rand_distr::{Distribution, Poisson};
    use scflow_types::CellRecord;

    /// Cells drawn from `n_types` distinct expression programs; each sample is
    /// a contiguous block of cells.
    pub(crate) fn synthetic(samples: &[(&str, &str, usize)], genes: usize, n_types: usize, seed: u64) -> Dataset {
        let mut rng = Pcg64::seed_from_u64(seed);
        let mut columns = Vec::new();
        let mut cells = Vec::new();
        for &(sample, group, n) in samples {
            for c in 0..n {
                let t = c % n_types;
                let col = (0..genes)
                    .filter_map(|g| {
                        let lambda = if g % n_types == t { 6.0 } else { 0.3 };
                        let v = Poisson::new(lambda).unwrap().sample(&mut rng) as u32;
                        (v > 0).then_some((g, v))
                    })
                    .collect::<Vec<_>>();
                columns.push(col);
                let id = format!("{sample}_c{c}");
                cells.push(CellRecord::new(id.clone(), format!("c{c}"), sample.into(), group.into()));
            }
        }
        let m = csc_from_columns(genes, columns);
        let fbm = FeatureBarcodeMatrix::new(
            "synthetic",
            cells.iter().map(|c| c.cell_id.clone()).collect(),
            (0..genes).map(|g| format!("ENSG{g:05}")).collect(),
            (0..genes).map(|g| format!("G{g}")).collect(),
            m,
        )
        .unwrap();
        Dataset::new(fbm, cells).unwrap()
    }

    #[test]
    fn test_expected_doublets() {
        let p = DoubletParams::default();
        assert_eq!(p.expected_doublets(1000), 10);
        assert_eq!(p.expected_doublets(5000), 250);
        assert_eq!(p.expected_doublets(100), 0);
    }

    #[test]
    fn test_detect_is_deterministic() {
        let ds = synthetic(&[("s1", "ctrl", 300), ("s2", "stim", 200)], 60, 3, 5);
        let params = DoubletParams {
            n_features: 60,
            rate_per_thousand: 50.0,
            ..Default::default()
        };
        let det = SimulatedDoubletDetector::new(params);
        let a = det.detect(&ds, 42).unwrap();
        let b = det.detect(&ds, 42).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 500);
        let doublets = a.iter().filter(|c| c.class == DoubletClass::Doublet).count();
        // 25% cap on 300 plus 25% on 200
        assert!(doublets > 0 && doublets <= 125);
        assert!(a.iter().all(|c| (0.0..=1.0).contains(&c.score)));
    }

    #[test]
    fn test_small_sample_skipped() {
        let ds = synthetic(&[("tiny", "g", 5)], 10, 2, 1);
        let calls = SimulatedDoubletDetector::default().detect(&ds, 0).unwrap();
        assert!(calls.iter().all(|c| c.class == DoubletClass::Singlet));
    }
}

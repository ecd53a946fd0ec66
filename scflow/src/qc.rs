//! Quality control: doublet removal, per-cell metrics, and the threshold filter.

use crate::doublets::{DoubletDetector, DoubletParams};
use anyhow::{Context, Error};
use log::{info, warn};
use rayon::prelude::*;
use regex::Regex;
use scflow_types::{Dataset, DoubletClass, FeatureBarcodeMatrix, PipelineError, QcMetrics};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Thresholds for the per-cell filter.
///
/// `max_detected_genes` defaults to 5000. Older write-ups of this workflow
/// quote 4000 in prose; 5000 is the value the filter applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QcParams {
    /// keep cells with strictly more counts than this
    pub min_library_size: u64,
    /// keep cells with strictly fewer detected genes than this
    pub max_detected_genes: u32,
    /// keep cells with a strictly smaller mitochondrial percentage than this
    pub max_percent_mt: f64,
    /// regex matched against gene names to find mitochondrial genes
    pub mt_pattern: String,
    pub doublets: DoubletParams,
}

impl Default for QcParams {
    fn default() -> Self {
        QcParams {
            min_library_size: 500,
            max_detected_genes: 5000,
            max_percent_mt: 10.0,
            mt_pattern: "^MT-".to_string(),
            doublets: DoubletParams::default(),
        }
    }
}

/// Why a cell failed the filter. A cell can fail several thresholds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterVerdict {
    pub low_library: bool,
    pub high_detected: bool,
    pub high_mt: bool,
    /// library size is zero, so the mitochondrial percentage is undefined
    pub degenerate: bool,
}

impl FilterVerdict {
    pub fn keep(&self) -> bool {
        !(self.low_library || self.high_detected || self.high_mt || self.degenerate)
    }
}

/// Evaluate the thresholds for one cell. Pure function of the metrics; an
/// empty library fails without surfacing the undefined percentage.
pub fn evaluate(metrics: &QcMetrics, params: &QcParams, cell_id: &str) -> FilterVerdict {
    let (high_mt, degenerate) = match metrics.percent_mt(cell_id) {
        Ok(pct) => (!(pct < params.max_percent_mt), false),
        Err(_) => (false, true),
    };
    FilterVerdict {
        low_library: metrics.library_size <= params.min_library_size,
        high_detected: metrics.detected_genes >= params.max_detected_genes,
        high_mt,
        degenerate,
    }
}

/// `true` iff `library_size > min AND detected_genes < max AND percent_mt < max`.
pub fn keep_cell(metrics: &QcMetrics, params: &QcParams, cell_id: &str) -> bool {
    evaluate(metrics, params, cell_id).keep()
}

/// Library size, detected genes and mitochondrial counts for every cell.
pub fn compute_metrics(counts: &FeatureBarcodeMatrix, mt_pattern: &Regex) -> Vec<QcMetrics> {
    let is_mt = counts
        .feature_names
        .iter()
        .map(|n| mt_pattern.is_match(n))
        .collect::<Vec<_>>();
    (0..counts.num_barcodes())
        .into_par_iter()
        .map(|c| {
            let mut m = QcMetrics::default();
            for (g, v) in counts.column(c) {
                m.library_size += v as u64;
                if v > 0 {
                    m.detected_genes += 1;
                }
                if is_mt[g] {
                    m.mt_counts += v as u64;
                }
            }
            m
        })
        .collect()
}

/// Per-sample accounting of the QC stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleQcReport {
    pub sample_id: String,
    pub cells_in: usize,
    pub doublets_removed: usize,
    pub failed_library_size: usize,
    pub failed_detected_genes: usize,
    pub failed_percent_mt: usize,
    pub zero_library: usize,
    pub cells_kept: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcReport {
    pub params: QcParams,
    pub mt_genes: usize,
    pub samples: Vec<SampleQcReport>,
}

impl QcReport {
    pub fn cells_kept(&self) -> usize {
        self.samples.iter().map(|s| s.cells_kept).sum()
    }
}

/// The QC-passed dataset and how it was obtained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QcOutcome {
    pub dataset: Dataset,
    pub report: QcReport,
}

/// Run the QC stage: doublet removal (when a detector is given), metric
/// computation, and the threshold filter. Metrics and doublet calls are kept on
/// the surviving cells; genes are untouched.
pub fn quality_control(
    dataset: Dataset,
    params: &QcParams,
    detector: Option<&dyn DoubletDetector>,
    seed: u64,
) -> Result<QcOutcome, Error> {
    let mt_pattern = Regex::new(&params.mt_pattern)
        .with_context(|| format!("invalid mitochondrial gene pattern {}", params.mt_pattern))?;
    let mt_genes = dataset
        .counts
        .feature_names
        .iter()
        .filter(|n| mt_pattern.is_match(n))
        .count();
    if mt_genes == 0 {
        warn!("no gene matches mitochondrial pattern {}", params.mt_pattern);
    }

    let mut dataset = dataset;
    if let Some(det) = detector {
        info!("running doublet detection ({})", det.name());
        let calls = det.detect(&dataset, seed)?;
        if calls.len() != dataset.num_cells() {
            return Err(PipelineError::dims("doublet calls vs cells", dataset.num_cells(), calls.len()).into());
        }
        for (cell, call) in dataset.cells.iter_mut().zip(calls) {
            cell.doublet = Some(call);
        }
    }

    let metrics = compute_metrics(&dataset.counts, &mt_pattern);
    for (cell, m) in dataset.cells.iter_mut().zip(&metrics) {
        cell.qc = Some(*m);
    }

    let mut per_sample: BTreeMap<String, SampleQcReport> = BTreeMap::new();
    let mut keep = Vec::new();
    for (j, cell) in dataset.cells.iter().enumerate() {
        let rep = per_sample.entry(cell.sample_id.clone()).or_insert_with(|| SampleQcReport {
            sample_id: cell.sample_id.clone(),
            ..Default::default()
        });
        rep.cells_in += 1;
        if matches!(cell.doublet, Some(d) if d.class == DoubletClass::Doublet) {
            rep.doublets_removed += 1;
            continue;
        }
        let verdict = evaluate(&metrics[j], params, &cell.cell_id);
        rep.failed_library_size += verdict.low_library as usize;
        rep.failed_detected_genes += verdict.high_detected as usize;
        rep.failed_percent_mt += verdict.high_mt as usize;
        rep.zero_library += verdict.degenerate as usize;
        if verdict.keep() {
            rep.cells_kept += 1;
            keep.push(j);
        }
    }

    // report in first-appearance order of samples
    let mut order = Vec::new();
    for c in &dataset.cells {
        if !order.contains(&c.sample_id) {
            order.push(c.sample_id.clone());
        }
    }
    let samples = order
        .iter()
        .filter_map(|s| per_sample.remove(s))
        .collect::<Vec<_>>();
    for s in &samples {
        info!(
            "sample {}: {} cells in, {} doublets, {} kept",
            s.sample_id, s.cells_in, s.doublets_removed, s.cells_kept
        );
    }

    let filtered = dataset.select_cells(&keep);
    Ok(QcOutcome {
        dataset: filtered,
        report: QcReport {
            params: params.clone(),
            mt_genes,
            samples,
        },
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;
    use scflow_types::matrix::csc_from_columns;
    use scflow_types::{CellRecord, DoubletCall};

    fn metrics(library_size: u64, detected_genes: u32, mt_counts: u64) -> QcMetrics {
        QcMetrics {
            library_size,
            detected_genes,
            mt_counts,
        }
    }

    #[test]
    fn test_scenarios() {
        let p = QcParams::default();
        // 5% mitochondrial
        assert!(keep_cell(&metrics(1000, 2000, 50), &p, "c1"));
        // 15% mitochondrial
        assert!(!keep_cell(&metrics(1000, 2000, 150), &p, "c2"));
        // empty library: removed, no error surfaces
        let v = evaluate(&metrics(0, 0, 0), &p, "c3");
        assert!(v.degenerate && !v.keep());
    }

    #[test]
    fn test_threshold_edges() {
        let p = QcParams::default();
        assert!(!keep_cell(&metrics(500, 100, 0), &p, "c"));
        assert!(keep_cell(&metrics(501, 100, 0), &p, "c"));
        assert!(!keep_cell(&metrics(1000, 5000, 0), &p, "c"));
        assert!(keep_cell(&metrics(1000, 4999, 0), &p, "c"));
        assert!(!keep_cell(&metrics(1000, 100, 100), &p, "c"));
        assert!(keep_cell(&metrics(1000, 100, 99), &p, "c"));
    }

    proptest! {
        #[test]
        fn prop_keep_matches_predicate(lib in 0u64..20_000, det in 0u32..10_000, mt_frac in 0.0f64..=1.0) {
            let mt = (lib as f64 * mt_frac).floor() as u64;
            let m = metrics(lib, det, mt);
            let p = QcParams::default();
            let expected = lib > 500 && det < 5000 && lib > 0 && (100.0 * mt as f64 / lib as f64) < 10.0;
            prop_assert_eq!(keep_cell(&m, &p, "cell"), expected);
            if lib == 0 {
                prop_assert!(!keep_cell(&m, &p, "cell"));
            }
        }

        #[test]
        fn prop_filter_is_order_independent(libs in proptest::collection::vec(0u32..2000, 1..40)) {
            // every cell: one non-mt gene with `lib` counts
            let ds = one_gene_dataset(&libs);
            let mut p = QcParams::default();
            p.doublets.enabled = false;
            let forward = quality_control(ds.clone(), &p, None, 0).unwrap();
            let rev_idx = (0..libs.len()).rev().collect::<Vec<_>>();
            let backward = quality_control(ds.select_cells(&rev_idx), &p, None, 0).unwrap();
            let mut a = forward.dataset.cell_ids();
            let mut b = backward.dataset.cell_ids();
            a.sort();
            b.sort();
            prop_assert_eq!(a, b);
        }
    }

    fn one_gene_dataset(libs: &[u32]) -> Dataset {
        let cols = libs.iter().map(|&l| vec![(0, l)]).collect::<Vec<_>>();
        let cells = (0..libs.len())
            .map(|i| CellRecord::new(format!("s_{i}"), i.to_string(), "s".into(), "g".into()))
            .collect::<Vec<_>>();
        let fbm = FeatureBarcodeMatrix::new(
            "t",
            cells.iter().map(|c| c.cell_id.clone()).collect(),
            vec!["E0".into()],
            vec!["G0".into()],
            csc_from_columns(1, cols),
        )
        .unwrap();
        Dataset::new(fbm, cells).unwrap()
    }

    struct FixedCalls(Vec<DoubletClass>);

    impl DoubletDetector for FixedCalls {
        fn name(&self) -> &'static str {
            "fixed"
        }
        fn detect(&self, _: &Dataset, _: u64) -> Result<Vec<DoubletCall>, Error> {
            Ok(self.0.iter().map(|&class| DoubletCall { class, score: 0.5 }).collect())
        }
    }

    #[test]
    fn test_quality_control() {
        // genes: G0, MT-CO1; cells: good, mito-heavy, empty, small, doublet
        let cols = vec![
            vec![(0, 950), (1, 50)],
            vec![(0, 850), (1, 150)],
            vec![],
            vec![(0, 400)],
            vec![(0, 2000)],
        ];
        let cells = (0..5)
            .map(|i| CellRecord::new(format!("s{}_{i}", i % 2), i.to_string(), format!("s{}", i % 2), "g".into()))
            .collect::<Vec<_>>();
        let fbm = FeatureBarcodeMatrix::new(
            "t",
            cells.iter().map(|c| c.cell_id.clone()).collect(),
            vec!["E0".into(), "E1".into()],
            vec!["G0".into(), "MT-CO1".into()],
            csc_from_columns(2, cols),
        )
        .unwrap();
        let ds = Dataset::new(fbm, cells).unwrap();
        let det = FixedCalls(vec![
            DoubletClass::Singlet,
            DoubletClass::Singlet,
            DoubletClass::Singlet,
            DoubletClass::Singlet,
            DoubletClass::Doublet,
        ]);

        let out = quality_control(ds, &QcParams::default(), Some(&det), 1).unwrap();
        assert_eq!(out.dataset.cell_ids(), vec!["s0_0"]);
        assert_eq!(out.dataset.num_genes(), 2);
        let kept = &out.dataset.cells[0];
        assert_eq!(kept.qc.unwrap().library_size, 1000);
        assert_eq!(kept.doublet.unwrap().class, DoubletClass::Singlet);

        assert_eq!(out.report.mt_genes, 1);
        assert_eq!(out.report.cells_kept(), 1);
        let s0 = &out.report.samples[0];
        assert_eq!((s0.sample_id.as_str(), s0.cells_in, s0.doublets_removed), ("s0", 3, 1));
        assert_eq!(s0.zero_library, 1);
        let s1 = &out.report.samples[1];
        assert_eq!((s1.cells_in, s1.failed_percent_mt, s1.failed_library_size), (2, 1, 1));
    }
}

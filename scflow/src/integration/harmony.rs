//! Iterative soft clustering with a batch-diversity penalty, followed by a
//! per-cluster ridge regression that removes batch effects from the embedding.

use super::{IntegrationInput, IntegrationMethod, MethodName};
use crate::dim_red::l2_normalize_rows;
use crate::dim_red::linalg::solve_spd;
use anyhow::Error;
use log::{debug, info, warn};
use ndarray::parallel::prelude::*;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::distributions::{Distribution, WeightedIndex};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use scflow_types::Embedding;
use serde::{Deserialize, Serialize};

/// Settings for the diversity-penalized correction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarmonyParams {
    /// diversity penalty; 0 disables it
    pub theta: f64,
    /// soft-assignment width
    pub sigma: f64,
    /// ridge penalty on the batch terms
    pub lambda: f64,
    /// soft clusters; 0 picks `min(round(cells / 30), 100)`
    pub n_clusters: usize,
    pub max_iter: usize,
    pub max_iter_cluster: usize,
    pub epsilon_cluster: f64,
    pub epsilon_harmony: f64,
}

impl Default for HarmonyParams {
    fn default() -> Self {
        HarmonyParams {
            theta: 2.0,
            sigma: 0.1,
            lambda: 1.0,
            n_clusters: 0,
            max_iter: 10,
            max_iter_cluster: 20,
            epsilon_cluster: 1e-5,
            epsilon_harmony: 1e-4,
        }
    }
}

impl HarmonyParams {
    fn clusters_for(&self, cells: usize) -> usize {
        let k = if self.n_clusters > 0 {
            self.n_clusters
        } else {
            ((cells as f64 / 30.0).round() as usize).min(100)
        };
        k.clamp(1, cells.max(1))
    }
}

/// k-means++ seeding followed by a few cosine Lloyd rounds. Rows of `zc` are
/// unit length.
fn init_centroids(zc: &Array2<f64>, k: usize, seed: u64) -> Array2<f64> {
    let n = zc.nrows();
    let mut rng = Pcg64::seed_from_u64(seed);
    let mut chosen = vec![rng.gen_range(0..n)];
    let mut best = zc.dot(&zc.row(chosen[0])).mapv(|s| (2.0 * (1.0 - s)).max(0.0));
    while chosen.len() < k {
        let next = match WeightedIndex::new(best.iter().copied()) {
            Ok(dist) => dist.sample(&mut rng),
            Err(_) => (0..n).find(|i| !chosen.contains(i)).unwrap_or(0),
        };
        chosen.push(next);
        let d = zc.dot(&zc.row(next)).mapv(|s| (2.0 * (1.0 - s)).max(0.0));
        best.zip_mut_with(&d, |b, &x| *b = b.min(x));
    }
    let mut y = zc.select(Axis(0), &chosen);

    for _ in 0..10 {
        let sim = zc.dot(&y.t());
        let mut sums = Array2::<f64>::zeros(y.dim());
        for (i, row) in sim.axis_iter(Axis(0)).enumerate() {
            let best = row
                .iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |acc, (c, &s)| if s > acc.1 { (c, s) } else { acc });
            sums.row_mut(best.0).scaled_add(1.0, &zc.row(i));
        }
        for (c, mut row) in sums.axis_iter_mut(Axis(0)).enumerate() {
            if row.iter().all(|&v| v == 0.0) {
                row.assign(&y.row(c));
            }
        }
        y = l2_normalize_rows(&sums);
    }
    y
}

/// Soft assignment of every cell to every centroid, penalizing clusters whose
/// batch composition departs from the overall one.
fn soft_assign(
    zc: &Array2<f64>,
    y: &Array2<f64>,
    penalty: Option<&Array2<f64>>,
    batches: &[usize],
    sigma: f64,
) -> Array2<f64> {
    let mut r = zc.dot(&y.t()).mapv(|s| -2.0 * (1.0 - s) / sigma);
    r.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(i, mut row)| {
            if let Some(p) = penalty {
                row += &p.column(batches[i]);
            }
            let max = row.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
            row.mapv_inplace(|v| (v - max).exp());
            let total = row.sum();
            row /= total;
        });
    r
}

/// `theta * ln((E + 1) / (O + 1))` per cluster x batch, with `O` the observed
/// and `E` the expected soft counts.
fn diversity_penalty(r: &Array2<f64>, batches: &[usize], batch_frac: &Array1<f64>, theta: f64) -> Array2<f64> {
    let k = r.ncols();
    let mut observed = Array2::<f64>::zeros((k, batch_frac.len()));
    for (i, row) in r.axis_iter(Axis(0)).enumerate() {
        observed.column_mut(batches[i]).scaled_add(1.0, &row);
    }
    let sizes = r.sum_axis(Axis(0));
    let mut penalty = Array2::<f64>::zeros(observed.dim());
    for ((c, b), p) in penalty.indexed_iter_mut() {
        let expected = sizes[c] * batch_frac[b];
        *p = theta * ((expected + 1.0) / (observed[[c, b]] + 1.0)).ln();
    }
    penalty
}

/// Mixture-of-experts ridge correction: per soft cluster, regress the
/// embedding on an intercept plus batch indicators (weighted by membership)
/// and subtract the batch terms.
pub fn moe_correct(
    z: &ArrayView2<f64>,
    r: &Array2<f64>,
    batches: &[usize],
    n_batches: usize,
    lambda: f64,
) -> Result<Array2<f64>, Error> {
    let (n, d) = z.dim();
    let mut out = z.to_owned();
    for rk in r.axis_iter(Axis(1)) {
        let mut a = Array2::<f64>::zeros((n_batches + 1, n_batches + 1));
        let mut rhs = Array2::<f64>::zeros((n_batches + 1, d));
        for i in 0..n {
            let (b, w) = (batches[i] + 1, rk[i]);
            a[[0, 0]] += w;
            a[[0, b]] += w;
            a[[b, 0]] += w;
            a[[b, b]] += w;
            rhs.row_mut(0).scaled_add(w, &z.row(i));
            rhs.row_mut(b).scaled_add(w, &z.row(i));
        }
        if a[[0, 0]] < 1e-12 {
            continue;
        }
        for b in 1..=n_batches {
            a[[b, b]] += lambda;
        }
        let beta = solve_spd(&a, &rhs)?;
        for i in 0..n {
            out.row_mut(i).scaled_add(-rk[i], &beta.row(batches[i] + 1));
        }
    }
    Ok(out)
}

/// Correct `z` (cells x dims) for the batch codes in `batches`.
pub fn harmonize(
    z: &ArrayView2<f64>,
    batches: &[usize],
    n_batches: usize,
    params: &HarmonyParams,
    seed: u64,
) -> Result<Array2<f64>, Error> {
    let n = z.nrows();
    if n_batches < 2 || n == 0 {
        warn!("harmony: fewer than two batches, embedding unchanged");
        return Ok(z.to_owned());
    }
    let mut counts = Array1::<f64>::zeros(n_batches);
    for &b in batches {
        counts[b] += 1.0;
    }
    let batch_frac = counts / n as f64;
    let k = params.clusters_for(n);
    info!("harmony: {} cells, {} batches, {} clusters", n, n_batches, k);

    let mut corrected = z.to_owned();
    let mut y = init_centroids(&l2_normalize_rows(&corrected), k, seed);
    for iter in 0..params.max_iter {
        let zc = l2_normalize_rows(&corrected);
        let mut r = soft_assign(&zc, &y, None, batches, params.sigma);
        for _ in 0..params.max_iter_cluster {
            let penalty = diversity_penalty(&r, batches, &batch_frac, params.theta);
            let next = soft_assign(&zc, &y, Some(&penalty), batches, params.sigma);
            y = l2_normalize_rows(&next.t().dot(&zc));
            let change = (&next - &r).fold(0.0, |m: f64, v| m.max(v.abs()));
            r = next;
            if change < params.epsilon_cluster {
                break;
            }
        }

        let next = moe_correct(z, &r, batches, n_batches, params.lambda)?;
        let diff = &next - &corrected;
        let norm = corrected.iter().map(|v| v * v).sum::<f64>().sqrt();
        let rel = diff.iter().map(|v| v * v).sum::<f64>().sqrt() / norm.max(f64::MIN_POSITIVE);
        corrected = next;
        debug!("harmony iteration {}: relative change {:.3e}", iter + 1, rel);
        if rel < params.epsilon_harmony {
            info!("harmony converged after {} iterations", iter + 1);
            break;
        }
    }
    Ok(corrected)
}

pub struct Harmony {
    params: HarmonyParams,
}

impl Harmony {
    pub fn new(params: HarmonyParams) -> Harmony {
        Harmony { params }
    }
}

impl IntegrationMethod for Harmony {
    fn name(&self) -> MethodName {
        MethodName::Harmony
    }

    fn integrate(&self, input: &IntegrationInput, base: &Embedding) -> Result<Embedding, Error> {
        let codes = input.batch_codes();
        let values = harmonize(
            &base.values.view(),
            &codes,
            input.batches.num_labels(),
            &self.params,
            input.seed,
        )?;
        Ok(Embedding::new(
            self.name().embedding_name(),
            self.name().as_str(),
            base.cell_ids.clone(),
            values,
        ))
    }
}

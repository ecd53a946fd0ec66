#![allow(non_snake_case)]

use super::linalg::{orthonormalize, thin_svd};
use super::{Pca, PcaResult};
use anyhow::{format_err, Error};
use ndarray::{s, Array2, ArrayView2, Axis};
use ndarray_rand::RandomExt;
use rand::distributions::Uniform;
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

/// Settings for Randomized PCA
pub struct RandSvd {
    /// Number of extra projection dimensions beyond the requested k
    pub oversample: usize,

    /// Number of power iteration to perform
    pub n_iter: usize,

    /// Seed for the random test matrix
    pub seed: u64,
}

impl RandSvd {
    /// Create a new RandSvd with default settings.
    pub fn new() -> RandSvd {
        RandSvd {
            oversample: 10,
            n_iter: 4,
            seed: 0,
        }
    }

    /// Default settings with the given seed.
    pub fn with_seed(seed: u64) -> RandSvd {
        RandSvd { seed, ..Self::new() }
    }
}

impl Default for RandSvd {
    fn default() -> Self {
        Self::new()
    }
}

impl Pca for RandSvd {
    fn run_pca(&self, array: &ArrayView2<f64>, k: usize) -> Result<PcaResult, Error> {
        let l = k + self.oversample;
        let (u, s, vt) = svd_rand(array, k, l, self.n_iter, self.seed)?;
        Ok((u, s, vt.reversed_axes()))
    }
}

/// Perform an SVD of matrix `A`, making a rank `k` approximation. Use `l`
/// projection dimensions and `n_iter` power iterations. Signs are fixed so the
/// largest-magnitude entry of each right singular vector is positive.
#[inline(never)]
pub fn svd_rand(
    A: &ArrayView2<f64>,
    k: usize, // svd rank
    l: usize,
    n_iter: usize, // power iterations
    seed: u64,
) -> Result<PcaResult, Error> {
    let (m, n) = A.dim();

    if m < 1 || n < 1 {
        return Err(format_err!("The input matrix must be non-empty."));
    }

    if k == 0 || k > std::cmp::min(m, n) {
        return Err(format_err!("invalid k {} for a {}x{} matrix", k, m, n));
    }
    let l = l.clamp(k, std::cmp::min(m, n));

    let mut rng = Pcg64Mcg::seed_from_u64(seed);
    let unif = Uniform::new(-1.0, 1.0);

    let omega = Array2::random_using((n, l), unif, &mut rng);
    let mut Q = orthonormalize(A.dot(&omega));
    for _ in 0..n_iter {
        let W = orthonormalize(A.t().dot(&Q));
        Q = orthonormalize(A.dot(&W));
    }

    let B = Q.t().dot(A);
    let (Ub, sigma, Vt) = thin_svd(&B)?;
    let mut U = Q.dot(&Ub.slice(s![.., ..k]));
    let mut Vt = Vt.slice(s![..k, ..]).to_owned();
    let sigma = sigma.slice(s![..k]).to_owned();

    for (mut u_col, mut v_row) in U.axis_iter_mut(Axis(1)).zip(Vt.axis_iter_mut(Axis(0))) {
        let pivot = v_row
            .iter()
            .copied()
            .fold(0.0f64, |best, x| if x.abs() > best.abs() { x } else { best });
        if pivot < 0.0 {
            u_col.mapv_inplace(|v| -v);
            v_row.mapv_inplace(|v| -v);
        }
    }

    Ok((U, sigma, Vt))
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_exact_low_rank() {
        // rank 2 matrix, both orientations
        let a = array![
            [1.0, 2.0, 1.0, 2.0, 1.0],
            [2.0, 4.0, 2.0, 4.0, 2.0],
            [1.0, 0.0, 1.0, 0.0, 1.0],
            [0.0, 1.0, 0.0, 1.0, 0.0],
        ];
        for m in [a.clone(), a.t().to_owned()] {
            let (u, s, vt) = svd_rand(&m.view(), 2, 4, 2, 7).unwrap();
            let recon = u.dot(&Array2::from_diag(&s)).dot(&vt);
            assert_abs_diff_eq!(recon, m, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_deterministic_signs() {
        let a = array![[4.0, 0.0], [3.0, -5.0], [0.0, 1.0]];
        let (u1, s1, v1) = svd_rand(&a.view(), 2, 2, 2, 1).unwrap();
        let (u2, s2, v2) = svd_rand(&a.view(), 2, 2, 2, 99).unwrap();
        assert_abs_diff_eq!(s1, s2, epsilon = 1e-10);
        assert_abs_diff_eq!(u1, u2, epsilon = 1e-8);
        assert_abs_diff_eq!(v1, v2, epsilon = 1e-8);
    }

    #[test]
    fn test_invalid_k() {
        let a = Array2::<f64>::ones((3, 2));
        assert!(svd_rand(&a.view(), 3, 3, 1, 0).is_err());
        assert!(svd_rand(&a.view(), 0, 3, 1, 0).is_err());
    }
}

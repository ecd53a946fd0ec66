//! Dimensionality reduction on dense, scaled expression matrices.
//!
//! All routines take a cells x features matrix and return cell embeddings
//! with one row per cell. The QR, SVD and Cholesky kernels in [`linalg`] come
//! from `nalgebra`, so no LAPACK backend is needed.

use anyhow::{bail, Error};
use log::warn;
use ndarray::{Array1, Array2, ArrayView2, Axis};

/// Dense kernels: QR basis, thin SVD, Cholesky solve
pub mod linalg;

/// Randomized SVD method
pub mod rand_svd;

/// `(U, S, V)` with `V` stored features x k
pub type PcaResult = (Array2<f64>, Array1<f64>, Array2<f64>);

/// Perform a SVD of a `matrix`, retaining `k` principal components.
/// This trait always performs the pure SVD of the matrix. Special cases of SVD
/// such as PCA can be achieved by the appropriate shifts and scaling of `matrix`
pub trait Pca {
    /// Compute a rank `k` decomposition of `matrix`
    fn run_pca(&self, matrix: &ArrayView2<f64>, k: usize) -> Result<PcaResult, Error>;
}

/// A fitted PCA: cell embeddings plus the loadings needed to project new
/// cells into the same space.
#[derive(Debug, Clone)]
pub struct PcaFit {
    /// cells x k, equal to `U * diag(S)`
    pub embedding: Array2<f64>,
    /// features x k
    pub loadings: Array2<f64>,
    /// per-component standard deviation
    pub stdev: Array1<f64>,
}

impl PcaFit {
    /// Project rows of `data` (cells x features, scaled like the fit input).
    pub fn project(&self, data: &ArrayView2<f64>) -> Array2<f64> {
        data.dot(&self.loadings)
    }
}

/// PCA of an already centered/scaled cells x features matrix. `k` is reduced
/// (with a warning) when the matrix is too small.
pub fn fit_pca(data: &ArrayView2<f64>, k: usize, seed: u64) -> Result<PcaFit, Error> {
    let (cells, features) = data.dim();
    if cells < 2 || features < 1 {
        bail!("PCA needs at least 2 cells and 1 feature, got {}x{}", cells, features);
    }
    let max_k = cells.min(features);
    let k = if k > max_k {
        warn!("matrix shape {:?} < requested PCs {}, reducing to {}", data.dim(), k, max_k);
        max_k
    } else {
        k
    };
    let (u, s, v) = rand_svd::RandSvd::with_seed(seed).run_pca(data, k)?;
    let embedding = &u * &s.view().insert_axis(Axis(0));
    let stdev = s.mapv(|x| x / ((cells - 1) as f64).sqrt());
    Ok(PcaFit {
        embedding,
        loadings: v,
        stdev,
    })
}

/// Scale every row of `m` to unit L2 norm (zero rows stay zero).
pub fn l2_normalize_rows(m: &Array2<f64>) -> Array2<f64> {
    let mut out = m.clone();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let norm = row.dot(&row).sqrt();
        if norm > 0.0 {
            row.mapv_inplace(|v| v / norm);
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray_rand::RandomExt;
    use rand::SeedableRng;
    use rand_distr::Normal;
    use rand_pcg::Pcg64Mcg;

    #[test]
    fn test_fit_pca_recovers_structure() {
        // two latent directions plus small noise
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let scores = Array2::random_using((200, 2), Normal::new(0.0, 3.0).unwrap(), &mut rng);
        let dirs = Array2::random_using((2, 40), Normal::new(0.0, 1.0).unwrap(), &mut rng);
        let noise = Array2::random_using((200, 40), Normal::new(0.0, 0.01).unwrap(), &mut rng);
        let mut data = scores.dot(&dirs) + noise;
        let means = data.mean_axis(Axis(0)).unwrap();
        data -= &means;

        let fit = fit_pca(&data.view(), 5, 1).unwrap();
        assert_eq!(fit.embedding.dim(), (200, 5));
        assert_eq!(fit.loadings.dim(), (40, 5));
        assert!(fit.stdev[1] > 10.0 * fit.stdev[2]);

        // on the signal components the embedding of the training data equals its projection
        let projected = fit.project(&data.view());
        assert_abs_diff_eq!(
            projected.slice(ndarray::s![.., ..2]),
            fit.embedding.slice(ndarray::s![.., ..2]),
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_fit_pca_reduces_k() {
        let data = Array2::from_shape_fn((3, 5), |(i, j)| (i * j) as f64 - 2.0);
        let fit = fit_pca(&data.view(), 30, 0).unwrap();
        assert_eq!(fit.embedding.ncols(), 3);
        assert!(fit_pca(&Array2::zeros((1, 4)).view(), 2, 0).is_err());
    }

    #[test]
    fn test_l2_normalize_rows() {
        let m = ndarray::array![[3.0, 4.0], [0.0, 0.0]];
        let n = l2_normalize_rows(&m);
        assert_abs_diff_eq!(n, ndarray::array![[0.6, 0.8], [0.0, 0.0]], epsilon = 1e-12);
    }
}

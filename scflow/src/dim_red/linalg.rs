#![allow(non_snake_case)]

//! Dense factorizations used by the randomized SVD and the correction steps,
//! delegated to `nalgebra` with conversions at the ndarray boundary.

use anyhow::{bail, format_err, Error};
use nalgebra::DMatrix;
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};

fn to_dmatrix<S: Data<Elem = f64>>(A: &ArrayBase<S, Ix2>) -> DMatrix<f64> {
    DMatrix::from_fn(A.nrows(), A.ncols(), |i, j| A[(i, j)])
}

fn to_array(M: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((M.nrows(), M.ncols()), |(i, j)| M[(i, j)])
}

/// Orthonormal basis for the column space of `A` (the thin Q of a
/// Householder QR). `A` must have at least as many rows as columns.
pub fn orthonormalize(A: Array2<f64>) -> Array2<f64> {
    to_array(&to_dmatrix(&A).qr().q())
}

/// Thin SVD `B = U diag(S) Vt`, singular values in descending order.
pub fn thin_svd<S: Data<Elem = f64>>(B: &ArrayBase<S, Ix2>) -> Result<(Array2<f64>, Array1<f64>, Array2<f64>), Error> {
    let svd = to_dmatrix(B).svd(true, true);
    let U = svd.u.as_ref().ok_or_else(|| format_err!("SVD did not produce U"))?;
    let Vt = svd.v_t.as_ref().ok_or_else(|| format_err!("SVD did not produce V^T"))?;

    let mut order = (0..svd.singular_values.len()).collect::<Vec<_>>();
    order.sort_by(|&a, &b| svd.singular_values[b].total_cmp(&svd.singular_values[a]));

    let U = Array2::from_shape_fn((U.nrows(), order.len()), |(i, j)| U[(i, order[j])]);
    let S = order.iter().map(|&j| svd.singular_values[j]).collect::<Array1<f64>>();
    let Vt = Array2::from_shape_fn((order.len(), Vt.ncols()), |(i, j)| Vt[(order[i], j)]);
    Ok((U, S, Vt))
}

/// Solve `A x = b` for a symmetric positive definite `A` by Cholesky
/// factorization. `b` may hold several right-hand sides as columns.
pub fn solve_spd(A: &Array2<f64>, b: &Array2<f64>) -> Result<Array2<f64>, Error> {
    let n = A.nrows();
    if A.ncols() != n || b.nrows() != n {
        bail!("solve_spd: incompatible shapes {:?} and {:?}", A.dim(), b.dim());
    }
    let Some(chol) = to_dmatrix(A).cholesky() else {
        bail!("solve_spd: matrix is not positive definite");
    };
    Ok(to_array(&chol.solve(&to_dmatrix(b))))
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, s};

    #[test]
    fn test_orthonormalize() {
        let a = array![[1.0, 1.0], [0.0, 1.0], [1.0, 0.0]];
        let q = orthonormalize(a.clone());
        assert_eq!(q.dim(), (3, 2));
        assert_abs_diff_eq!(q.t().dot(&q), Array2::eye(2), epsilon = 1e-12);
        // same column space: projecting `a` onto it changes nothing
        assert_abs_diff_eq!(q.dot(&q.t().dot(&a)), a, epsilon = 1e-12);
    }

    #[test]
    fn test_thin_svd_both_shapes() {
        let b = array![[3.0, 0.0, 1.0, 2.0], [1.0, 2.0, 0.0, 1.0]];
        for m in [b.clone(), b.t().to_owned()] {
            let (u, s, vt) = thin_svd(&m).unwrap();
            assert_eq!(s.len(), 2);
            let recon = u.dot(&Array2::from_diag(&s)).dot(&vt);
            assert_abs_diff_eq!(recon, m, epsilon = 1e-10);
            assert!(s[0] >= s[1]);
        }
    }

    #[test]
    fn test_thin_svd_orders_values() {
        let d = array![[1.0, 0.0, 0.0], [0.0, 5.0, 0.0], [0.0, 0.0, 3.0]];
        let (u, s, _) = thin_svd(&d.slice(s![.., ..])).unwrap();
        assert_abs_diff_eq!(s, array![5.0, 3.0, 1.0], epsilon = 1e-12);
        assert_abs_diff_eq!(u[(1, 0)].abs(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_solve_spd() {
        let a = array![[4.0, 1.0], [1.0, 3.0]];
        let b = array![[1.0, 0.0], [2.0, 1.0]];
        let x = solve_spd(&a, &b).unwrap();
        assert_abs_diff_eq!(a.dot(&x), b, epsilon = 1e-12);
        assert!(solve_spd(&array![[0.0, 0.0], [0.0, 1.0]], &b).is_err());
        assert!(solve_spd(&a, &array![[1.0]]).is_err());
    }
}

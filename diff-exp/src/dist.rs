use statrs::function::erf::erfc;
use std::cmp::Ordering;

/// Benjamini-Hochberg adjusted p-values for `(index, p)` pairs. Returns the
/// pairs sorted by descending raw p-value, NaNs first.
#[inline]
pub fn adjusted_pvalue_bh(pvalue: &[(usize, f64)]) -> Vec<(usize, f64)> {
    let mut arr = pvalue.to_vec();
    arr.sort_by(|&(_, a), &(_, b)| match a.partial_cmp(&b) {
        Some(o) => o.reverse(),
        None => {
            if a.is_nan() && b.is_nan() {
                Ordering::Equal
            } else if a.is_nan() {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
    });

    // q = min(1, cummin(n / rank * p)) over descending p
    let len = arr.len() as f64;
    let mut min = f64::MAX;
    for (idx, (_, ref mut val)) in arr.iter_mut().enumerate() {
        *val *= len / (len - idx as f64);
        if *val < min {
            min = *val
        }
        *val = min.min(1.0);
    }

    arr
}

/// Bonferroni correction against `n_tests` hypotheses.
#[inline]
pub fn adjusted_pvalue_bonferroni(p: f64, n_tests: usize) -> f64 {
    (p * n_tests as f64).min(1.0)
}

/// Two-sided tail probability of a standard normal deviate.
#[inline]
pub fn normal_two_sided(z: f64) -> f64 {
    erfc(z.abs() / std::f64::consts::SQRT_2)
}

/// Wilkinson's minimum-p combination with r = 1: `1 - (1 - min p)^m`.
/// NaN inputs are ignored; returns NaN when nothing is left.
pub fn minimump(pvalues: &[f64]) -> f64 {
    let valid = pvalues.iter().copied().filter(|p| !p.is_nan()).collect::<Vec<_>>();
    if valid.is_empty() {
        return f64::NAN;
    }
    let min = valid.iter().copied().fold(f64::INFINITY, f64::min);
    // stays accurate when min p is far below machine epsilon
    -(valid.len() as f64 * (-min).ln_1p()).exp_m1()
}

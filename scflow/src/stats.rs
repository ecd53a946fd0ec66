//! Statistics functions

use ndarray::prelude::*;
use ndarray::DataMut;
use ndarray_stats::errors::QuantileError;
use noisy_float::prelude::{n64, N64};
use num_traits::FromPrimitive;
use std::ops::{Add, Div, Mul, Rem, Sub};

/// Return the median. Sorts its argument in place.
// ndarray-stats' quantile_mut can overflow the stack on large inputs
// (https://github.com/rust-ndarray/ndarray-stats/issues/86), so sort instead.
pub fn median_mut<S, T>(xs: &mut ArrayBase<S, Ix1>) -> Result<T, QuantileError>
where
    S: DataMut<Elem = T>,
    T: Clone + Copy + Ord + FromPrimitive,
    T: Add<Output = T> + Sub<Output = T> + Mul<Output = T> + Div<Output = T> + Rem<Output = T>,
{
    if xs.is_empty() {
        return Err(QuantileError::EmptyInput);
    }
    match xs.as_slice_mut() {
        Some(vector) => vector.sort_unstable(),
        None => {
            let mut owned = xs.to_vec();
            owned.sort_unstable();
            xs.assign(&Array1::from(owned));
        }
    }
    let n = xs.len();
    Ok(if n % 2 == 0 {
        let two = T::from_u64(2).ok_or(QuantileError::EmptyInput)?;
        (xs[n / 2] + xs[n / 2 - 1]) / two
    } else {
        xs[n / 2]
    })
}

/// Median of finite `f64` values, NaN when there are none.
pub fn median(values: &[f64]) -> f64 {
    let mut arr = values.iter().filter(|v| v.is_finite()).map(|&v| n64(v)).collect::<Array1<N64>>();
    median_mut(&mut arr).map_or(f64::NAN, N64::raw)
}

/// Mean and sample variance (n - 1 denominator) of a slice.
pub fn mean_var(values: &[f64]) -> (f64, f64) {
    let n = values.len();
    if n == 0 {
        return (f64::NAN, f64::NAN);
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    if n == 1 {
        return (mean, 0.0);
    }
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (n - 1) as f64;
    (mean, var)
}

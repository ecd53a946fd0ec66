//! 2-D projections of embeddings for plotting.

use crate::dim_red::fit_pca;
use anyhow::Error;
use ndarray::{s, Axis};
use scflow_types::{Embedding, PipelineError};

/// Maps an embedding to two dimensions.
pub trait Projector {
    /// Project `embedding` and name the result `name`.
    fn project(&self, embedding: &Embedding, name: &str) -> Result<Embedding, Error>;
}

/// Projects the leading `dims` components of an embedding onto its two
/// principal axes.
#[derive(Debug, Clone)]
pub struct PrincipalPlaneProjector {
    /// leading embedding dimensions used; 0 means all
    pub dims: usize,
    pub seed: u64,
}

impl Default for PrincipalPlaneProjector {
    fn default() -> Self {
        PrincipalPlaneProjector { dims: 30, seed: 0 }
    }
}

impl Projector for PrincipalPlaneProjector {
    fn project(&self, embedding: &Embedding, name: &str) -> Result<Embedding, Error> {
        if embedding.num_cells() < 2 {
            return Err(PipelineError::EmptyInput(format!("projection of {}", embedding.name)).into());
        }
        let dims = if self.dims == 0 { embedding.dims() } else { self.dims.min(embedding.dims()) };
        let mut x = embedding.values.slice(s![.., ..dims]).to_owned();
        if let Some(mean) = x.mean_axis(Axis(0)) {
            x -= &mean;
        }
        let fit = fit_pca(&x.view(), 2, self.seed)?;
        let mut values = fit.embedding;
        if values.ncols() < 2 {
            // one-dimensional input: pad the second axis
            let mut padded = ndarray::Array2::zeros((values.nrows(), 2));
            padded.slice_mut(s![.., ..values.ncols()]).assign(&values);
            values = padded;
        }
        Ok(Embedding::new(name, embedding.method.clone(), embedding.cell_ids.clone(), values))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};

    #[test]
    fn test_projection_shape_and_spread() {
        let values = Array2::from_shape_fn((50, 6), |(i, j)| if j == 0 { i as f64 } else { (i % 3) as f64 * 0.1 });
        let emb = Embedding::new("integrated.cca", "cca", (0..50).map(|i| i.to_string()).collect(), values);
        let proj = PrincipalPlaneProjector::default().project(&emb, "proj.cca").unwrap();
        assert_eq!(proj.values.dim(), (50, 2));
        assert_eq!(proj.name, "proj.cca");
        assert_eq!(proj.method, "cca");
        // first axis follows the dominant direction
        let span = proj.values[(49, 0)] - proj.values[(0, 0)];
        assert_abs_diff_eq!(span.abs(), 49.0, epsilon = 0.5);
    }

    #[test]
    fn test_one_dimensional_input() {
        let emb = Embedding::new("e", "m", vec!["a".into(), "b".into(), "c".into()], array![[0.0], [1.0], [2.0]]);
        let proj = PrincipalPlaneProjector::default().project(&emb, "p").unwrap();
        assert_eq!(proj.values.dim(), (3, 2));
        assert!(proj.values.column(1).iter().all(|&v| v == 0.0));
    }
}

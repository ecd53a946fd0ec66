//! Anchors found directly in the shared PCA space.

use super::anchors::{anchor_integrate, AnchorParams};
use super::{IntegrationInput, IntegrationMethod, MethodName};
use crate::nn::mutual_nearest_neighbors;
use anyhow::Error;
use ndarray::Axis;
use scflow_types::Embedding;

pub struct JointPca {
    params: AnchorParams,
}

impl JointPca {
    pub fn new(params: AnchorParams) -> JointPca {
        JointPca { params }
    }
}

impl IntegrationMethod for JointPca {
    fn name(&self) -> MethodName {
        MethodName::JointPca
    }

    fn integrate(&self, input: &IntegrationInput, base: &Embedding) -> Result<Embedding, Error> {
        anchor_integrate(input, base, self.name(), &self.params, |reference, query| {
            let r = base.values.select(Axis(0), reference);
            let q = base.values.select(Axis(0), query);
            Ok(mutual_nearest_neighbors(&r.view(), &q.view(), self.params.k_anchor))
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::integration::test::shifted_input;

    #[test]
    fn test_jointpca_keeps_shape_and_reference() {
        let (input, base) = shifted_input();
        let out = JointPca::new(AnchorParams::default()).integrate(&input, &base).unwrap();
        assert_eq!(out.name, "integrated.jointpca");
        assert_eq!(out.values.dim(), base.values.dim());
        assert_eq!(out.cell_ids, base.cell_ids);
        for &c in input.batches.get_indices("a").unwrap() {
            assert_eq!(out.values.row(c), base.values.row(c));
        }
    }
}

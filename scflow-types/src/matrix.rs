use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use sprs::CsMat;

/// Gene x cell UMI counts, compressed by column so each cell is one sparse vector.
pub type CountMat = CsMat<u32>;

/// Count matrix together with its row (feature) and column (barcode) labels.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeatureBarcodeMatrix {
    pub name: String,
    pub barcodes: Vec<String>,
    pub feature_ids: Vec<String>,
    pub feature_names: Vec<String>,
    #[serde(with = "csc_serde")]
    pub matrix: CountMat,
}

impl FeatureBarcodeMatrix {
    /// Build a matrix, checking that the labels match the matrix shape.
    pub fn new(
        name: impl Into<String>,
        barcodes: Vec<String>,
        feature_ids: Vec<String>,
        feature_names: Vec<String>,
        matrix: CountMat,
    ) -> Result<Self, PipelineError> {
        let name = name.into();
        let matrix = if matrix.is_csc() { matrix } else { matrix.to_csc() };
        if feature_ids.len() != matrix.rows() {
            return Err(PipelineError::dims(
                format!("{name}: feature ids vs matrix rows"),
                matrix.rows(),
                feature_ids.len(),
            ));
        }
        if feature_names.len() != matrix.rows() {
            return Err(PipelineError::dims(
                format!("{name}: feature names vs matrix rows"),
                matrix.rows(),
                feature_names.len(),
            ));
        }
        if barcodes.len() != matrix.cols() {
            return Err(PipelineError::dims(
                format!("{name}: barcodes vs matrix columns"),
                matrix.cols(),
                barcodes.len(),
            ));
        }
        Ok(FeatureBarcodeMatrix {
            name,
            barcodes,
            feature_ids,
            feature_names,
            matrix,
        })
    }

    /// Number of features (rows).
    pub fn num_features(&self) -> usize {
        self.matrix.rows()
    }

    /// Number of barcodes (columns).
    pub fn num_barcodes(&self) -> usize {
        self.matrix.cols()
    }

    pub fn nnz(&self) -> usize {
        self.matrix.nnz()
    }

    /// Iterate the non-zero `(feature, count)` entries of cell `col`.
    pub fn column(&self, col: usize) -> impl Iterator<Item = (usize, u32)> + '_ {
        self.matrix
            .outer_view(col)
            .map(|v| v.iter().map(|(r, &c)| (r, c)).collect::<Vec<_>>())
            .unwrap_or_default()
            .into_iter()
    }

    /// Total counts per cell.
    pub fn barcode_sums(&self) -> Vec<u64> {
        self.matrix
            .outer_iterator()
            .map(|col| col.iter().map(|(_, &v)| v as u64).sum())
            .collect()
    }

    /// Number of cells in which each feature has a non-zero count.
    pub fn feature_detection(&self) -> Vec<u32> {
        let mut detected = vec![0u32; self.num_features()];
        for col in self.matrix.outer_iterator() {
            for (r, &v) in col.iter() {
                if v > 0 {
                    detected[r] += 1;
                }
            }
        }
        detected
    }

    /// Keep only the given barcodes, in the given order.
    pub fn select_barcodes(&self, cols: &[usize]) -> FeatureBarcodeMatrix {
        let columns = cols
            .iter()
            .map(|&c| self.column(c).collect::<Vec<_>>())
            .collect::<Vec<_>>();
        FeatureBarcodeMatrix {
            name: self.name.clone(),
            barcodes: cols.iter().map(|&c| self.barcodes[c].clone()).collect(),
            feature_ids: self.feature_ids.clone(),
            feature_names: self.feature_names.clone(),
            matrix: csc_from_columns(self.num_features(), columns),
        }
    }

    /// Keep only the given features, in the given order.
    pub fn select_features(&self, rows: &[usize]) -> FeatureBarcodeMatrix {
        let mut remap = vec![usize::MAX; self.num_features()];
        for (new, &old) in rows.iter().enumerate() {
            remap[old] = new;
        }
        let columns = self
            .matrix
            .outer_iterator()
            .map(|col| {
                col.iter()
                    .filter(|(r, _)| remap[*r] != usize::MAX)
                    .map(|(r, &v)| (remap[r], v))
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        FeatureBarcodeMatrix {
            name: self.name.clone(),
            barcodes: self.barcodes.clone(),
            feature_ids: rows.iter().map(|&r| self.feature_ids[r].clone()).collect(),
            feature_names: rows.iter().map(|&r| self.feature_names[r].clone()).collect(),
            matrix: csc_from_columns(rows.len(), columns),
        }
    }

    /// Dense copy of one feature row, indexed by barcode.
    pub fn feature_row(&self, row: usize) -> Vec<u32> {
        let mut out = vec![0u32; self.num_barcodes()];
        for (c, col) in self.matrix.outer_iterator().enumerate() {
            for (r, &v) in col.iter() {
                if r == row {
                    out[c] = v;
                }
            }
        }
        out
    }
}

/// Build a CSC matrix from per-column `(row, value)` lists. Entries are sorted
/// by row, zero values dropped, and duplicate rows summed.
pub fn csc_from_columns(rows: usize, columns: Vec<Vec<(usize, u32)>>) -> CountMat {
    let cols = columns.len();
    let mut indptr = Vec::with_capacity(cols + 1);
    let mut indices = Vec::new();
    let mut data = Vec::new();
    indptr.push(0);
    for mut col in columns {
        col.sort_unstable_by_key(|&(r, _)| r);
        let start = indices.len();
        for (r, v) in col {
            assert!(r < rows, "row index {r} out of bounds for {rows} rows");
            if v == 0 {
                continue;
            }
            if indices.len() > start && indices[indices.len() - 1] == r {
                let last = data.len() - 1;
                data[last] += v;
            } else {
                indices.push(r);
                data.push(v);
            }
        }
        indptr.push(indices.len());
    }
    CsMat::new_csc((rows, cols), indptr, indices, data)
}

mod csc_serde {
    use super::{csc_from_columns, CountMat};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct RawCsc {
        rows: usize,
        cols: usize,
        indptr: Vec<usize>,
        indices: Vec<usize>,
        data: Vec<u32>,
    }

    pub fn serialize<S: Serializer>(m: &CountMat, s: S) -> Result<S::Ok, S::Error> {
        let mut raw = RawCsc {
            rows: m.rows(),
            cols: m.cols(),
            indptr: Vec::with_capacity(m.cols() + 1),
            indices: Vec::with_capacity(m.nnz()),
            data: Vec::with_capacity(m.nnz()),
        };
        raw.indptr.push(0);
        for col in m.outer_iterator() {
            for (r, &v) in col.iter() {
                raw.indices.push(r);
                raw.data.push(v);
            }
            raw.indptr.push(raw.indices.len());
        }
        raw.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<CountMat, D::Error> {
        let raw = RawCsc::deserialize(d)?;
        if raw.indptr.len() != raw.cols + 1 || raw.indices.len() != raw.data.len() {
            return Err(D::Error::custom("inconsistent compressed column layout"));
        }
        if raw.indptr.last() != Some(&raw.indices.len()) || raw.indptr.windows(2).any(|w| w[0] > w[1]) {
            return Err(D::Error::custom("column pointers are not monotone"));
        }
        if raw.indices.iter().any(|&r| r >= raw.rows) {
            return Err(D::Error::custom("row index out of bounds"));
        }
        let columns = raw
            .indptr
            .windows(2)
            .map(|w| (w[0]..w[1]).map(|i| (raw.indices[i], raw.data[i])).collect())
            .collect();
        Ok(csc_from_columns(raw.rows, columns))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn small() -> FeatureBarcodeMatrix {
        // genes x cells
        // g0: 1 0 3
        // g1: 0 2 0
        // g2: 5 0 0
        let m = csc_from_columns(3, vec![vec![(0, 1), (2, 5)], vec![(1, 2)], vec![(0, 3)]]);
        FeatureBarcodeMatrix::new(
            "small",
            vec!["a".into(), "b".into(), "c".into()],
            vec!["E0".into(), "E1".into(), "E2".into()],
            vec!["G0".into(), "G1".into(), "G2".into()],
            m,
        )
        .unwrap()
    }

    #[test]
    fn test_sums_and_detection() {
        let m = small();
        assert_eq!(m.barcode_sums(), vec![6, 2, 3]);
        assert_eq!(m.feature_detection(), vec![2, 1, 1]);
        assert_eq!(m.feature_row(0), vec![1, 0, 3]);
    }

    #[test]
    fn test_select() {
        let m = small();
        let s = m.select_barcodes(&[2, 0]);
        assert_eq!(s.barcodes, vec!["c", "a"]);
        assert_eq!(s.barcode_sums(), vec![3, 6]);

        let f = m.select_features(&[2, 0]);
        assert_eq!(f.feature_names, vec!["G2", "G0"]);
        assert_eq!(f.column(0).collect::<Vec<_>>(), vec![(0, 5), (1, 1)]);
        assert_eq!(f.column(1).count(), 0);
    }

    #[test]
    fn test_shape_checked() {
        let m = csc_from_columns(2, vec![vec![(0, 1)]]);
        let err = FeatureBarcodeMatrix::new("x", vec![], vec!["a".into(), "b".into()], vec!["a".into(), "b".into()], m)
            .unwrap_err();
        assert!(matches!(err, PipelineError::DimensionMismatch { expected: 1, found: 0, .. }));
    }

    #[test]
    fn test_duplicate_rows_summed() {
        let m = csc_from_columns(2, vec![vec![(1, 2), (0, 0), (1, 3)]]);
        assert_eq!(m.nnz(), 1);
        assert_eq!(m.get(1, 0), Some(&5));
    }

    #[test]
    fn test_serde_round_trip() {
        let m = small();
        let bytes = bincode::serialize(&m).unwrap();
        let back: FeatureBarcodeMatrix = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.matrix, m.matrix);
        assert_eq!(back.barcodes, m.barcodes);
    }
}

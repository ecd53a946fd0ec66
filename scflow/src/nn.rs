//! Exact nearest-neighbour search over a vantage-point tree, and
//! shared-nearest-neighbour graphs.

use fxhash::FxHashMap;
use log::info;
use ndarray::parallel::prelude::*;
use ndarray::{Array2, ArrayBase, ArrayView2, Axis, Data, Ix2};
use noisy_float::types::{n64, N64};
use num_traits::Bounded;
use vpsearch::{BestCandidate, MetricSpace, Tree};

/// k nearest neighbours of each query row, nearest first.
#[derive(Debug, Clone)]
pub struct Neighbors {
    /// query x k indices into the reference rows
    pub indices: Array2<usize>,
    /// query x k Euclidean distances
    pub distances: Array2<f64>,
}

impl Neighbors {
    /// Number of neighbours per query.
    pub fn k(&self) -> usize {
        self.indices.ncols()
    }

    fn empty(rows: usize, k: usize) -> Neighbors {
        Neighbors {
            indices: Array2::zeros((rows, k)),
            distances: Array2::zeros((rows, k)),
        }
    }
}

/// One row of an embedding.
#[derive(Clone, Copy, Debug)]
struct Point<'a> {
    coords: &'a [f64],
}

impl MetricSpace for Point<'_> {
    type UserData = ();
    type Distance = N64;

    fn distance(&self, other: &Self, _: &()) -> N64 {
        let d2 = self
            .coords
            .iter()
            .zip(other.coords)
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f64>();
        n64(d2.sqrt())
    }
}

/// Rows of a standard-layout matrix as tree points.
fn points<S: Data<Elem = f64>>(m: &ArrayBase<S, Ix2>) -> Vec<Point<'_>> {
    m.rows()
        .into_iter()
        .map(|row| Point {
            coords: row.to_slice().unwrap_or_default(),
        })
        .collect()
}

/// The `k` closest candidates seen during one tree search, kept sorted by
/// `(distance, index)`.
struct Closest {
    k: usize,
    found: Vec<(N64, usize)>,
}

impl Closest {
    fn new(k: usize) -> Closest {
        Closest {
            k,
            found: Vec::with_capacity(k + 1),
        }
    }

    fn clear(&mut self) {
        self.found.clear();
    }
}

impl<'a, 'p> BestCandidate<Point<'p>, ()> for &'a mut Closest {
    type Output = std::iter::Copied<std::slice::Iter<'a, (N64, usize)>>;

    #[inline]
    fn consider(&mut self, _: &Point<'p>, distance: N64, candidate_index: usize, _: &()) {
        if self.k == 0 {
            return;
        }
        let entry = (distance, candidate_index);
        if self.found.len() == self.k && entry >= self.found[self.k - 1] {
            return;
        }
        let pos = self.found.binary_search(&entry).unwrap_or_else(|p| p);
        self.found.insert(pos, entry);
        self.found.truncate(self.k);
    }

    #[inline]
    fn distance(&self) -> N64 {
        if self.found.len() < self.k {
            N64::max_value()
        } else {
            self.found[self.k - 1].0
        }
    }

    fn result(self, _: &()) -> Self::Output {
        self.found.iter().copied()
    }
}

/// For each row of `queries`, find its `k` nearest rows of `reference` by
/// Euclidean distance. `k` is clipped to the number of reference rows.
pub fn knn_query(reference: &ArrayView2<f64>, queries: &ArrayView2<f64>, k: usize) -> Neighbors {
    let k = k.min(reference.nrows());
    let mut nn = Neighbors::empty(queries.nrows(), k);
    if k == 0 {
        return nn;
    }
    let reference = reference.as_standard_layout();
    let queries = queries.as_standard_layout();
    let ref_points = points(&reference);
    let query_points = points(&queries);
    let tree = Tree::new_with_user_data_ref(&ref_points, &());

    nn.indices
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(nn.distances.axis_iter_mut(Axis(0)))
        .enumerate()
        .for_each_init(
            || Closest::new(k),
            |closest, (q, (mut idx, mut dist))| {
                closest.clear();
                for (slot, (d, j)) in tree.find_nearest_custom(&query_points[q], &(), closest).enumerate() {
                    idx[slot] = j;
                    dist[slot] = d.raw();
                }
            },
        );
    nn
}

/// Compute the `k` nearest neighbours of each row in `v`. With `include_self`
/// every row is its own first neighbour.
pub fn knn(v: &ArrayView2<f64>, k: usize, include_self: bool) -> Neighbors {
    let cells = v.nrows();
    let k = k.min(cells);
    let others = if include_self { k.saturating_sub(1) } else { k.min(cells.saturating_sub(1)) };
    let width = if include_self { others + 1 } else { others };
    let mut nn = Neighbors::empty(cells, width);
    if cells == 0 {
        return nn;
    }
    info!("querying {} points for {} neighbors", cells, width);

    let data = v.as_standard_layout();
    let samples = points(&data);
    let tree = Tree::new_with_user_data_ref(&samples, &());

    nn.indices
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(nn.distances.axis_iter_mut(Axis(0)))
        .enumerate()
        .for_each_init(
            // one extra, the cell finds itself
            || Closest::new(others + 1),
            |closest, (cell, (mut idx, mut dist))| {
                let mut slot = 0;
                if include_self {
                    idx[0] = cell;
                    dist[0] = 0.0;
                    slot = 1;
                }
                closest.clear();
                for (d, j) in tree.find_nearest_custom(&samples[cell], &(), closest) {
                    if j != cell && slot < width {
                        idx[slot] = j;
                        dist[slot] = d.raw();
                        slot += 1;
                    }
                }
            },
        );
    nn
}

/// Pairs `(i, j)` where row `j` of `b` is among the `k` nearest of row `i` of
/// `a` and vice versa. Sorted by `(i, j)`.
pub fn mutual_nearest_neighbors(a: &ArrayView2<f64>, b: &ArrayView2<f64>, k: usize) -> Vec<(usize, usize)> {
    let a_to_b = knn_query(b, a, k);
    let b_to_a = knn_query(a, b, k);
    let mut pairs = Vec::new();
    for (i, row) in a_to_b.indices.axis_iter(Axis(0)).enumerate() {
        for &j in row.iter() {
            if b_to_a.indices.row(j).iter().any(|&x| x == i) {
                pairs.push((i, j));
            }
        }
    }
    pairs.sort_unstable();
    pairs
}

/// Shared-nearest-neighbour graph from a kNN table (self included). Two cells
/// are linked with the Jaccard index of their neighbour sets; links below
/// `prune` are dropped. Each undirected edge is reported once with `i < j`.
pub fn shared_nn_graph(indices: &Array2<usize>, prune: f64) -> Vec<(usize, usize, f64)> {
    let n = indices.nrows();
    let k = indices.ncols() as f64;

    // cells that list `m` as a neighbour
    let mut listed_by = vec![Vec::new(); n];
    for (i, row) in indices.axis_iter(Axis(0)).enumerate() {
        for &m in row.iter() {
            listed_by[m].push(i);
        }
    }

    let per_cell = (0..n)
        .into_par_iter()
        .map(|i| {
            let mut shared: FxHashMap<usize, usize> = FxHashMap::default();
            for &m in indices.row(i).iter() {
                for &j in &listed_by[m] {
                    if j > i {
                        *shared.entry(j).or_insert(0) += 1;
                    }
                }
            }
            let mut edges = shared
                .into_iter()
                .filter_map(|(j, s)| {
                    let s = s as f64;
                    let jaccard = s / (2.0 * k - s);
                    (jaccard >= prune).then_some((i, j, jaccard))
                })
                .collect::<Vec<_>>();
            edges.sort_unstable_by_key(|e| e.1);
            edges
        })
        .collect::<Vec<_>>();
    per_cell.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, s};
    use ndarray_rand::RandomExt;
    use rand::SeedableRng;
    use rand_distr::Normal;
    use rand_pcg::Pcg64Mcg;

    fn sq_dist(a: ndarray::ArrayView1<f64>, b: ndarray::ArrayView1<f64>) -> f64 {
        a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
    }

    // Basic n^2 knn algorithm, for testing purposes
    fn exhaustive_knn(v: &ArrayView2<f64>, k: usize) -> Array2<usize> {
        let cells = v.nrows();
        let mut output = Array2::zeros((cells, k));
        for cell in 0..cells {
            let mut nns = (0..cells)
                .filter(|&o| o != cell)
                .map(|o| (sq_dist(v.row(cell), v.row(o)), o))
                .collect::<Vec<_>>();
            nns.sort_by(|a, b| a.partial_cmp(b).unwrap());
            for i in 0..k {
                output[(cell, i)] = nns[i].1;
            }
        }
        output
    }

    #[test]
    fn test_knn() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        for ncells in [5, 50, 100] {
            for d in [1, 3, 10] {
                let v = Array2::<f64>::random_using((ncells, d), Normal::new(0.0, 1.0).unwrap(), &mut rng);
                let full = exhaustive_knn(&v.view(), ncells - 1);
                for k in [1, 4] {
                    let fast = knn(&v.view(), k, false);
                    assert_eq!(fast.indices, full.slice(s![.., ..k]).to_owned());
                    let with_self = knn(&v.view(), k + 1, true);
                    assert_eq!(with_self.indices.column(0).to_vec(), (0..ncells).collect::<Vec<_>>());
                    assert_eq!(with_self.indices.slice(s![.., 1..]).to_owned(), fast.indices);
                }
            }
        }
    }

    #[test]
    fn test_knn_clips_k() {
        let v = array![[0.0], [1.0], [3.0]];
        let nn = knn(&v.view(), 10, true);
        assert_eq!(nn.indices, array![[0, 1, 2], [1, 0, 2], [2, 1, 0]]);
        assert_eq!(nn.distances[(2, 2)], 3.0);
    }

    #[test]
    fn test_knn_query_matches_exhaustive() {
        let mut rng = Pcg64Mcg::seed_from_u64(5);
        let reference = Array2::<f64>::random_using((80, 4), Normal::new(0.0, 1.0).unwrap(), &mut rng);
        // column-major queries exercise the layout conversion
        let queries = Array2::<f64>::random_using((4, 30), Normal::new(0.0, 1.0).unwrap(), &mut rng).reversed_axes();
        let nn = knn_query(&reference.view(), &queries.view(), 6);
        for (q, row) in queries.axis_iter(Axis(0)).enumerate() {
            let mut all = (0..80).map(|j| (sq_dist(row, reference.row(j)), j)).collect::<Vec<_>>();
            all.sort_by(|a, b| a.partial_cmp(b).unwrap());
            let expected = all.iter().take(6).map(|&(_, j)| j).collect::<Vec<_>>();
            assert_eq!(nn.indices.row(q).to_vec(), expected);
            assert!((nn.distances[(q, 0)] - all[0].0.sqrt()).abs() < 1e-12);
        }
        assert_eq!(knn_query(&reference.slice(s![..0, ..]), &queries.view(), 3).k(), 0);
    }

    #[test]
    fn test_knn_duplicate_points() {
        let v = array![[1.0, 1.0], [1.0, 1.0], [1.0, 1.0], [5.0, 5.0]];
        let nn = knn(&v.view(), 3, true);
        for cell in 0..3 {
            assert_eq!(nn.indices[(cell, 0)], cell);
            let mut rest = nn.indices.row(cell).slice(s![1..]).to_vec();
            rest.sort_unstable();
            let expected = (0..3).filter(|&c| c != cell).collect::<Vec<_>>();
            assert_eq!(rest, expected);
        }
        assert_eq!(nn.indices[(3, 0)], 3);
    }

    #[test]
    fn test_mutual_nearest_neighbors() {
        let a = array![[0.0], [10.0]];
        let b = array![[0.5], [9.0], [100.0]];
        assert_eq!(mutual_nearest_neighbors(&a.view(), &b.view(), 1), vec![(0, 0), (1, 1)]);
    }

    #[test]
    fn test_shared_nn_graph() {
        // two tight pairs far apart
        let v = array![[0.0], [0.1], [10.0], [10.1]];
        let nn = knn(&v.view(), 2, true);
        let edges = shared_nn_graph(&nn.indices, 1.0 / 15.0);
        assert_eq!(edges, vec![(0, 1, 1.0), (2, 3, 1.0)]);
    }
}

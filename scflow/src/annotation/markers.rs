//! Marker genes conserved across experimental groups.

use anyhow::{Context, Error};
use diff_exp::dist::minimump;
use diff_exp::{wilcoxon_differential_expression, DiffExpParams};
use fxhash::FxHashMap;
use log::{info, warn};
use scflow_types::{ClusterAssignment, Dataset, PipelineError};
use serde::{Deserialize, Serialize};
use sprs::CsMat;

/// Settings for conserved-marker discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerParams {
    /// cell field that defines the experimental groups
    pub group_by: String,
    /// minimum cells on each side of a within-group comparison
    pub min_cells: usize,
    /// required `pct_1 - pct_2` in every group when filtering
    pub margin: f64,
    pub test: DiffExpParams,
}

impl Default for MarkerParams {
    fn default() -> Self {
        MarkerParams {
            group_by: "group".to_string(),
            min_cells: 3,
            margin: 0.5,
            test: DiffExpParams::default(),
        }
    }
}

/// Test statistics of one gene within one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMarkerStats {
    pub group: String,
    /// detection rate in the cluster
    pub pct_1: f64,
    /// detection rate in the rest of the group
    pub pct_2: f64,
    pub avg_log2fc: f64,
    pub p_val: f64,
    pub p_val_adj: f64,
}

/// A gene that marks `cluster` in every tested group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConservedMarker {
    pub cluster: u16,
    pub gene: String,
    pub per_group: Vec<GroupMarkerStats>,
    pub max_pval: f64,
    pub minimump_p_val: f64,
}

impl ConservedMarker {
    /// True when the detection difference exceeds `margin` in every group.
    pub fn passes_margin(&self, margin: f64) -> bool {
        !self.per_group.is_empty() && self.per_group.iter().all(|g| g.pct_1 - g.pct_2 > margin)
    }
}

/// For every cluster of `clusters`, test the cluster against the other cells
/// of each group separately and keep genes tested in all groups.
///
/// `lognorm` is genes x cells log-normalized expression in CSR layout. Groups
/// with fewer than `min_cells` cells on either side are skipped with a warning;
/// a cluster with no testable group yields no markers. Markers come out
/// ordered by cluster, then combined p-value, then gene name.
pub fn find_conserved_markers(
    dataset: &Dataset,
    lognorm: &CsMat<f64>,
    clusters: &ClusterAssignment,
    params: &MarkerParams,
) -> Result<Vec<ConservedMarker>, Error> {
    if clusters.labels.len() != dataset.num_cells() {
        return Err(PipelineError::dims(
            format!("cluster labels {}", clusters.key()),
            dataset.num_cells(),
            clusters.labels.len(),
        )
        .into());
    }
    let groups = dataset.group_by(&params.group_by)?;
    let genes = &dataset.counts.feature_names;
    let mut markers = Vec::new();

    for cluster in 0..clusters.num_clusters() as u16 {
        let mut per_gene: FxHashMap<usize, Vec<GroupMarkerStats>> = FxHashMap::default();
        let mut tested_groups = 0;
        for (group, cells) in groups.iter() {
            let (inside, outside): (Vec<usize>, Vec<usize>) =
                cells.iter().copied().partition(|&c| clusters.labels[c] == cluster);
            if inside.len() < params.min_cells || outside.len() < params.min_cells {
                warn!(
                    "cluster {} in group {}: {} vs {} cells, skipping group",
                    cluster,
                    group,
                    inside.len(),
                    outside.len()
                );
                continue;
            }
            tested_groups += 1;
            let res = wilcoxon_differential_expression(lognorm.view(), &inside, &outside, &params.test)
                .with_context(|| format!("cluster {cluster}, group {group}"))?;
            for g in 0..genes.len() {
                if !res.genes_tested[g] {
                    continue;
                }
                per_gene.entry(g).or_default().push(GroupMarkerStats {
                    group: group.to_string(),
                    pct_1: res.pct_in[g],
                    pct_2: res.pct_out[g],
                    avg_log2fc: res.log2_fold_change[g],
                    p_val: res.p_values[g],
                    p_val_adj: res.adjusted_p_values[g],
                });
            }
        }
        if tested_groups == 0 {
            continue;
        }

        let mut found = per_gene
            .into_iter()
            .filter(|(_, stats)| stats.len() == tested_groups)
            .map(|(g, per_group)| {
                let pvals = per_group.iter().map(|s| s.p_val).collect::<Vec<_>>();
                ConservedMarker {
                    cluster,
                    gene: genes[g].clone(),
                    max_pval: pvals.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
                    minimump_p_val: minimump(&pvals),
                    per_group,
                }
            })
            .collect::<Vec<_>>();
        found.sort_by(|a, b| {
            a.minimump_p_val
                .total_cmp(&b.minimump_p_val)
                .then_with(|| a.gene.cmp(&b.gene))
        });
        info!("cluster {}: {} conserved markers", cluster, found.len());
        markers.extend(found);
    }
    Ok(markers)
}

/// Keep markers whose detection difference exceeds `margin` in every group.
pub fn filter_markers(markers: &[ConservedMarker], margin: f64) -> Vec<ConservedMarker> {
    markers.iter().filter(|m| m.passes_margin(margin)).cloned().collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::normalization::{normalize, Normalization};
    use scflow_types::matrix::csc_from_columns;
    use scflow_types::{CellRecord, FeatureBarcodeMatrix};

    /// 2 groups x 20 cells. Cluster 0 = first 10 cells of each group; gene 0
    /// is on only in cluster 0, gene 1 everywhere, gene 2 on in cluster 0 of
    /// group "ctrl" only.
    fn two_group_dataset() -> (Dataset, ClusterAssignment) {
        let mut columns = Vec::new();
        let mut cells = Vec::new();
        let mut labels = Vec::new();
        for group in ["ctrl", "stim"] {
            for c in 0..20 {
                let in_cluster = c < 10;
                let mut col = vec![(1, 3 + (c % 4) as u32), (3, 20)];
                if in_cluster {
                    col.push((0, 5 + (c % 3) as u32));
                    if group == "ctrl" {
                        col.push((2, 4));
                    }
                }
                col.sort_unstable();
                columns.push(col);
                let id = format!("{group}_{c}");
                cells.push(CellRecord::new(id.clone(), id, group.into(), group.into()));
                labels.push(u16::from(!in_cluster));
            }
        }
        let fbm = FeatureBarcodeMatrix::new(
            "t",
            cells.iter().map(|c| c.cell_id.clone()).collect(),
            (0..4).map(|g| format!("ENSG{g}")).collect(),
            vec!["MARK".into(), "HOUSE".into(), "CTRLONLY".into(), "FILL".into()],
            csc_from_columns(4, columns),
        )
        .unwrap();
        let ds = Dataset::new(fbm, cells).unwrap();
        let clusters = ClusterAssignment {
            embedding: "integrated.cca".into(),
            resolution: 0.5,
            labels,
            modularity: 0.4,
        };
        (ds, clusters)
    }

    #[test]
    fn test_conserved_marker_found_in_both_groups() {
        let (ds, clusters) = two_group_dataset();
        let lognorm = normalize(&ds.counts, Normalization::SeuratLog).to_csr();
        let markers = find_conserved_markers(&ds, &lognorm, &clusters, &MarkerParams::default()).unwrap();
        let mark = markers.iter().find(|m| m.cluster == 0 && m.gene == "MARK").unwrap();
        assert_eq!(mark.per_group.len(), 2);
        assert!(mark.per_group.iter().all(|g| g.pct_1 == 1.0 && g.pct_2 == 0.0));
        let min_p = mark.per_group.iter().map(|g| g.p_val).fold(f64::INFINITY, f64::min);
        let m = mark.per_group.len() as f64;
        assert!(mark.minimump_p_val >= min_p);
        assert!(mark.minimump_p_val <= m * min_p);
        // only detected in one group: not conserved
        assert!(!markers.iter().any(|m| m.gene == "CTRLONLY"));
    }

    #[test]
    fn test_filter_markers_margin() {
        let (ds, clusters) = two_group_dataset();
        let lognorm = normalize(&ds.counts, Normalization::SeuratLog).to_csr();
        let markers = find_conserved_markers(&ds, &lognorm, &clusters, &MarkerParams::default()).unwrap();
        let kept = filter_markers(&markers, 0.5);
        assert!(kept.iter().any(|m| m.gene == "MARK" && m.cluster == 0));
        assert!(kept.iter().all(|m| m.passes_margin(0.5)));
        assert!(!kept.iter().any(|m| m.gene == "HOUSE"));
    }

    #[test]
    fn test_small_groups_are_skipped() {
        let (ds, clusters) = two_group_dataset();
        let lognorm = normalize(&ds.counts, Normalization::SeuratLog).to_csr();
        let params = MarkerParams {
            min_cells: 11,
            ..Default::default()
        };
        let markers = find_conserved_markers(&ds, &lognorm, &clusters, &params).unwrap();
        assert!(markers.is_empty());
    }

    #[test]
    fn test_passes_margin_requires_every_group() {
        let stats = |p1, p2| GroupMarkerStats {
            group: "g".into(),
            pct_1: p1,
            pct_2: p2,
            avg_log2fc: 1.0,
            p_val: 0.01,
            p_val_adj: 0.02,
        };
        let m = ConservedMarker {
            cluster: 0,
            gene: "X".into(),
            per_group: vec![stats(0.9, 0.1), stats(0.6, 0.3)],
            max_pval: 0.01,
            minimump_p_val: 0.02,
        };
        assert!(!m.passes_margin(0.5));
        assert!(m.passes_margin(0.25));
    }
}

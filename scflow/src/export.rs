//! Tabular exports of stage results: CSV via `csv`, the QC report as JSON.

use crate::annotation::{AnnotatedDataset, ConservedMarker, LabelPrediction};
use crate::integration::MixingSummary;
use crate::qc::QcReport;
use anyhow::{Context, Error};
use log::info;
use scflow_types::{Dataset, Embedding};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

fn writer(path: &Path) -> Result<csv::Writer<BufWriter<File>>, Error> {
    let file = File::create(path).with_context(|| path.display().to_string())?;
    Ok(csv::Writer::from_writer(BufWriter::new(file)))
}

fn opt<T: ToString>(v: Option<T>) -> String {
    v.map(|x| x.to_string()).unwrap_or_default()
}

/// One row per cell: metadata, QC metrics, doublet call and every clustering.
pub fn write_cells(path: &Path, dataset: &Dataset) -> Result<(), Error> {
    let mut w = writer(path)?;
    let mut header = vec![
        "cell_id",
        "barcode",
        "sample_id",
        "group",
        "library_size",
        "detected_genes",
        "percent_mt",
        "doublet_class",
        "doublet_score",
    ];
    header.extend(dataset.clusters.keys().map(String::as_str));
    w.write_record(&header)?;

    for (j, cell) in dataset.cells.iter().enumerate() {
        let mut row = vec![
            cell.cell_id.clone(),
            cell.barcode.clone(),
            cell.sample_id.clone(),
            cell.group.clone(),
            opt(cell.qc.map(|m| m.library_size)),
            opt(cell.qc.map(|m| m.detected_genes)),
            opt(cell.qc.and_then(|m| m.percent_mt(&cell.cell_id).ok())),
            opt(cell.doublet.map(|d| d.class)),
            opt(cell.doublet.map(|d| d.score)),
        ];
        row.extend(dataset.clusters.values().map(|c| c.labels[j].to_string()));
        w.write_record(&row)?;
    }
    w.flush()?;
    Ok(())
}

/// `cell_id` followed by one column per embedding dimension.
pub fn write_embedding(path: &Path, embedding: &Embedding) -> Result<(), Error> {
    let mut w = writer(path)?;
    let mut header = vec!["cell_id".to_string()];
    header.extend((1..=embedding.dims()).map(|d| format!("{}_{}", embedding.name, d)));
    w.write_record(&header)?;
    for (id, row) in embedding.cell_ids.iter().zip(embedding.values.rows()) {
        let mut rec = vec![id.clone()];
        rec.extend(row.iter().map(|v| v.to_string()));
        w.write_record(&rec)?;
    }
    w.flush()?;
    Ok(())
}

/// Long format: one row per (cluster, gene, group).
pub fn write_markers(path: &Path, markers: &[ConservedMarker]) -> Result<(), Error> {
    let mut w = writer(path)?;
    w.write_record([
        "cluster",
        "gene",
        "group",
        "pct_1",
        "pct_2",
        "avg_log2fc",
        "p_val",
        "p_val_adj",
        "max_pval",
        "minimump_p_val",
    ])?;
    for m in markers {
        for g in &m.per_group {
            w.write_record([
                m.cluster.to_string(),
                m.gene.clone(),
                g.group.clone(),
                g.pct_1.to_string(),
                g.pct_2.to_string(),
                g.avg_log2fc.to_string(),
                g.p_val.to_string(),
                g.p_val_adj.to_string(),
                m.max_pval.to_string(),
                m.minimump_p_val.to_string(),
            ])?;
        }
    }
    w.flush()?;
    Ok(())
}

pub fn write_predictions(path: &Path, predictions: &[LabelPrediction]) -> Result<(), Error> {
    let mut w = writer(path)?;
    for p in predictions {
        w.serialize(p)?;
    }
    w.flush()?;
    Ok(())
}

pub fn write_mixing(path: &Path, mixing: &[MixingSummary]) -> Result<(), Error> {
    let mut w = writer(path)?;
    for m in mixing {
        w.serialize(m)?;
    }
    w.flush()?;
    Ok(())
}

pub fn write_qc_report(path: &Path, report: &QcReport) -> Result<(), Error> {
    let file = File::create(path).with_context(|| path.display().to_string())?;
    serde_json::to_writer_pretty(BufWriter::new(file), report)?;
    Ok(())
}

/// Write `cells.csv` and one `embedding_<name>.csv` per embedding. Returns the
/// files written.
pub fn export_dataset(dir: &Path, dataset: &Dataset) -> Result<Vec<PathBuf>, Error> {
    std::fs::create_dir_all(dir).with_context(|| dir.display().to_string())?;
    let mut written = vec![dir.join("cells.csv")];
    write_cells(&written[0], dataset)?;
    for (name, emb) in &dataset.embeddings {
        let path = dir.join(format!("embedding_{}.csv", name.replace('.', "_")));
        write_embedding(&path, emb)?;
        written.push(path);
    }
    info!("exported {} tables to {}", written.len(), dir.display());
    Ok(written)
}

/// Everything [`export_dataset`] writes plus the marker and prediction tables.
pub fn export_annotated(dir: &Path, annotated: &AnnotatedDataset) -> Result<Vec<PathBuf>, Error> {
    let mut written = export_dataset(dir, &annotated.dataset)?;
    let conserved = dir.join("conserved_markers.csv");
    write_markers(&conserved, &annotated.conserved_markers)?;
    let filtered = dir.join("markers.csv");
    write_markers(&filtered, &annotated.filtered_markers)?;
    written.extend([conserved, filtered]);
    if !annotated.predictions.is_empty() {
        let path = dir.join("predictions.csv");
        write_predictions(&path, &annotated.predictions)?;
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::doublets::test::synthetic;
    use ndarray::array;
    use scflow_types::ClusterAssignment;

    #[test]
    fn test_cells_and_embedding_tables() {
        let dir = tempfile::tempdir().unwrap();
        let ds = synthetic(&[("a", "ctrl", 2), ("b", "stim", 1)], 4, 2, 0);
        let ids = ds.cell_ids();
        let ds = ds
            .with_embedding(Embedding::new("proj.cca", "cca", ids, array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.5]]))
            .unwrap()
            .with_clusters(ClusterAssignment {
                embedding: "proj.cca".into(),
                resolution: 0.5,
                labels: vec![0, 1, 0],
                modularity: 0.1,
            })
            .unwrap();
        let files = export_dataset(dir.path(), &ds).unwrap();
        assert_eq!(files.len(), 2);

        let cells = std::fs::read_to_string(dir.path().join("cells.csv")).unwrap();
        let mut lines = cells.lines();
        assert!(lines.next().unwrap().ends_with(",doublet_score,proj.cca_res.0.5"));
        assert_eq!(lines.next().unwrap(), "a_c0,c0,a,ctrl,,,,,,0");

        let emb = std::fs::read_to_string(dir.path().join("embedding_proj_cca.csv")).unwrap();
        assert_eq!(emb.lines().collect::<Vec<_>>(), vec!["cell_id,proj.cca_1,proj.cca_2", "a_c0,1,2", "a_c1,3,4", "b_c0,5,6.5"]);
    }

    #[test]
    fn test_predictions_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("predictions.csv");
        let preds = vec![LabelPrediction {
            cell_id: "a_c0".into(),
            predicted_label: "B cell".into(),
            score: 0.75,
        }];
        write_predictions(&path, &preds).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "cell_id,predicted_label,score\na_c0,B cell,0.75\n");
    }
}

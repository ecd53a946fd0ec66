//! Reference atlas loading: a MEX directory whose features carry accession
//! ids, plus `labels.tsv[.gz]` giving one cell-type label per barcode.

use crate::mtx::{load_mex, locate, open_text};
use anyhow::{Context, Error};
use fxhash::FxHashMap;
use log::info;
use scflow_types::{FeatureBarcodeMatrix, LabelClass, PipelineError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A labelled reference: counts plus one label per barcode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceAtlas {
    pub counts: FeatureBarcodeMatrix,
    pub labels: Vec<String>,
}

impl ReferenceAtlas {
    pub fn new(counts: FeatureBarcodeMatrix, labels: Vec<String>) -> Result<ReferenceAtlas, PipelineError> {
        if labels.len() != counts.num_barcodes() {
            return Err(PipelineError::dims(
                format!("{}: labels vs barcodes", counts.name),
                counts.num_barcodes(),
                labels.len(),
            ));
        }
        Ok(ReferenceAtlas { counts, labels })
    }

    /// Reference cells grouped by label.
    pub fn label_class(&self) -> LabelClass {
        LabelClass::from_values(&self.labels)
    }
}

/// Read `barcode<TAB>label` rows. A first row whose barcode column reads
/// `barcode` is a header.
pub fn read_labels(path: &Path) -> Result<FxHashMap<String, String>, Error> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .from_reader(open_text(path)?);
    let mut labels = FxHashMap::default();
    for (i, rec) in rdr.records().enumerate() {
        let rec = rec.with_context(|| path.display().to_string())?;
        if rec.len() < 2 {
            return Err(PipelineError::dims(format!("{} line {}", path.display(), i + 1), 2, rec.len()).into());
        }
        if i == 0 && rec[0].eq_ignore_ascii_case("barcode") {
            continue;
        }
        labels.insert(rec[0].to_string(), rec[1].to_string());
    }
    Ok(labels)
}

/// Load a reference atlas directory.
pub fn load_reference(dir: &Path) -> Result<ReferenceAtlas, Error> {
    let counts = load_mex(dir, "reference")?;
    let labels_path = locate(dir, &["labels.tsv"])?;
    let by_barcode = read_labels(&labels_path)?;

    let labels = counts
        .barcodes
        .iter()
        .map(|bc| by_barcode.get(bc).cloned())
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| {
            let labelled = counts.barcodes.iter().filter(|bc| by_barcode.contains_key(*bc)).count();
            PipelineError::dims(
                format!("{}: labelled reference barcodes", labels_path.display()),
                counts.num_barcodes(),
                labelled,
            )
        })?;
    let atlas = ReferenceAtlas::new(counts, labels)?;
    info!(
        "loaded reference: {} genes, {} cells, {} labels",
        atlas.counts.num_features(),
        atlas.counts.num_barcodes(),
        atlas.label_class().num_labels()
    );
    Ok(atlas)
}

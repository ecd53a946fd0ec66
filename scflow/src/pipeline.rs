//! The orchestrator: runs stages in order and owns their persistence.
//!
//! Each stage is a plain function from one value to the next. `Pipeline`
//! reads the previous stage's snapshot, runs the stage and writes the new
//! snapshot, so any stage can be re-run on its own after fixing its input.

use crate::annotation::{annotate, load_reference, AnchorLabelTransfer, AnnotatedDataset};
use crate::config::PipelineConfig;
use crate::doublets::{DoubletDetector, SimulatedDoubletDetector};
use crate::export::{export_annotated, export_dataset, write_mixing, write_qc_report};
use crate::ingest::ingest;
use crate::integration::{integrate, IntegratedDataset, MethodName};
use crate::partition::{split_by_sample, SamplePartition};
use crate::qc::{quality_control, QcOutcome};
use crate::snapshot::{read_snapshot, write_snapshot, Stage};
use anyhow::{Context, Error};
use log::info;
use scflow_types::Dataset;
use std::path::{Path, PathBuf};

pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Pipeline {
        Pipeline { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn snapshot_path(&self, stage: Stage) -> PathBuf {
        stage.path_in(&self.config.output_dir)
    }

    fn save<T: serde::Serialize>(&self, stage: Stage, value: &T) -> Result<(), Error> {
        write_snapshot(&self.snapshot_path(stage), stage, value)
    }

    fn load<T: serde::de::DeserializeOwned>(&self, stage: Stage) -> Result<T, Error> {
        read_snapshot(&self.snapshot_path(stage), stage)
    }

    /// Load and merge the configured samples.
    pub fn ingest_stage(&self) -> Result<Dataset, Error> {
        self.config.validate_samples()?;
        let merged = ingest(&self.config.samples, &self.config.ingest).context("ingest stage")?;
        self.save(Stage::Merged, &merged)?;
        Ok(merged)
    }

    /// Filter the merged dataset and split it by sample.
    pub fn qc_stage(&self, merged: Dataset) -> Result<Vec<SamplePartition>, Error> {
        let params = &self.config.qc;
        let detector = params
            .doublets
            .enabled
            .then(|| SimulatedDoubletDetector::new(params.doublets.clone()));
        let outcome = quality_control(
            merged,
            params,
            detector.as_ref().map(|d| d as &dyn DoubletDetector),
            self.config.seed,
        )
        .context("qc stage")?;
        self.save(Stage::QcPassed, &outcome)?;
        std::fs::create_dir_all(&self.config.output_dir)?;
        write_qc_report(&self.config.output_dir.join("qc_report.json"), &outcome.report)?;

        let partitions = split_by_sample(&outcome.dataset)?;
        self.save(Stage::QcSplit, &partitions)?;
        Ok(partitions)
    }

    /// Integrate the partitions with every configured method.
    pub fn integrate_stage(&self, partitions: &[SamplePartition]) -> Result<IntegratedDataset, Error> {
        let c = &self.config;
        let integrated = integrate(partitions, &c.integration, &c.clustering, &c.mixing, c.seed).context("integration stage")?;
        self.save(Stage::Integrated, &integrated)?;
        Ok(integrated)
    }

    /// Markers and, with a configured reference, label transfer. `method`
    /// overrides the configured annotation method.
    pub fn annotate_stage(&self, integrated: &IntegratedDataset, method: Option<MethodName>) -> Result<AnnotatedDataset, Error> {
        let mut params = self.config.annotation.clone();
        if method.is_some() {
            params.method = method;
        }
        let reference = match &params.reference {
            Some(r) => Some(load_reference(&r.path).context("reference atlas")?),
            None => None,
        };
        let predictor = AnchorLabelTransfer::new(params.transfer.clone(), self.config.seed);
        let annotated = annotate(integrated, &params, reference.as_ref(), &predictor).context("annotation stage")?;
        self.save(Stage::Annotated, &annotated)?;
        Ok(annotated)
    }

    pub fn run_ingest(&self) -> Result<Dataset, Error> {
        self.ingest_stage()
    }

    pub fn run_qc(&self) -> Result<Vec<SamplePartition>, Error> {
        self.qc_stage(self.load(Stage::Merged)?)
    }

    pub fn run_integrate(&self) -> Result<IntegratedDataset, Error> {
        let partitions: Vec<SamplePartition> = self.load(Stage::QcSplit)?;
        self.integrate_stage(&partitions)
    }

    pub fn run_annotate(&self, method: Option<MethodName>) -> Result<AnnotatedDataset, Error> {
        let integrated: IntegratedDataset = self.load(Stage::Integrated)?;
        self.annotate_stage(&integrated, method)
    }

    /// All four stages, persisting each.
    pub fn run_all(&self) -> Result<AnnotatedDataset, Error> {
        let merged = self.ingest_stage()?;
        let partitions = self.qc_stage(merged)?;
        let integrated = self.integrate_stage(&partitions)?;
        let annotated = self.annotate_stage(&integrated, None)?;
        info!("pipeline finished, results in {}", self.config.output_dir.display());
        Ok(annotated)
    }

    /// Export the tables of a stage's snapshot into `dir` (default
    /// `<output_dir>/export_<stage>`).
    pub fn export(&self, stage: Stage, dir: Option<&Path>) -> Result<Vec<PathBuf>, Error> {
        let dir = dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.output_dir.join(format!("export_{stage}")));
        match stage {
            Stage::Merged => export_dataset(&dir, &self.load::<Dataset>(stage)?),
            Stage::QcPassed => {
                let outcome: QcOutcome = self.load(stage)?;
                let mut files = export_dataset(&dir, &outcome.dataset)?;
                let report = dir.join("qc_report.json");
                write_qc_report(&report, &outcome.report)?;
                files.push(report);
                Ok(files)
            }
            Stage::QcSplit => {
                let partitions: Vec<SamplePartition> = self.load(stage)?;
                let mut files = Vec::new();
                for p in &partitions {
                    files.extend(export_dataset(&dir.join(&p.sample_id), &p.dataset)?);
                }
                Ok(files)
            }
            Stage::Integrated => {
                let integrated: IntegratedDataset = self.load(stage)?;
                let mut files = export_dataset(&dir, &integrated.dataset)?;
                let mixing = dir.join("mixing.csv");
                write_mixing(&mixing, &integrated.mixing)?;
                files.push(mixing);
                Ok(files)
            }
            Stage::Annotated => export_annotated(&dir, &self.load(stage)?),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::doublets::test::synthetic;
    use crate::ingest::SampleSpec;
    use crate::mtx::test::write_mex;

    fn dump_mex(dir: &Path, ds: &Dataset, barcodes: &[String]) {
        let features = ds
            .counts
            .feature_ids
            .iter()
            .zip(&ds.counts.feature_names)
            .map(|(i, n)| (i.as_str(), n.as_str()))
            .collect::<Vec<_>>();
        let barcodes = barcodes.iter().map(String::as_str).collect::<Vec<_>>();
        let mut entries = Vec::new();
        for (c, col) in ds.counts.matrix.outer_iterator().enumerate() {
            for (r, &v) in col.iter() {
                entries.push((r, c, v));
            }
        }
        write_mex(dir, &features, &barcodes, &entries, true);
    }

    fn project(root: &Path) -> PipelineConfig {
        let mut samples = Vec::new();
        for (i, (id, group)) in [("ctrl", "ctrl"), ("stim", "stim")].into_iter().enumerate() {
            let ds = synthetic(&[(id, group, 60)], 40, 3, i as u64);
            let barcodes = (0..60).map(|c| format!("BC{c}-1")).collect::<Vec<_>>();
            dump_mex(&root.join(id), &ds, &barcodes);
            samples.push(SampleSpec {
                id: id.to_string(),
                path: root.join(id),
                group: group.to_string(),
            });
        }

        let reference = synthetic(&[("ref", "ref", 60)], 40, 3, 9);
        let ref_dir = root.join("reference");
        let barcodes = (0..60).map(|c| format!("R{c}")).collect::<Vec<_>>();
        dump_mex(&ref_dir, &reference, &barcodes);
        let labels = barcodes
            .iter()
            .enumerate()
            .map(|(c, b)| format!("{b}\ttype{}\n", c % 3))
            .collect::<String>();
        std::fs::write(ref_dir.join("labels.tsv"), labels).unwrap();

        let text = format!(
            r#"
            output_dir = "{out}"
            seed = 3

            [ingest]
            min_cells = 1
            min_features = 5

            [qc]
            min_library_size = 10
            [qc.doublets]
            enabled = false

            [integration]
            methods = ["harmony", "jointpca"]
            n_features = 40
            n_pcs = 6
            projection_dims = 6

            [annotation]
            method = "jointpca"
            [annotation.transfer]
            n_pcs = 5
            [annotation.reference]
            path = "{reference}"
            "#,
            out = root.join("out").display(),
            reference = ref_dir.display(),
        );
        let mut cfg = PipelineConfig::from_toml_str(&text).unwrap();
        cfg.samples = samples;
        cfg
    }

    #[test]
    fn test_run_all_and_export() {
        let root = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(project(root.path()));
        let annotated = pipeline.run_all().unwrap();
        assert_eq!(annotated.method, MethodName::JointPca);
        assert_eq!(annotated.predictions.len(), annotated.dataset.num_cells());
        assert_eq!(annotated.dataset.num_cells(), 120);
        for stage in Stage::ALL {
            assert!(pipeline.snapshot_path(stage).is_file(), "{stage}");
        }
        assert!(root.path().join("out/qc_report.json").is_file());

        let files = pipeline.export(Stage::Annotated, None).unwrap();
        assert!(files.iter().any(|f| f.ends_with("predictions.csv")));
        assert!(files.iter().any(|f| f.ends_with("embedding_integrated_harmony.csv")));
        let mixing = pipeline.export(Stage::Integrated, Some(&root.path().join("int"))).unwrap();
        assert!(mixing.iter().any(|f| f.ends_with("mixing.csv")));
    }

    #[test]
    fn test_stages_resume_from_snapshots() {
        let root = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(project(root.path()));
        pipeline.run_ingest().unwrap();
        let parts = pipeline.run_qc().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].sample_id, "ctrl");
        let integrated = pipeline.run_integrate().unwrap();
        assert_eq!(integrated.methods, vec![MethodName::Harmony, MethodName::JointPca]);
        let annotated = pipeline.run_annotate(Some(MethodName::Harmony)).unwrap();
        assert_eq!(annotated.method, MethodName::Harmony);
    }

    #[test]
    fn test_stage_without_snapshot_fails() {
        let root = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(project(root.path()));
        let err = pipeline.run_integrate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<scflow_types::PipelineError>(),
            Some(scflow_types::PipelineError::MissingPath { .. })
        ));
    }
}

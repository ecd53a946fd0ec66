//! Pipeline configuration, read from TOML. Every field has a default, so a
//! file only needs the samples and whatever it overrides.

use crate::annotation::AnnotationParams;
use crate::cluster::ClusterParams;
use crate::ingest::{IngestParams, SampleSpec};
use crate::integration::{IntegrationParams, MethodName, MixingParams};
use crate::qc::QcParams;
use anyhow::{Context, Error};
use fxhash::FxHashSet;
use regex::Regex;
use scflow_types::PipelineError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Everything a pipeline run needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// directory receiving snapshots and exports
    pub output_dir: PathBuf,
    /// seed for every randomized step
    pub seed: u64,
    pub samples: Vec<SampleSpec>,
    pub ingest: IngestParams,
    pub qc: QcParams,
    pub integration: IntegrationParams,
    pub clustering: ClusterParams,
    pub mixing: MixingParams,
    pub annotation: AnnotationParams,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            output_dir: PathBuf::from("scflow_out"),
            seed: 42,
            samples: Vec::new(),
            ingest: IngestParams::default(),
            qc: QcParams::default(),
            integration: IntegrationParams::default(),
            clustering: ClusterParams::default(),
            mixing: MixingParams::default(),
            annotation: AnnotationParams::default(),
        }
    }
}

fn check(ok: bool, msg: impl FnOnce() -> String) -> Result<(), PipelineError> {
    if ok {
        Ok(())
    } else {
        Err(PipelineError::InvalidConfig(msg()))
    }
}

impl PipelineConfig {
    /// Parse and validate.
    pub fn from_toml_str(s: &str) -> Result<PipelineConfig, Error> {
        let cfg: PipelineConfig = toml::from_str(s).map_err(|e| PipelineError::InvalidConfig(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a config file. Relative sample and reference
    /// paths are resolved against the file's directory.
    pub fn load(path: &Path) -> Result<PipelineConfig, Error> {
        if !path.is_file() {
            return Err(PipelineError::MissingPath {
                what: "config file".to_string(),
                path: path.to_path_buf(),
            }
            .into());
        }
        let text = std::fs::read_to_string(path).with_context(|| path.display().to_string())?;
        let mut cfg = PipelineConfig::from_toml_str(&text).with_context(|| format!("config {}", path.display()))?;
        if let Some(base) = path.parent() {
            cfg.resolve_paths(base);
        }
        Ok(cfg)
    }

    fn resolve_paths(&mut self, base: &Path) {
        for s in &mut self.samples {
            if s.path.is_relative() {
                s.path = base.join(&s.path);
            }
        }
        if let Some(r) = &mut self.annotation.reference {
            if r.path.is_relative() {
                r.path = base.join(&r.path);
            }
        }
    }

    /// Range checks on every stage's settings. Samples are checked only when
    /// present; [`PipelineConfig::validate_samples`] requires them.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let qc = &self.qc;
        check(qc.max_detected_genes > 0, || "qc.max_detected_genes must be positive".into())?;
        check(qc.max_percent_mt > 0.0 && qc.max_percent_mt <= 100.0, || {
            format!("qc.max_percent_mt must be in (0, 100], got {}", qc.max_percent_mt)
        })?;
        Regex::new(&qc.mt_pattern)
            .map_err(|e| PipelineError::InvalidConfig(format!("qc.mt_pattern: {e}")))?;
        let d = &qc.doublets;
        check(d.rate_per_thousand >= 0.0 && d.max_rate >= 0.0 && d.max_rate < 1.0, || {
            "qc.doublets rates must be non-negative and max_rate below 1".into()
        })?;
        check(d.artificial_fraction > 0.0 && d.k > 0 && d.n_pcs > 0 && d.n_features > 0, || {
            "qc.doublets artificial_fraction, k, n_pcs and n_features must be positive".into()
        })?;

        let int = &self.integration;
        check(int.n_features > 0 && int.n_pcs > 0, || {
            "integration.n_features and integration.n_pcs must be positive".into()
        })?;
        check(int.scale_max > 0.0, || "integration.scale_max must be positive".into())?;
        check(!int.methods.is_empty(), || "integration.methods is empty".into())?;
        let unique = int.methods.iter().collect::<FxHashSet<_>>();
        check(unique.len() == int.methods.len(), || "integration.methods lists a method twice".into())?;
        check(int.anchors.k_weight > 0 && int.anchors.sd_weight > 0.0, || {
            "integration.anchors k_weight and sd_weight must be positive".into()
        })?;
        let h = &int.harmony;
        check(h.theta >= 0.0 && h.sigma > 0.0 && h.lambda > 0.0 && h.max_iter > 0, || {
            "integration.harmony needs theta >= 0 and positive sigma, lambda, max_iter".into()
        })?;

        let c = &self.clustering;
        check(c.k >= 2, || format!("clustering.k must be at least 2, got {}", c.k))?;
        check(c.resolution > 0.0 && c.n_starts > 0, || {
            "clustering.resolution and clustering.n_starts must be positive".into()
        })?;
        check((0.0..1.0).contains(&c.prune), || format!("clustering.prune must be in [0, 1), got {}", c.prune))?;

        check(self.mixing.k > 0 && self.mixing.max_k >= self.mixing.k, || {
            "mixing.k must be positive and not above mixing.max_k".into()
        })?;

        let a = &self.annotation;
        if let Some(m) = a.method {
            check(int.methods.contains(&m), || format!("annotation.method {m} is not in integration.methods"))?;
        }
        check((0.0..1.0).contains(&a.markers.margin), || {
            format!("annotation.markers.margin must be in [0, 1), got {}", a.markers.margin)
        })?;
        check(a.markers.min_cells > 0 && a.transfer.k_weight > 0 && a.transfer.n_pcs > 0, || {
            "annotation markers.min_cells, transfer.k_weight and transfer.n_pcs must be positive".into()
        })?;

        let mut ids = FxHashSet::default();
        for s in &self.samples {
            check(!s.id.is_empty(), || "sample with an empty id".into())?;
            check(ids.insert(s.id.as_str()), || format!("sample id {} is listed twice", s.id))?;
        }
        Ok(())
    }

    /// Ingestion needs at least one sample.
    pub fn validate_samples(&self) -> Result<(), PipelineError> {
        check(!self.samples.is_empty(), || "no [[samples]] configured".into())
    }

    /// A commented starting point for a new project.
    pub fn template() -> Result<String, Error> {
        let cfg = PipelineConfig {
            samples: vec![
                SampleSpec {
                    id: "ctrl".to_string(),
                    path: PathBuf::from("data/ctrl/filtered_feature_bc_matrix"),
                    group: "ctrl".to_string(),
                },
                SampleSpec {
                    id: "stim".to_string(),
                    path: PathBuf::from("data/stim/filtered_feature_bc_matrix"),
                    group: "stim".to_string(),
                },
            ],
            annotation: AnnotationParams {
                method: Some(MethodName::Cca),
                ..Default::default()
            },
            ..Default::default()
        };
        let body = toml::to_string_pretty(&cfg)?;
        Ok(format!(
            "# scflow pipeline configuration\n\
             # qc.max_detected_genes: 5000 is applied; some write-ups of this workflow say 4000.\n\
             # annotation.method must be set when several integration methods are run.\n\
             # Add [annotation.reference] with `path` (and `ambiguity = \"drop\" | \"fail\"`)\n\
             # to transfer labels from a reference atlas.\n\n{body}"
        ))
    }
}

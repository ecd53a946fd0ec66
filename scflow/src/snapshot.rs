//! Stage snapshots: a gzip stream holding a bincode header followed by the
//! bincode-encoded stage value.
//!
//! Writes go to a temporary sibling file that is renamed into place, so a
//! failed stage never clobbers the previous snapshot.

use anyhow::{Context, Error};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::info;
use scflow_types::PipelineError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

const MAGIC: [u8; 8] = *b"SCFLOWSN";
/// Bumped whenever a stage value changes shape
pub const FORMAT_VERSION: u32 = 1;

/// The persisted hand-off points between stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Merged,
    QcPassed,
    QcSplit,
    Integrated,
    Annotated,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Merged,
        Stage::QcPassed,
        Stage::QcSplit,
        Stage::Integrated,
        Stage::Annotated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Merged => "merged",
            Stage::QcPassed => "qc_passed",
            Stage::QcSplit => "qc_split",
            Stage::Integrated => "integrated",
            Stage::Annotated => "annotated",
        }
    }

    /// Snapshot path of this stage under `dir`.
    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.snap", self.as_str()))
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|st| st.as_str() == s.to_ascii_lowercase().replace('-', "_"))
            .ok_or_else(|| PipelineError::UnknownMethod {
                kind: "stage",
                name: s.to_string(),
            })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    magic: [u8; 8],
    format_version: u32,
    stage: Stage,
    producer: String,
}

fn rejected(path: &Path, reason: impl Into<String>) -> Error {
    PipelineError::Snapshot {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
    .into()
}

fn write_payload<T: Serialize>(tmp: &Path, stage: Stage, value: &T) -> Result<(), Error> {
    let file = File::create(tmp).with_context(|| tmp.display().to_string())?;
    let mut gz = GzEncoder::new(BufWriter::new(file), Compression::fast());
    let header = Header {
        magic: MAGIC,
        format_version: FORMAT_VERSION,
        stage,
        producer: format!("scflow {}", env!("CARGO_PKG_VERSION")),
    };
    bincode::serialize_into(&mut gz, &header)?;
    bincode::serialize_into(&mut gz, value)?;
    gz.finish()?.flush()?;
    Ok(())
}

/// Write `value` as the snapshot of `stage` at `path`.
pub fn write_snapshot<T: Serialize>(path: &Path, stage: Stage, value: &T) -> Result<(), Error> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| dir.display().to_string())?;
    }
    let tmp = path.with_extension("snap.tmp");
    if let Err(e) = write_payload(&tmp, stage, value) {
        // drop the partial file, keep the previous snapshot
        let _ = std::fs::remove_file(&tmp);
        return Err(e.context(format!("writing {} snapshot to {}", stage, path.display())));
    }
    std::fs::rename(&tmp, path).with_context(|| format!("moving snapshot into {}", path.display()))?;
    info!("wrote {} snapshot to {}", stage, path.display());
    Ok(())
}

/// Read the snapshot at `path`, which must hold `stage`.
pub fn read_snapshot<T: DeserializeOwned>(path: &Path, stage: Stage) -> Result<T, Error> {
    if !path.is_file() {
        return Err(PipelineError::MissingPath {
            what: format!("{stage} snapshot"),
            path: path.to_path_buf(),
        }
        .into());
    }
    let file = File::open(path).with_context(|| path.display().to_string())?;
    let mut rdr = MultiGzDecoder::new(BufReader::new(file));
    let header: Header = bincode::deserialize_from(&mut rdr).map_err(|e| rejected(path, format!("unreadable header: {e}")))?;
    if header.magic != MAGIC {
        return Err(rejected(path, "not an scflow snapshot"));
    }
    if header.format_version != FORMAT_VERSION {
        return Err(rejected(
            path,
            format!("format version {} (expected {})", header.format_version, FORMAT_VERSION),
        ));
    }
    if header.stage != stage {
        return Err(rejected(path, format!("holds stage {} (expected {})", header.stage, stage)));
    }
    bincode::deserialize_from(&mut rdr).map_err(|e| rejected(path, format!("corrupt payload: {e}")))
}

//! 10x MEX directory reading: `matrix.mtx`, `features.tsv` (or legacy
//! `genes.tsv`) and `barcodes.tsv`, each optionally gzipped.

use anyhow::{format_err, Context, Error};
use flate2::bufread::MultiGzDecoder;
use fxhash::FxHashSet;
use scflow_types::matrix::csc_from_columns;
use scflow_types::{CountMat, FeatureBarcodeMatrix, PipelineError};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Open a text file, transparently decompressing `.gz` files.
pub fn open_text(path: &Path) -> Result<Box<dyn BufRead>, Error> {
    let file = BufReader::new(File::open(path).with_context(|| path.display().to_string())?);
    if path.extension().map_or(false, |e| e == "gz") {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(file))
    }
}

/// First of `stems` (with or without `.gz`) that exists under `dir`.
pub(crate) fn locate(dir: &Path, stems: &[&str]) -> Result<PathBuf, PipelineError> {
    for stem in stems {
        for name in [format!("{stem}.gz"), stem.to_string()] {
            let p = dir.join(name);
            if p.is_file() {
                return Ok(p);
            }
        }
    }
    Err(PipelineError::MissingPath {
        what: stems.join(" or "),
        path: dir.to_path_buf(),
    })
}

fn parse_count(s: &str) -> Result<u32, Error> {
    match s.parse::<u32>() {
        Ok(v) => Ok(v),
        Err(_) => {
            let f = s.parse::<f64>()?;
            if f >= 0.0 && f.fract() == 0.0 && f <= u32::MAX as f64 {
                Ok(f as u32)
            } else {
                Err(format_err!("count {} is not a non-negative integer", s))
            }
        }
    }
}

/// Load a CSC count matrix from MatrixMarket coordinate format. `context`
/// names the sample in error messages.
pub fn load_mtx(path: &Path, context: &str) -> Result<CountMat, Error> {
    let reader = open_text(path)?;
    let mut shape: Option<(usize, usize, usize)> = None;
    let mut columns: Vec<Vec<(usize, u32)>> = Vec::new();
    let mut entries = 0usize;

    for (lineno, line) in reader.lines().enumerate() {
        let line = line.with_context(|| path.display().to_string())?;
        let where_ = || format!("{}:{}", path.display(), lineno + 1);
        if line.starts_with('%') || line.trim().is_empty() {
            continue;
        }
        let mut data = line.split_whitespace();
        let mut next = |what: &str| {
            data.next()
                .ok_or_else(|| format_err!("missing {} at {}", what, where_()))
        };
        match shape {
            None => {
                let nrow = next("NROW")?.parse::<usize>().with_context(where_)?;
                let ncol = next("NCOL")?.parse::<usize>().with_context(where_)?;
                let nnz = next("NNZ")?.parse::<usize>().with_context(where_)?;
                columns = vec![Vec::new(); ncol];
                shape = Some((nrow, ncol, nnz));
            }
            Some((nrow, ncol, _)) => {
                let row = next("ROW")?.parse::<usize>().with_context(where_)?;
                let col = next("COL")?.parse::<usize>().with_context(where_)?;
                let val = parse_count(next("VAL")?).with_context(where_)?;
                if row == 0 || row > nrow {
                    return Err(PipelineError::dims(format!("{context}: row index at {}", where_()), nrow, row).into());
                }
                if col == 0 || col > ncol {
                    return Err(PipelineError::dims(format!("{context}: column index at {}", where_()), ncol, col).into());
                }
                columns[col - 1].push((row - 1, val));
                entries += 1;
            }
        }
    }

    let Some((nrow, _, nnz)) = shape else {
        return Err(format_err!("no matrix header found in {}", path.display()));
    };
    if entries != nnz {
        return Err(PipelineError::dims(format!("{context}: entries in {}", path.display()), nnz, entries).into());
    }
    Ok(csc_from_columns(nrow, columns))
}

/// Read a features (or legacy genes) file: `id<TAB>name[<TAB>type]`. A file
/// with a single column uses the id as the name.
pub fn read_features(path: &Path) -> Result<(Vec<String>, Vec<String>), Error> {
    let mut ids = Vec::new();
    let mut names = Vec::new();
    for (lineno, line) in open_text(path)?.lines().enumerate() {
        let line = line.with_context(|| path.display().to_string())?;
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split('\t');
        let id = fields
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| format_err!("empty feature id at {}:{}", path.display(), lineno + 1))?;
        let name = fields.next().unwrap_or(id);
        ids.push(id.to_string());
        names.push(name.to_string());
    }
    Ok((ids, names))
}

/// Read a barcodes file, one barcode per line.
pub fn read_barcodes(path: &Path) -> Result<Vec<String>, Error> {
    let mut barcodes = Vec::new();
    for line in open_text(path)?.lines() {
        let line = line.with_context(|| path.display().to_string())?;
        let bc = line.split('\t').next().unwrap_or("").trim();
        if !bc.is_empty() {
            barcodes.push(bc.to_string());
        }
    }
    Ok(barcodes)
}

/// Load a MEX directory as-is: feature names are not de-duplicated.
pub fn load_mex(dir: &Path, name: &str) -> Result<FeatureBarcodeMatrix, Error> {
    if !dir.is_dir() {
        return Err(PipelineError::MissingPath {
            what: format!("matrix directory for {name}"),
            path: dir.to_path_buf(),
        }
        .into());
    }
    let matrix_path = locate(dir, &["matrix.mtx"])?;
    let features_path = locate(dir, &["features.tsv", "genes.tsv"])?;
    let barcodes_path = locate(dir, &["barcodes.tsv"])?;

    let matrix = load_mtx(&matrix_path, name)?;
    let (feature_ids, feature_names) = read_features(&features_path)?;
    let barcodes = read_barcodes(&barcodes_path)?;

    if feature_ids.len() != matrix.rows() {
        return Err(PipelineError::dims(
            format!("{name}: {} entries vs matrix rows", features_path.display()),
            matrix.rows(),
            feature_ids.len(),
        )
        .into());
    }
    if barcodes.len() != matrix.cols() {
        return Err(PipelineError::dims(
            format!("{name}: {} entries vs matrix columns", barcodes_path.display()),
            matrix.cols(),
            barcodes.len(),
        )
        .into());
    }
    Ok(FeatureBarcodeMatrix::new(name, barcodes, feature_ids, feature_names, matrix)?)
}

/// Make names unique by appending `.1`, `.2`, ... to repeats, in order of
/// appearance. A suffix already taken by another name is skipped.
pub fn make_unique(names: &[String]) -> Vec<String> {
    let mut taken: FxHashSet<String> = names.iter().cloned().collect();
    let mut seen: FxHashSet<&str> = FxHashSet::default();
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        if seen.insert(name.as_str()) {
            out.push(name.clone());
            continue;
        }
        let mut i = 1;
        let mut candidate = format!("{name}.{i}");
        while taken.contains(&candidate) {
            i += 1;
            candidate = format!("{name}.{i}");
        }
        taken.insert(candidate.clone());
        out.push(candidate);
    }
    out
}

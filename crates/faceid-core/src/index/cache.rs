//! Persisted index snapshot: `{vector matrix, label array, name map}` as JSON.
//!
//! Writes go to a sibling temp file that is renamed over the target, so a
//! reader never sees a half-written cache.

use super::{IdentityIndex, Label};
use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use thiserror::Error;

pub const CACHE_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unsupported cache format version {found} (expected {CACHE_FORMAT_VERSION})")]
    Version { found: u32 },
    #[error("cache was built for model {found:?}, expected {expected:?}")]
    ModelMismatch { found: String, expected: String },
    #[error("invalid cache contents: {0}")]
    Invalid(String),
}

impl CacheError {
    /// True when the cache simply does not exist yet.
    pub fn is_missing(&self) -> bool {
        matches!(self, CacheError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    format_version: u32,
    model: String,
    dim: usize,
    saved_at: DateTime<Utc>,
    /// Row-major `labels.len() × dim` matrix.
    vectors: Vec<f32>,
    labels: Vec<Label>,
    names: BTreeMap<Label, String>,
}

/// Write `index` to `path`, replacing any previous cache.
pub fn save(path: &Path, model: &str, index: &IdentityIndex) -> Result<(), CacheError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let file = CacheFile {
        format_version: CACHE_FORMAT_VERSION,
        model: model.to_string(),
        dim: index.dim(),
        saved_at: Utc::now(),
        vectors: index.vectors().iter().copied().collect(),
        labels: index.labels().to_vec(),
        names: index.names().clone(),
    };

    let tmp_path = path.with_extension("json.tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        serde_json::to_writer(&mut writer, &file)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp_path, path)?;

    tracing::debug!(path = %path.display(), slots = index.len(), "index cache written");
    Ok(())
}

/// Read and validate a cache written by [`save`] for the same model.
pub fn load(path: &Path, model: &str) -> Result<IdentityIndex, CacheError> {
    let reader = BufReader::new(File::open(path)?);
    let file: CacheFile = serde_json::from_reader(reader)?;

    if file.format_version != CACHE_FORMAT_VERSION {
        return Err(CacheError::Version {
            found: file.format_version,
        });
    }
    if file.model != model {
        return Err(CacheError::ModelMismatch {
            found: file.model,
            expected: model.to_string(),
        });
    }

    let rows = file.labels.len();
    let vectors = Array2::from_shape_vec((rows, file.dim), file.vectors)
        .map_err(|e| CacheError::Invalid(format!("vector matrix: {e}")))?;
    let index = IdentityIndex::from_parts(vectors, file.labels, file.names).map_err(CacheError::Invalid)?;

    tracing::debug!(
        path = %path.display(),
        slots = index.len(),
        saved_at = %file.saved_at,
        "index cache loaded"
    );
    Ok(index)
}

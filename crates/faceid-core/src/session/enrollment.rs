//! Enrollment: sample one person's face and commit a centroid to the index.

use super::{CancelFlag, ClearOnExit, FrameFeed, Phase, Progress};
use crate::index::{IndexError, IndexStore, Label};
use crate::pipeline::FacePipeline;
use crate::types::{AlignedFace, Embedding};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("invalid identity name {0:?}")]
    InvalidName(String),
    #[error("enrollment cancelled")]
    Cancelled,
    #[error("no face samples captured")]
    NoSamples,
    #[error("timed out after {captured} of {target} samples")]
    TimedOut { captured: usize, target: usize },
    #[error("samples could not be averaged")]
    DegenerateCentroid,
    #[error("index: {0}")]
    Index(#[from] IndexError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnrollmentParams {
    /// Samples to collect before committing.
    pub capture_target: usize,
    /// Longest single wait for a frame.
    pub frame_timeout: Duration,
    /// Optional wall-clock budget; `None` runs until the target or cancel.
    pub timeout: Option<Duration>,
}

impl Default for EnrollmentParams {
    fn default() -> Self {
        Self {
            capture_target: 30,
            frame_timeout: Duration::from_millis(3000),
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrollmentReport {
    pub name: String,
    pub label: Label,
    pub samples: usize,
    pub images_saved: usize,
    pub person_dir: PathBuf,
}

/// Trim `name` and reject anything that is empty or cannot be used as a
/// single directory name. Names starting with `.` are rejected too: the disk
/// rebuild skips hidden directories.
pub fn validate_name(name: &str) -> Result<String, EnrollmentError> {
    let trimmed = name.trim();
    let unsafe_name = trimmed.is_empty() || trimmed.starts_with('.') || trimmed.contains(['/', '\\', '\0']);
    if unsafe_name {
        return Err(EnrollmentError::InvalidName(name.to_string()));
    }
    Ok(trimmed.to_string())
}

/// Run one enrollment session for `name`.
///
/// Each sample is embedded as soon as it is captured. On reaching the target
/// the aligned crops are written to `<faces_dir>/<name>/NNN.jpg` and the
/// normalized mean of all samples is committed as one new slot. Nothing
/// touches the index unless the target is reached.
pub fn enroll(
    feed: &dyn FrameFeed,
    pipeline: &mut FacePipeline,
    index: &IndexStore,
    name: &str,
    params: &EnrollmentParams,
    cancel: &CancelFlag,
    progress: &mut dyn FnMut(Progress),
) -> Result<EnrollmentReport, EnrollmentError> {
    let name = validate_name(name)?;
    if collides_with_cache(index, &name) {
        return Err(EnrollmentError::InvalidName(name));
    }
    let _clear = ClearOnExit(feed);
    let target = params.capture_target;
    let deadline = params.timeout.map(|t| Instant::now() + t);

    tracing::info!(name = %name, target, "enrollment started");
    progress(Progress::new(0, target, Phase::Starting));

    let mut buffer: Vec<(AlignedFace, Embedding)> = Vec::with_capacity(target);
    while buffer.len() < target {
        if cancel.is_cancelled() {
            tracing::info!(name = %name, captured = buffer.len(), "enrollment cancelled");
            progress(Progress::failed(buffer.len(), target, Phase::Done));
            return Err(EnrollmentError::Cancelled);
        }

        let wait = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    progress(Progress::failed(buffer.len(), target, Phase::Done));
                    return Err(if buffer.is_empty() {
                        EnrollmentError::NoSamples
                    } else {
                        EnrollmentError::TimedOut {
                            captured: buffer.len(),
                            target,
                        }
                    });
                }
                remaining.min(params.frame_timeout)
            }
            None => params.frame_timeout,
        };

        let Some(frame) = feed.next_frame(wait) else {
            tracing::debug!("no frame within timeout");
            continue;
        };
        let Some(face) = pipeline.localize(&frame) else {
            continue;
        };
        let Some(embedding) = pipeline.embed(&face) else {
            continue;
        };

        buffer.push((face, embedding));
        progress(Progress::new(buffer.len(), target, Phase::Capturing));
    }

    if buffer.is_empty() {
        progress(Progress::failed(0, target, Phase::Done));
        return Err(EnrollmentError::NoSamples);
    }

    progress(Progress::new(buffer.len(), target, Phase::Saving));
    let person_dir = index.faces_dir().join(&name);
    let images_saved = save_crops(&person_dir, &buffer, cancel)?;

    let samples: Vec<Embedding> = buffer.into_iter().map(|(_, e)| e).collect();
    let centroid = Embedding::centroid(&samples).ok_or(EnrollmentError::DegenerateCentroid)?;
    let label = index.add(&[centroid], &name)?;

    tracing::info!(name = %name, label, samples = samples.len(), images_saved, "enrollment committed");
    progress(Progress::new(samples.len(), target, Phase::Done));

    Ok(EnrollmentReport {
        name,
        label,
        samples: samples.len(),
        images_saved,
        person_dir,
    })
}

/// The cache file and its temp sibling live in `faces_dir` next to the
/// identity directories.
fn collides_with_cache(index: &IndexStore, name: &str) -> bool {
    index
        .cache_path()
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|cache| name.starts_with(cache))
}

/// Write every buffered crop as `NNN.jpg`. Individual write failures are
/// logged and skipped; the images are provenance only.
fn save_crops(
    person_dir: &Path,
    buffer: &[(AlignedFace, Embedding)],
    cancel: &CancelFlag,
) -> Result<usize, EnrollmentError> {
    if let Err(e) = fs::create_dir_all(person_dir) {
        tracing::warn!(dir = %person_dir.display(), error = %e, "cannot create identity directory; images not saved");
        return Ok(0);
    }

    let mut saved = 0;
    for (idx, (face, _)) in buffer.iter().enumerate() {
        if cancel.is_cancelled() {
            tracing::info!(saved, "enrollment cancelled while saving images");
            return Err(EnrollmentError::Cancelled);
        }
        let path = person_dir.join(format!("{idx:03}.jpg"));
        match face.image().save(&path) {
            Ok(()) => saved += 1,
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to save enrollment image"),
        }
    }
    Ok(saved)
}

//! Rebuild an index from the canonical on-disk layout:
//! `<faces_dir>/<identity name>/<image>.{jpg,jpeg,png}`.

use super::{IdentityIndex, IndexError};
use crate::pipeline::FacePipeline;
use crate::types::{AlignedFace, Embedding, ALIGNED_SIZE};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// What a disk scan found.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiskScanReport {
    /// Identities that produced a centroid.
    pub identities: usize,
    /// Images that contributed an embedding.
    pub images: usize,
    /// Images that failed to decode, had no face, or failed to embed.
    pub skipped: usize,
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| matches!(e.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png"))
        .unwrap_or(false)
}

/// Entries of `dir` matching `keep`, sorted by path so scans are deterministic.
fn sorted_entries(dir: &Path, keep: impl Fn(&Path) -> bool) -> std::io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if keep(&path) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Embed one stored image. Canonical-size images are taken as already-aligned
/// crops; anything else goes through detection and alignment first.
fn embed_image(path: &Path, pipeline: &mut FacePipeline) -> Option<Embedding> {
    let image = match image::open(path) {
        Ok(img) => img.to_rgb8(),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "unreadable image; skipping");
            return None;
        }
    };

    let face = if image.dimensions() == (ALIGNED_SIZE, ALIGNED_SIZE) {
        AlignedFace::from_image(image)
    } else {
        pipeline.localize_image(&image)
    };
    let Some(face) = face else {
        tracing::debug!(path = %path.display(), "no face in image; skipping");
        return None;
    };

    pipeline.embed(&face)
}

/// Scan `faces_dir`, producing exactly one centroid slot per identity
/// directory that yielded at least one embedding. Creates `faces_dir` when
/// it does not exist yet.
pub(crate) fn scan_faces_dir(
    faces_dir: &Path,
    dim: usize,
    pipeline: &mut FacePipeline,
) -> Result<(IdentityIndex, DiskScanReport), IndexError> {
    fs::create_dir_all(faces_dir)?;

    let mut index = IdentityIndex::new(dim);
    let mut report = DiskScanReport::default();

    let identity_dirs = sorted_entries(faces_dir, |p| {
        p.is_dir()
            && p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| !n.starts_with('.'))
    })?;

    for dir in identity_dirs {
        // Filtered above: the name is valid UTF-8.
        let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        let images = sorted_entries(&dir, |p| p.is_file() && is_image_file(p))?;
        let mut samples = Vec::with_capacity(images.len());
        for path in &images {
            match embed_image(path, pipeline) {
                Some(e) if e.dim() == dim => samples.push(e),
                Some(e) => {
                    tracing::warn!(path = %path.display(), dim = e.dim(), expected = dim, "embedding has wrong dimension");
                    report.skipped += 1;
                }
                None => report.skipped += 1,
            }
        }

        let Some(centroid) = Embedding::centroid(&samples) else {
            tracing::warn!(identity = %name, images = images.len(), "no usable images; identity not indexed");
            continue;
        };

        let label = index.add(&[centroid], name)?;
        report.identities += 1;
        report.images += samples.len();
        tracing::debug!(identity = %name, label, samples = samples.len(), "identity rebuilt from disk");
    }

    Ok((index, report))
}

//! The shared, persisted identity index.
//!
//! Readers take a snapshot under a short read lock and search it without
//! holding any lock. Writers serialize on `writer`, build the next index off
//! to the side, persist it, and only then swap it in, so a reader sees either
//! the old index or the fully committed new one.

use super::scan::{scan_faces_dir, DiskScanReport};
use super::{cache, IdentityIndex, IdentitySummary, IndexError, Label};
use crate::pipeline::FacePipeline;
use crate::types::Embedding;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// A search hit with its identity name resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedHit {
    pub slot: usize,
    pub label: Label,
    pub name: String,
    pub score: f32,
}

/// Where a rebuild got its data from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildSource {
    Cache { slots: usize },
    Disk(DiskScanReport),
}

pub struct IndexStore {
    writer: Mutex<()>,
    index: RwLock<Arc<IdentityIndex>>,
    faces_dir: PathBuf,
    cache_path: PathBuf,
    model: String,
}

impl IndexStore {
    /// An empty store rooted at `faces_dir`. Call [`IndexStore::rebuild`] to
    /// load existing identities.
    pub fn new(faces_dir: impl Into<PathBuf>, model: &str, dim: usize) -> Self {
        let faces_dir = faces_dir.into();
        Self {
            writer: Mutex::new(()),
            index: RwLock::new(Arc::new(IdentityIndex::new(dim))),
            cache_path: Self::cache_path_for(&faces_dir, model),
            faces_dir,
            model: model.to_string(),
        }
    }

    /// `<faces_dir>/<model>_cache.json`: one cache per embedding model.
    pub fn cache_path_for(faces_dir: &Path, model: &str) -> PathBuf {
        faces_dir.join(format!("{model}_cache.json"))
    }

    pub fn faces_dir(&self) -> &Path {
        &self.faces_dir
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// The current committed index.
    pub fn snapshot(&self) -> Arc<IdentityIndex> {
        Arc::clone(&self.index.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn dim(&self) -> usize {
        self.snapshot().dim()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn identities(&self) -> Vec<IdentitySummary> {
        self.snapshot().identities()
    }

    pub fn search(&self, query: &Embedding, k: usize) -> Vec<ResolvedHit> {
        let index = self.snapshot();
        index
            .search(query.values(), k)
            .into_iter()
            .filter_map(|hit| {
                Some(ResolvedHit {
                    slot: hit.slot,
                    label: hit.label,
                    name: index.name(hit.label)?.to_string(),
                    score: hit.score,
                })
            })
            .collect()
    }

    /// Append `vectors` for `name` and persist the cache. The new slots become
    /// visible only after the cache write succeeds.
    pub fn add(&self, vectors: &[Embedding], name: &str) -> Result<Label, IndexError> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let mut next = IdentityIndex::clone(&self.snapshot());
        let label = next.add(vectors, name)?;
        cache::save(&self.cache_path, &self.model, &next)?;

        let slots = next.len();
        self.swap(next);
        tracing::info!(name = %name, label, added = vectors.len(), slots, "identity added");
        Ok(label)
    }

    /// Load the persisted cache, falling back to a disk scan when it is
    /// missing or unusable.
    pub fn rebuild(&self, pipeline: &mut FacePipeline) -> Result<RebuildSource, IndexError> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        match cache::load(&self.cache_path, &self.model) {
            Ok(index) if index.dim() == self.dim() => {
                let slots = index.len();
                self.swap(index);
                tracing::info!(path = %self.cache_path.display(), slots, "index loaded from cache");
                return Ok(RebuildSource::Cache { slots });
            }
            Ok(index) => {
                tracing::warn!(
                    path = %self.cache_path.display(),
                    dim = index.dim(),
                    expected = self.dim(),
                    "cache has wrong embedding dimension; rebuilding from disk"
                );
            }
            Err(e) if e.is_missing() => {
                tracing::warn!(path = %self.cache_path.display(), "no index cache; rebuilding from disk");
            }
            Err(e) => {
                tracing::warn!(path = %self.cache_path.display(), error = %e, "index cache unusable; rebuilding from disk");
            }
        }

        self.scan_locked(pipeline).map(RebuildSource::Disk)
    }

    /// Ignore the cache and rescan the canonical layout.
    pub fn rebuild_from_disk(&self, pipeline: &mut FacePipeline) -> Result<DiskScanReport, IndexError> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.scan_locked(pipeline)
    }

    /// Caller must hold `writer`.
    fn scan_locked(&self, pipeline: &mut FacePipeline) -> Result<DiskScanReport, IndexError> {
        let (index, report) = scan_faces_dir(&self.faces_dir, self.dim(), pipeline)?;

        if !index.is_empty() {
            if let Err(e) = cache::save(&self.cache_path, &self.model, &index) {
                tracing::warn!(path = %self.cache_path.display(), error = %e, "failed to persist rebuilt index");
            }
        }

        tracing::info!(
            identities = report.identities,
            images = report.images,
            skipped = report.skipped,
            "index rebuilt from disk"
        );
        self.swap(index);
        Ok(report)
    }

    fn swap(&self, next: IdentityIndex) {
        *self.index.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
    }
}

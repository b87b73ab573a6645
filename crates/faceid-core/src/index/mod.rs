//! Identity vector index.
//!
//! A flat inner-product index over unit-length embeddings. Each row ("slot")
//! belongs to one integer label; labels map to display names. Labels are
//! allocated densely in insertion order and never removed.

pub mod cache;
mod scan;
mod store;

pub use cache::CacheError;
pub use scan::DiskScanReport;
pub use store::{IndexStore, RebuildSource, ResolvedHit};

use crate::types::{l2_norm, Embedding};
use ndarray::{aview1, Array2, ArrayView1};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

pub type Label = u32;

/// Allowed deviation from unit norm for stored vectors.
pub const NORM_TOLERANCE: f32 = 1e-3;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("expected {expected}-dim vector, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("vector is not unit length (norm {0})")]
    NotNormalized(f32),
    #[error("identity name is empty")]
    EmptyName,
    #[error("no vectors to add")]
    NoVectors,
    #[error("cache: {0}")]
    Cache(#[from] CacheError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// One nearest-neighbour result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    pub slot: usize,
    pub label: Label,
    /// Cosine similarity (inner product of unit vectors).
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentitySummary {
    pub label: Label,
    pub name: String,
    pub slots: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdentityIndex {
    /// One row per slot.
    vectors: Array2<f32>,
    /// Label of each slot; same length as `vectors` has rows.
    labels: Vec<Label>,
    names: BTreeMap<Label, String>,
}

impl IdentityIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            vectors: Array2::zeros((0, dim)),
            labels: Vec::new(),
            names: BTreeMap::new(),
        }
    }

    /// Assemble an index from persisted parts, checking every invariant.
    pub(crate) fn from_parts(
        vectors: Array2<f32>,
        labels: Vec<Label>,
        names: BTreeMap<Label, String>,
    ) -> Result<Self, String> {
        if vectors.nrows() != labels.len() {
            return Err(format!(
                "{} vectors but {} labels",
                vectors.nrows(),
                labels.len()
            ));
        }
        if let Some(label) = labels.iter().find(|l| !names.contains_key(l)) {
            return Err(format!("label {label} has no name"));
        }
        for (slot, row) in vectors.rows().into_iter().enumerate() {
            let norm = row.dot(&row).sqrt();
            if !((norm - 1.0).abs() <= NORM_TOLERANCE) {
                return Err(format!("slot {slot} has norm {norm}"));
            }
        }
        Ok(Self {
            vectors,
            labels,
            names,
        })
    }

    pub(crate) fn vectors(&self) -> &Array2<f32> {
        &self.vectors
    }

    pub(crate) fn labels(&self) -> &[Label] {
        &self.labels
    }

    pub(crate) fn names(&self) -> &BTreeMap<Label, String> {
        &self.names
    }

    pub fn dim(&self) -> usize {
        self.vectors.ncols()
    }

    /// Number of stored vectors (slots).
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn identity_count(&self) -> usize {
        self.names.len()
    }

    pub fn label_of(&self, name: &str) -> Option<Label> {
        self.names.iter().find(|(_, n)| n.as_str() == name).map(|(&l, _)| l)
    }

    pub fn name(&self, label: Label) -> Option<&str> {
        self.names.get(&label).map(String::as_str)
    }

    pub fn slot_label(&self, slot: usize) -> Option<Label> {
        self.labels.get(slot).copied()
    }

    pub fn slot_name(&self, slot: usize) -> Option<&str> {
        self.name(self.slot_label(slot)?)
    }

    pub fn vector(&self, slot: usize) -> Option<ArrayView1<'_, f32>> {
        (slot < self.len()).then(|| self.vectors.row(slot))
    }

    pub fn identities(&self) -> Vec<IdentitySummary> {
        self.names
            .iter()
            .map(|(&label, name)| IdentitySummary {
                label,
                name: name.clone(),
                slots: self.labels.iter().filter(|&&l| l == label).count(),
            })
            .collect()
    }

    /// Top-`k` slots by cosine similarity, best first.
    ///
    /// Returns fewer than `k` hits when the index holds fewer vectors, and
    /// nothing for an empty index or a query of the wrong dimension.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<SearchHit> {
        if k == 0 || self.is_empty() {
            return Vec::new();
        }
        if query.len() != self.dim() {
            tracing::debug!(expected = self.dim(), actual = query.len(), "search with wrong dimension");
            return Vec::new();
        }

        let scores = self.vectors.dot(&aview1(query));
        let mut hits: Vec<SearchHit> = scores
            .iter()
            .enumerate()
            .map(|(slot, &score)| SearchHit {
                slot,
                label: self.labels[slot],
                score,
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.slot.cmp(&b.slot)));
        hits.truncate(k);
        hits
    }

    /// Append `vectors` as new slots for `name`, reusing its label if the name
    /// is already known. Either every vector is added or none is.
    pub fn add(&mut self, vectors: &[Embedding], name: &str) -> Result<Label, IndexError> {
        if name.trim().is_empty() {
            return Err(IndexError::EmptyName);
        }
        if vectors.is_empty() {
            return Err(IndexError::NoVectors);
        }
        for v in vectors {
            if v.dim() != self.dim() {
                return Err(IndexError::DimensionMismatch {
                    expected: self.dim(),
                    actual: v.dim(),
                });
            }
            let norm = l2_norm(v.values());
            if !((norm - 1.0).abs() <= NORM_TOLERANCE) {
                return Err(IndexError::NotNormalized(norm));
            }
        }

        let label = match self.label_of(name) {
            Some(label) => label,
            None => {
                let label = self.names.keys().next_back().map_or(0, |l| l + 1);
                self.names.insert(label, name.to_string());
                label
            }
        };

        for v in vectors {
            self.vectors
                .push_row(aview1(v.values()))
                .map_err(|_| IndexError::DimensionMismatch {
                    expected: self.dim(),
                    actual: v.dim(),
                })?;
            self.labels.push(label);
        }

        Ok(label)
    }
}

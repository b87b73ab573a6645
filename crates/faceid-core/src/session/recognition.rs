//! Live recognition: collect several embeddings, vote, decide.

use super::{CancelFlag, ClearOnExit, FrameFeed, Phase, Progress};
use crate::index::IndexStore;
use crate::pipeline::FacePipeline;
use crate::types::Frame;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecognitionParams {
    /// Embeddings to collect before deciding.
    pub sample_count: usize,
    /// Minimum cosine similarity for a sample to vote for an identity.
    pub similarity_threshold: f32,
    /// The winner needs strictly more than this fraction of `sample_count`.
    pub min_agreement: f32,
    /// Wall-clock budget for the whole session.
    pub timeout: Duration,
    /// Longest single wait for a frame.
    pub frame_timeout: Duration,
}

impl Default for RecognitionParams {
    fn default() -> Self {
        Self {
            sample_count: 10,
            similarity_threshold: 0.40,
            min_agreement: 0.25,
            timeout: Duration::from_secs(5),
            frame_timeout: Duration::from_millis(3000),
        }
    }
}

/// One sample's vote.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Vote {
    Identity(String),
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoMatchReason {
    EmptyIndex,
    Cancelled,
    NoSamples,
    /// The top vote was "unknown".
    Unknown,
    /// Two or more candidates share the top count.
    Tie,
    /// The top candidate did not clear the agreement bar.
    Insufficient,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Match { name: String, votes: usize, samples: usize },
    NoMatch { reason: NoMatchReason, samples: usize },
}

impl Verdict {
    pub fn name(&self) -> Option<&str> {
        match self {
            Verdict::Match { name, .. } => Some(name),
            Verdict::NoMatch { .. } => None,
        }
    }

    pub fn is_match(&self) -> bool {
        matches!(self, Verdict::Match { .. })
    }

    fn no_match(reason: NoMatchReason, samples: usize) -> Self {
        Verdict::NoMatch { reason, samples }
    }
}

/// Decide a verdict from the collected votes.
///
/// The most frequent vote wins only if it is an identity, is not tied with
/// another vote, and its count is strictly greater than
/// `min_agreement × sample_count`.
pub fn tally(votes: &[Vote], sample_count: usize, min_agreement: f32) -> Verdict {
    let samples = votes.len();
    let mut counts: HashMap<&Vote, usize> = HashMap::new();
    for vote in votes {
        *counts.entry(vote).or_default() += 1;
    }

    let Some(top) = counts.values().copied().max() else {
        return Verdict::no_match(NoMatchReason::NoSamples, 0);
    };
    let mut leaders = counts.iter().filter(|(_, &c)| c == top).map(|(v, _)| *v);
    let (Some(leader), None) = (leaders.next(), leaders.next()) else {
        return Verdict::no_match(NoMatchReason::Tie, samples);
    };

    let Vote::Identity(name) = leader else {
        return Verdict::no_match(NoMatchReason::Unknown, samples);
    };
    if top as f64 <= min_agreement as f64 * sample_count as f64 {
        return Verdict::no_match(NoMatchReason::Insufficient, samples);
    }

    Verdict::Match {
        name: name.clone(),
        votes: top,
        samples,
    }
}

/// Run one recognition session.
///
/// Frames without a usable face and samples whose embedding fails are
/// skipped and do not count toward `sample_count`. Cancellation and an empty
/// index both end in "no match". Progress counts frames processed, faceless
/// ones included; the verdict carries the sample count.
pub fn recognize(
    feed: &dyn FrameFeed,
    pipeline: &mut FacePipeline,
    index: &IndexStore,
    params: &RecognitionParams,
    cancel: &CancelFlag,
    progress: &mut dyn FnMut(Progress),
) -> Verdict {
    let _clear = ClearOnExit(feed);
    let target = params.sample_count;

    if index.is_empty() {
        tracing::warn!("recognition against an empty index");
        progress(Progress::failed(0, target, Phase::Done));
        return Verdict::no_match(NoMatchReason::EmptyIndex, 0);
    }

    progress(Progress::new(0, target, Phase::Starting));
    let deadline = Instant::now() + params.timeout;
    let mut votes: Vec<Vote> = Vec::with_capacity(target);
    let mut frames_seen = 0usize;

    while votes.len() < target {
        if cancel.is_cancelled() {
            tracing::info!(samples = votes.len(), "recognition cancelled");
            progress(Progress::failed(frames_seen, target, Phase::Done));
            return Verdict::no_match(NoMatchReason::Cancelled, votes.len());
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            tracing::info!(samples = votes.len(), target, "recognition time budget exhausted");
            break;
        }

        let Some(frame) = feed.next_frame(remaining.min(params.frame_timeout)) else {
            tracing::debug!("no frame within timeout");
            continue;
        };
        frames_seen += 1;

        if let Some(vote) = sample_vote(&frame, pipeline, index, params.similarity_threshold) {
            votes.push(vote);
        }
        progress(Progress::new(frames_seen, target, Phase::Capturing));
    }

    progress(Progress::new(frames_seen, target, Phase::Deciding));
    let verdict = tally(&votes, target, params.min_agreement);
    tracing::info!(frames = frames_seen, samples = votes.len(), ?verdict, "recognition finished");
    progress(Progress {
        error: !verdict.is_match(),
        ..Progress::new(frames_seen, target, Phase::Done)
    });
    verdict
}

/// Localize, embed and look up one frame. `None` when the frame yields no
/// usable sample.
fn sample_vote(frame: &Frame, pipeline: &mut FacePipeline, index: &IndexStore, threshold: f32) -> Option<Vote> {
    let face = pipeline.localize(frame)?;
    let embedding = pipeline.embed(&face)?;

    let vote = match index.search(&embedding, 1).into_iter().next() {
        Some(hit) if hit.score >= threshold => {
            tracing::debug!(seq = frame.sequence, name = %hit.name, score = hit.score, "sample matched");
            Vote::Identity(hit.name)
        }
        Some(hit) => {
            tracing::debug!(seq = frame.sequence, nearest = %hit.name, score = hit.score, "sample below threshold");
            Vote::Unknown
        }
        None => Vote::Unknown,
    };
    Some(vote)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::{basis, with_similarity, MarkerDetector, ScriptedEmbedder};
    use crate::quality::QualityGate;
    use crate::session::testing::{empty_frame, face_frame, ScriptedFeed};
    use crate::types::{Embedding, EMBEDDING_DIM};

    fn id(name: &str) -> Vote {
        Vote::Identity(name.to_string())
    }

    fn params(sample_count: usize) -> RecognitionParams {
        RecognitionParams {
            sample_count,
            similarity_threshold: 0.6,
            min_agreement: 0.25,
            timeout: Duration::from_secs(5),
            frame_timeout: Duration::from_millis(50),
        }
    }

    fn store_with(tmp: &tempfile::TempDir, names: &[(&str, Vec<f32>)]) -> IndexStore {
        let store = IndexStore::new(tmp.path(), "test", EMBEDDING_DIM);
        for (name, v) in names {
            store.add(&[Embedding::from_raw(v.clone()).unwrap()], name).unwrap();
        }
        store
    }

    fn pipeline(embedder: ScriptedEmbedder) -> FacePipeline {
        FacePipeline::new(Box::new(MarkerDetector), Box::new(embedder)).with_quality_gate(QualityGate::OPEN)
    }

    #[test]
    fn test_tally_clear_winner() {
        let votes = [id("A"), id("A"), id("A"), id("A"), Vote::Unknown];
        assert_eq!(
            tally(&votes, 5, 0.25),
            Verdict::Match {
                name: "A".into(),
                votes: 4,
                samples: 5
            }
        );
    }

    #[test]
    fn test_tally_tie_is_no_match() {
        let votes = [id("A"), id("B"), id("A"), id("B"), Vote::Unknown];
        assert_eq!(
            tally(&votes, 5, 0.25),
            Verdict::NoMatch {
                reason: NoMatchReason::Tie,
                samples: 5
            }
        );
    }

    #[test]
    fn test_tally_unknown_on_top() {
        let votes = [Vote::Unknown, Vote::Unknown, id("A")];
        assert!(matches!(
            tally(&votes, 3, 0.25),
            Verdict::NoMatch {
                reason: NoMatchReason::Unknown,
                ..
            }
        ));
    }

    #[test]
    fn test_tally_agreement_is_strict() {
        // 0.25 × 8 = 2: two votes are not enough, three are.
        let two = [id("A"), id("A")];
        assert!(matches!(
            tally(&two, 8, 0.25),
            Verdict::NoMatch {
                reason: NoMatchReason::Insufficient,
                ..
            }
        ));
        let three = [id("A"), id("A"), id("A")];
        assert!(tally(&three, 8, 0.25).is_match());
    }

    #[test]
    fn test_tally_no_votes() {
        assert!(matches!(
            tally(&[], 5, 0.25),
            Verdict::NoMatch {
                reason: NoMatchReason::NoSamples,
                samples: 0
            }
        ));
    }

    #[test]
    fn test_recognize_majority_match() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_with(&tmp, &[("A", basis(0))]);
        let embedder = ScriptedEmbedder::new([
            Some(with_similarity(0.8, 1)),
            Some(with_similarity(0.8, 2)),
            Some(with_similarity(0.3, 3)),
            Some(with_similarity(0.8, 4)),
            Some(with_similarity(0.8, 5)),
        ]);
        let feed = ScriptedFeed::new((0..5).map(face_frame));
        let mut reports = Vec::new();

        let verdict = recognize(
            &feed,
            &mut pipeline(embedder),
            &store,
            &params(5),
            &CancelFlag::new(),
            &mut |p| reports.push(p),
        );

        assert_eq!(
            verdict,
            Verdict::Match {
                name: "A".into(),
                votes: 4,
                samples: 5
            }
        );
        assert_eq!(feed.clears(), 1);
        let last = reports.last().unwrap();
        assert_eq!((last.count, last.target, last.phase, last.error), (5, 5, Phase::Done, false));
    }

    #[test]
    fn test_recognize_split_vote_is_no_match() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_with(&tmp, &[("A", basis(0)), ("B", basis(1))]);
        let embedder = ScriptedEmbedder::new([
            Some(basis(0)),
            Some(basis(1)),
            Some(basis(0)),
            Some(basis(1)),
            Some(basis(2)),
        ]);
        let feed = ScriptedFeed::new((0..5).map(face_frame));

        let verdict = recognize(
            &feed,
            &mut pipeline(embedder),
            &store,
            &params(5),
            &CancelFlag::new(),
            &mut |_| {},
        );
        assert_eq!(verdict.name(), None);
        assert!(matches!(
            verdict,
            Verdict::NoMatch {
                reason: NoMatchReason::Tie,
                samples: 5
            }
        ));
    }

    #[test]
    fn test_faceless_frames_do_not_count() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_with(&tmp, &[("A", basis(0))]);
        let embedder = ScriptedEmbedder::new((0..3).map(|_| Some(basis(0))));
        let frames = vec![
            empty_frame(0),
            face_frame(1),
            empty_frame(2),
            face_frame(3),
            empty_frame(4),
            face_frame(5),
        ];
        let feed = ScriptedFeed::new(frames);
        let mut reports = Vec::new();

        let verdict = recognize(
            &feed,
            &mut pipeline(embedder.clone()),
            &store,
            &params(3),
            &CancelFlag::new(),
            &mut |p| reports.push(p),
        );
        assert_eq!(
            verdict,
            Verdict::Match {
                name: "A".into(),
                votes: 3,
                samples: 3
            }
        );
        assert_eq!(feed.served(), 6);
        assert_eq!(embedder.calls(), 3);

        let capturing: Vec<usize> = reports
            .iter()
            .filter(|p| p.phase == Phase::Capturing)
            .map(|p| p.count)
            .collect();
        assert_eq!(capturing, vec![1, 2, 3, 4, 5, 6]);
        let last = reports.last().unwrap();
        assert_eq!((last.count, last.target, last.phase), (6, 3, Phase::Done));
    }

    #[test]
    fn test_failed_embedding_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_with(&tmp, &[("A", basis(0))]);
        let embedder = ScriptedEmbedder::new([Some(basis(0)), None, Some(basis(0))]);
        let feed = ScriptedFeed::new((0..3).map(face_frame));

        let verdict = recognize(
            &feed,
            &mut pipeline(embedder),
            &store,
            &params(2),
            &CancelFlag::new(),
            &mut |_| {},
        );
        assert_eq!(
            verdict,
            Verdict::Match {
                name: "A".into(),
                votes: 2,
                samples: 2
            }
        );
    }

    #[test]
    fn test_cancel_mid_session() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_with(&tmp, &[("A", basis(0))]);
        let embedder = ScriptedEmbedder::new((0..10).map(|_| Some(basis(0))));
        let cancel = CancelFlag::new();
        let feed = ScriptedFeed::new((0..10).map(face_frame)).cancel_after(3, cancel.clone());
        let mut reports = Vec::new();

        let verdict = recognize(
            &feed,
            &mut pipeline(embedder),
            &store,
            &params(10),
            &cancel,
            &mut |p| reports.push(p),
        );

        assert_eq!(
            verdict,
            Verdict::NoMatch {
                reason: NoMatchReason::Cancelled,
                samples: 3
            }
        );
        assert_eq!(feed.served(), 3);
        assert_eq!(feed.clears(), 1);
        assert!(reports.last().unwrap().error);
    }

    #[test]
    fn test_empty_index_short_circuits() {
        let tmp = tempfile::tempdir().unwrap();
        let store = IndexStore::new(tmp.path(), "test", EMBEDDING_DIM);
        let embedder = ScriptedEmbedder::default();
        let feed = ScriptedFeed::new((0..5).map(face_frame));
        let mut reports = Vec::new();

        let verdict = recognize(
            &feed,
            &mut pipeline(embedder.clone()),
            &store,
            &params(5),
            &CancelFlag::new(),
            &mut |p| reports.push(p),
        );

        assert_eq!(
            verdict,
            Verdict::NoMatch {
                reason: NoMatchReason::EmptyIndex,
                samples: 0
            }
        );
        assert_eq!(feed.served(), 0);
        assert_eq!(embedder.calls(), 0);
        assert_eq!(feed.clears(), 1);
        assert_eq!(reports, vec![Progress::failed(0, 5, Phase::Done)]);
    }

    #[test]
    fn test_time_budget_ends_session() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_with(&tmp, &[("A", basis(0))]);
        let embedder = ScriptedEmbedder::new([Some(basis(0))]);
        // One usable frame, then the feed runs dry.
        let feed = ScriptedFeed::new([face_frame(0)]);
        let mut p = params(4);
        p.timeout = Duration::from_millis(30);

        let verdict = recognize(&feed, &mut pipeline(embedder), &store, &p, &CancelFlag::new(), &mut |_| {});
        // 1 vote is not more than 0.25 × 4.
        assert_eq!(
            verdict,
            Verdict::NoMatch {
                reason: NoMatchReason::Insufficient,
                samples: 1
            }
        );
    }
}

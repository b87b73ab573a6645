//! Recognition and enrollment sessions.
//!
//! Both sessions pull frames from a [`FrameFeed`], run them through a
//! [`FacePipeline`](crate::pipeline::FacePipeline), and talk to an
//! [`IndexStore`](crate::index::IndexStore). They poll a [`CancelFlag`] once
//! per iteration and clear the feed on every exit path.

pub mod enrollment;
pub mod recognition;

pub use enrollment::{enroll, validate_name, EnrollmentError, EnrollmentParams, EnrollmentReport};
pub use recognition::{recognize, tally, NoMatchReason, RecognitionParams, Verdict, Vote};

use crate::types::Frame;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Blocking source of live frames, as seen by a session.
pub trait FrameFeed: Send + Sync {
    /// Wait up to `timeout` for a frame newer than the last one handed out.
    fn next_frame(&self, timeout: Duration) -> Option<Arc<Frame>>;

    /// Drop any queued frame so the next session starts fresh.
    fn clear(&self);
}

/// Cooperative cancellation shared between a session and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Re-arm the flag for the next session.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Starting,
    Capturing,
    Saving,
    Deciding,
    Done,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::Starting => "starting",
            Phase::Capturing => "capturing",
            Phase::Saving => "saving",
            Phase::Deciding => "deciding",
            Phase::Done => "done",
        }
    }
}

/// Side-channel progress report. Carries no decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Progress {
    pub count: usize,
    pub target: usize,
    pub phase: Phase,
    pub error: bool,
}

impl Progress {
    pub(crate) fn new(count: usize, target: usize, phase: Phase) -> Self {
        Self {
            count,
            target,
            phase,
            error: false,
        }
    }

    pub(crate) fn failed(count: usize, target: usize, phase: Phase) -> Self {
        Self {
            error: true,
            ..Self::new(count, target, phase)
        }
    }
}

/// Clears the feed when dropped.
struct ClearOnExit<'a>(&'a dyn FrameFeed);

impl Drop for ClearOnExit<'_> {
    fn drop(&mut self) {
        self.0.clear();
    }
}

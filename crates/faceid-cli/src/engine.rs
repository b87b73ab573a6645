//! Session engine: a dedicated OS thread that owns the face models and runs
//! one session at a time, driven through a cloneable async handle.

use crate::config::Config;
use faceid_core::detector::DetectorError;
use faceid_core::index::{IndexError, IndexStore, RebuildSource};
use faceid_core::recognizer::EmbedderError;
use faceid_core::session::{
    self, CancelFlag, EnrollmentError, EnrollmentParams, EnrollmentReport, FrameFeed, Progress, RecognitionParams,
    Verdict,
};
use faceid_core::{ArcFaceEmbedder, FacePipeline, ScrfdDetector};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedder error: {0}")]
    Embedder(#[from] EmbedderError),
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("enrollment failed: {0}")]
    Enrollment(#[from] EnrollmentError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Progress reports forwarded from the engine thread.
pub type ProgressSender = mpsc::UnboundedSender<Progress>;

/// Messages sent to the engine thread.
enum EngineRequest {
    Recognize {
        feed: Arc<dyn FrameFeed>,
        params: RecognitionParams,
        cancel: CancelFlag,
        progress: Option<ProgressSender>,
        reply: oneshot::Sender<Verdict>,
    },
    Enroll {
        feed: Arc<dyn FrameFeed>,
        name: String,
        params: EnrollmentParams,
        cancel: CancelFlag,
        progress: Option<ProgressSender>,
        reply: oneshot::Sender<Result<EnrollmentReport, EnrollmentError>>,
    },
    Rebuild {
        force: bool,
        reply: oneshot::Sender<Result<RebuildSource, IndexError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    index: Arc<IndexStore>,
}

impl EngineHandle {
    /// The index the engine reads and writes.
    pub fn index(&self) -> &Arc<IndexStore> {
        &self.index
    }

    /// Run a recognition session against `feed`.
    pub async fn recognize(
        &self,
        feed: Arc<dyn FrameFeed>,
        params: RecognitionParams,
        cancel: CancelFlag,
        progress: Option<ProgressSender>,
    ) -> Result<Verdict, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(EngineRequest::Recognize {
            feed,
            params,
            cancel,
            progress,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Run an enrollment session for `name` against `feed`.
    pub async fn enroll(
        &self,
        feed: Arc<dyn FrameFeed>,
        name: &str,
        params: EnrollmentParams,
        cancel: CancelFlag,
        progress: Option<ProgressSender>,
    ) -> Result<EnrollmentReport, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(EngineRequest::Enroll {
            feed,
            name: name.to_string(),
            params,
            cancel,
            progress,
            reply: reply_tx,
        })
        .await?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    /// Load the cache (or rescan disk); `force` always rescans.
    pub async fn rebuild(&self, force: bool) -> Result<RebuildSource, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(EngineRequest::Rebuild { force, reply: reply_tx }).await?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    async fn send(&self, request: EngineRequest) -> Result<(), EngineError> {
        self.tx.send(request).await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Load both ONNX models and spawn the engine. Fails fast if either model is
/// unavailable.
pub fn spawn_engine(config: &Config, index: Arc<IndexStore>) -> Result<EngineHandle, EngineError> {
    let detector = ScrfdDetector::load(&config.detector_model_path())?;
    let embedder = ArcFaceEmbedder::load(&config.embedder_model_path())?;
    let pipeline =
        FacePipeline::new(Box::new(detector), Box::new(embedder)).with_quality_gate(config.quality_gate());
    spawn_with_pipeline(pipeline, index)
}

/// Spawn the engine thread around an already-built pipeline.
pub fn spawn_with_pipeline(mut pipeline: FacePipeline, index: Arc<IndexStore>) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
    let store = Arc::clone(&index);

    std::thread::Builder::new()
        .name("faceid-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Recognize {
                        feed,
                        params,
                        cancel,
                        progress,
                        reply,
                    } => {
                        let verdict = session::recognize(
                            feed.as_ref(),
                            &mut pipeline,
                            &store,
                            &params,
                            &cancel,
                            &mut forward(progress),
                        );
                        let _ = reply.send(verdict);
                    }
                    EngineRequest::Enroll {
                        feed,
                        name,
                        params,
                        cancel,
                        progress,
                        reply,
                    } => {
                        let result = session::enroll(
                            feed.as_ref(),
                            &mut pipeline,
                            &store,
                            &name,
                            &params,
                            &cancel,
                            &mut forward(progress),
                        );
                        if let Err(e) = &result {
                            tracing::warn!(name = %name, error = %e, "enrollment failed");
                        }
                        let _ = reply.send(result);
                    }
                    EngineRequest::Rebuild { force, reply } => {
                        let result = if force {
                            store.rebuild_from_disk(&mut pipeline).map(RebuildSource::Disk)
                        } else {
                            store.rebuild(&mut pipeline)
                        };
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, index })
}

fn forward(progress: Option<ProgressSender>) -> impl FnMut(Progress) {
    move |p| {
        if let Some(tx) = &progress {
            let _ = tx.send(p);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faceid_core::alignment::REFERENCE_POINTS_112;
    use faceid_core::detector::FaceDetector;
    use faceid_core::recognizer::FaceEmbedder;
    use faceid_core::session::{NoMatchReason, Phase};
    use faceid_core::{AlignedFace, BoundingBox, Detection, Frame, Landmarks, Point, QualityGate, EMBEDDING_DIM};
    use image::{Rgb, RgbImage};
    use std::time::Duration;

    /// Finds one face at the canonical landmark positions in every frame.
    struct FixedDetector;

    impl FaceDetector for FixedDetector {
        fn detect(&mut self, _frame: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
            let [right_eye, left_eye, nose_tip] = REFERENCE_POINTS_112;
            Ok(vec![Detection {
                bbox: BoundingBox {
                    x1: 10.0,
                    y1: 10.0,
                    x2: 100.0,
                    y2: 100.0,
                    confidence: 0.9,
                },
                landmarks: Landmarks {
                    right_eye,
                    left_eye,
                    nose_tip,
                    mouth_center: Point::new(56.0, 92.0),
                    right_ear: None,
                    left_ear: None,
                },
            }])
        }
    }

    /// Every face embeds to the same vector.
    struct ConstantEmbedder;

    impl FaceEmbedder for ConstantEmbedder {
        fn embed(&mut self, _face: &AlignedFace) -> Result<Vec<f32>, EmbedderError> {
            let mut v = vec![0.0; EMBEDDING_DIM];
            v[0] = 1.0;
            Ok(v)
        }
    }

    /// An endless supply of identical frames.
    struct SteadyFeed;

    impl FrameFeed for SteadyFeed {
        fn next_frame(&self, _timeout: Duration) -> Option<Arc<Frame>> {
            Some(Arc::new(Frame::new(RgbImage::from_pixel(112, 112, Rgb([120, 100, 90])), 0)))
        }

        fn clear(&self) {}
    }

    fn engine(dir: &std::path::Path) -> EngineHandle {
        let pipeline = FacePipeline::new(Box::new(FixedDetector), Box::new(ConstantEmbedder))
            .with_quality_gate(QualityGate::OPEN);
        let index = Arc::new(IndexStore::new(dir, "test", EMBEDDING_DIM));
        spawn_with_pipeline(pipeline, index).unwrap()
    }

    fn quick_recognition() -> RecognitionParams {
        RecognitionParams {
            sample_count: 3,
            timeout: Duration::from_secs(2),
            frame_timeout: Duration::from_millis(50),
            ..RecognitionParams::default()
        }
    }

    #[tokio::test]
    async fn test_rebuild_empty_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let handle = engine(dir.path());
        let source = handle.rebuild(false).await.unwrap();
        assert!(matches!(source, RebuildSource::Disk(ref r) if r.identities == 0));
        assert!(handle.index().is_empty());
    }

    #[tokio::test]
    async fn test_recognize_empty_index() {
        let dir = tempfile::tempdir().unwrap();
        let handle = engine(dir.path());
        let verdict = handle
            .recognize(Arc::new(SteadyFeed), quick_recognition(), CancelFlag::new(), None)
            .await
            .unwrap();
        assert_eq!(
            verdict,
            Verdict::NoMatch {
                reason: NoMatchReason::EmptyIndex,
                samples: 0
            }
        );
    }

    #[tokio::test]
    async fn test_enroll_then_recognize() {
        let dir = tempfile::tempdir().unwrap();
        let handle = engine(dir.path());
        let feed: Arc<dyn FrameFeed> = Arc::new(SteadyFeed);
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();

        let params = EnrollmentParams {
            capture_target: 4,
            frame_timeout: Duration::from_millis(50),
            timeout: Some(Duration::from_secs(2)),
        };
        let report = handle
            .enroll(Arc::clone(&feed), "alice", params, CancelFlag::new(), Some(progress_tx))
            .await
            .unwrap();
        assert_eq!(report.samples, 4);
        assert_eq!(report.images_saved, 4);

        let mut last = None;
        while let Ok(p) = progress_rx.try_recv() {
            last = Some(p);
        }
        assert_eq!(last.map(|p| p.phase), Some(Phase::Done));

        let verdict = handle
            .recognize(feed, quick_recognition(), CancelFlag::new(), None)
            .await
            .unwrap();
        assert_eq!(verdict.name(), Some("alice"));

        // A fresh engine over the same directory loads the cache.
        let reopened = engine(dir.path());
        assert_eq!(reopened.rebuild(false).await.unwrap(), RebuildSource::Cache { slots: 1 });
        // Forced rebuild rescans the saved crops.
        let forced = reopened.rebuild(true).await.unwrap();
        assert!(matches!(forced, RebuildSource::Disk(ref r) if r.identities == 1 && r.images == 4));
    }

    #[tokio::test]
    async fn test_enroll_invalid_name() {
        let dir = tempfile::tempdir().unwrap();
        let handle = engine(dir.path());
        let result = handle
            .enroll(Arc::new(SteadyFeed), "..", EnrollmentParams::default(), CancelFlag::new(), None)
            .await;
        assert!(matches!(result, Err(EngineError::Enrollment(EnrollmentError::InvalidName(_)))));
    }

    #[tokio::test]
    async fn test_cancelled_recognition() {
        let dir = tempfile::tempdir().unwrap();
        let handle = engine(dir.path());
        handle
            .enroll(
                Arc::new(SteadyFeed),
                "bob",
                EnrollmentParams {
                    capture_target: 1,
                    ..EnrollmentParams::default()
                },
                CancelFlag::new(),
                None,
            )
            .await
            .unwrap();

        let cancel = CancelFlag::new();
        cancel.cancel();
        let verdict = handle
            .recognize(Arc::new(SteadyFeed), quick_recognition(), cancel, None)
            .await
            .unwrap();
        assert!(matches!(
            verdict,
            Verdict::NoMatch {
                reason: NoMatchReason::Cancelled,
                ..
            }
        ));
    }
}

//! Frame → aligned crop → unit-length embedding.
//!
//! Every external-capability failure is logged and turned into `None`, so the
//! callers can simply skip the sample.

use crate::alignment;
use crate::detector::FaceDetector;
use crate::quality::QualityGate;
use crate::recognizer::FaceEmbedder;
use crate::types::{AlignedFace, Embedding, Frame};
use image::RgbImage;

/// The localizer/aligner and embedding extractor, bundled for session use.
pub struct FacePipeline {
    detector: Box<dyn FaceDetector>,
    embedder: Box<dyn FaceEmbedder>,
    quality: QualityGate,
}

impl FacePipeline {
    pub fn new(detector: Box<dyn FaceDetector>, embedder: Box<dyn FaceEmbedder>) -> Self {
        Self {
            detector,
            embedder,
            quality: QualityGate::default(),
        }
    }

    pub fn with_quality_gate(mut self, quality: QualityGate) -> Self {
        self.quality = quality;
        self
    }

    /// Gate, detect and align a live camera frame.
    pub fn localize(&mut self, frame: &Frame) -> Option<AlignedFace> {
        if let Err(rejection) = self.quality.check(frame) {
            tracing::debug!(seq = frame.sequence, ?rejection, "frame rejected by quality gate");
            return None;
        }
        self.localize_image(&frame.image)
    }

    /// Detect and align a still image. The first detection wins.
    pub fn localize_image(&mut self, image: &RgbImage) -> Option<AlignedFace> {
        let detections = match self.detector.detect(image) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, "face detection failed; skipping frame");
                return None;
            }
        };

        let detection = detections.first()?;
        match alignment::align_face(image, &detection.landmarks) {
            Ok(face) => Some(face),
            Err(e) => {
                tracing::debug!(error = %e, "alignment failed; skipping frame");
                None
            }
        }
    }

    /// Extract and L2-normalize an embedding.
    pub fn embed(&mut self, face: &AlignedFace) -> Option<Embedding> {
        let raw = match self.embedder.embed(face) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "embedding failed; skipping sample");
                return None;
            }
        };

        let embedding = Embedding::from_raw(raw);
        if embedding.is_none() {
            tracing::warn!("embedder returned a zero or non-finite vector; skipping sample");
        }
        embedding
    }
}

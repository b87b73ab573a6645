//! Face detection capability and its SCRFD adapter.
//!
//! The engine only depends on [`FaceDetector`]. [`ScrfdDetector`] implements it
//! with the SCRFD model (3-stride anchor-free decoding and NMS) on ONNX Runtime.

use crate::types::{BoundingBox, Detection, Landmarks, Point};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Capability: locate faces and their landmarks in a frame.
pub trait FaceDetector: Send {
    /// Zero or more detections, most confident first.
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<Detection>, DetectorError>;
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl LetterboxInfo {
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// A decoded anchor before NMS. SCRFD keypoints are ordered
/// [image-left eye, image-right eye, nose, left mouth corner, right mouth corner].
#[derive(Debug, Clone)]
struct Candidate {
    bbox: BoundingBox,
    kps: [(f32, f32); 5],
}

impl Candidate {
    fn into_detection(self) -> Detection {
        let p = |i: usize| Point::new(self.kps[i].0, self.kps[i].1);
        let mouth_center = Point::new(
            (self.kps[3].0 + self.kps[4].0) / 2.0,
            (self.kps[3].1 + self.kps[4].1) / 2.0,
        );
        Detection {
            bbox: self.bbox,
            landmarks: Landmarks {
                // The subject's right eye is on the image's left.
                right_eye: p(0),
                left_eye: p(1),
                nose_tip: p(2),
                mouth_center,
                right_ear: None,
                left_ear: None,
            },
        }
    }
}

/// Output tensor indices for one stride: (score_idx, bbox_idx, kps_idx).
type StrideOutputIndices = (usize, usize, usize);

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
    /// Per-stride output indices for strides [8, 16, 32].
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        tracing::info!(path = %model_path.display(), outputs = ?output_names, "loaded SCRFD model");

        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            stride_indices,
        })
    }

    /// Letterbox an RGB frame into a normalized NCHW tensor.
    fn preprocess(frame: &RgbImage) -> (Array4<f32>, LetterboxInfo) {
        let (width, height) = (frame.width() as usize, frame.height() as usize);
        let size = SCRFD_INPUT_SIZE;

        let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as usize).min(size);
        let new_h = ((height as f32 * scale).round() as usize).min(size);
        let pad_x = (size - new_w) as f32 / 2.0;
        let pad_y = (size - new_h) as f32 / 2.0;
        let letterbox = LetterboxInfo { scale, pad_x, pad_y };

        // Padding normalizes to 0.0.
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        if width == 0 || height == 0 {
            return (tensor, letterbox);
        }

        let x_start = pad_x.floor() as usize;
        let y_start = pad_y.floor() as usize;
        let inv_scale = 1.0 / scale;

        for y in 0..new_h {
            let src_y = (y as f32 + 0.5) * inv_scale - 0.5;
            let y0 = (src_y.floor() as i64).clamp(0, height as i64 - 1) as u32;
            let y1 = (y0 + 1).min(height as u32 - 1);
            let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

            for x in 0..new_w {
                let src_x = (x as f32 + 0.5) * inv_scale - 0.5;
                let x0 = (src_x.floor() as i64).clamp(0, width as i64 - 1) as u32;
                let x1 = (x0 + 1).min(width as u32 - 1);
                let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

                let tl = frame.get_pixel(x0, y0).0;
                let tr = frame.get_pixel(x1, y0).0;
                let bl = frame.get_pixel(x0, y1).0;
                let br = frame.get_pixel(x1, y1).0;

                for c in 0..3 {
                    let val = tl[c] as f32 * (1.0 - fx) * (1.0 - fy)
                        + tr[c] as f32 * fx * (1.0 - fy)
                        + bl[c] as f32 * (1.0 - fx) * fy
                        + br[c] as f32 * fx * fy;
                    tensor[[0, c, y + y_start, x + x_start]] = (val - SCRFD_MEAN) / SCRFD_STD;
                }
            }
        }

        (tensor, letterbox)
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        let (input, letterbox) = Self::preprocess(frame);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;
            let (_, kps) = outputs[kps_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("kps stride {stride}: {e}")))?;

            candidates.extend(decode_stride(scores, bboxes, kps, stride, &letterbox));
        }

        Ok(nms(candidates, SCRFD_NMS_THRESHOLD)
            .into_iter()
            .map(Candidate::into_detection)
            .collect())
    }
}

/// Map SCRFD output tensors to stride slots.
///
/// Uses "score_8" / "bbox_16" / "kps_32" style names when present, otherwise
/// the standard positional ordering [scores 8/16/32, bboxes 8/16/32, kps 8/16/32].
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?, find("kps", s)?)))
        .collect();

    match named {
        Some(v) => [v[0], v[1], v[2]],
        None => {
            tracing::info!(?names, "SCRFD: output names not recognized, using positional mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Decode candidates for a single stride level.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &LetterboxInfo,
) -> Vec<Candidate> {
    let grid_w = SCRFD_INPUT_SIZE / stride;
    let grid_h = SCRFD_INPUT_SIZE / stride;
    let num_anchors = grid_h * grid_w * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    let mut out = Vec::new();
    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= SCRFD_CONFIDENCE_THRESHOLD {
            continue;
        }

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_x = (cell % grid_w) as f32 * s;
        let anchor_y = (cell / grid_w) as f32 * s;

        let (Some(b), Some(k)) = (bboxes.get(idx * 4..idx * 4 + 4), kps.get(idx * 10..idx * 10 + 10)) else {
            continue;
        };

        let (x1, y1) = letterbox.unmap(anchor_x - b[0] * s, anchor_y - b[1] * s);
        let (x2, y2) = letterbox.unmap(anchor_x + b[2] * s, anchor_y + b[3] * s);
        let kps: [(f32, f32); 5] =
            std::array::from_fn(|i| letterbox.unmap(anchor_x + k[i * 2] * s, anchor_y + k[i * 2 + 1] * s));

        out.push(Candidate {
            bbox: BoundingBox {
                x1,
                y1,
                x2,
                y2,
                confidence: score,
            },
            kps,
        });
    }

    out
}

/// Non-Maximum Suppression. Output is sorted by confidence, highest first.
fn nms(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.bbox.confidence.total_cmp(&a.bbox.confidence));

    let mut keep: Vec<Candidate> = Vec::new();
    for c in candidates {
        if keep.iter().all(|k| iou(&k.bbox, &c.bbox) <= iou_threshold) {
            keep.push(c);
        }
    }
    keep
}

/// Intersection-over-Union between two boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let inter_h = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(x: f32, y: f32, w: f32, h: f32, conf: f32) -> Candidate {
        Candidate {
            bbox: BoundingBox {
                x1: x,
                y1: y,
                x2: x + w,
                y2: y + h,
                confidence: conf,
            },
            kps: [(0.0, 0.0); 5],
        }
    }

    #[test]
    fn test_iou_identical() {
        let a = candidate(0.0, 0.0, 100.0, 100.0, 1.0).bbox;
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = candidate(0.0, 0.0, 10.0, 10.0, 1.0).bbox;
        let b = candidate(5.0, 0.0, 10.0, 10.0, 1.0).bbox;
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let result = nms(
            vec![
                candidate(5.0, 5.0, 100.0, 100.0, 0.8),
                candidate(0.0, 0.0, 100.0, 100.0, 0.9),
                candidate(200.0, 200.0, 50.0, 50.0, 0.7),
            ],
            0.4,
        );
        assert_eq!(result.len(), 2);
        assert!((result[0].bbox.confidence - 0.9).abs() < 1e-6);
        assert!((result[1].bbox.confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_candidate_landmark_naming() {
        let mut c = candidate(0.0, 0.0, 10.0, 10.0, 0.9);
        c.kps = [(30.0, 40.0), (70.0, 40.0), (50.0, 60.0), (35.0, 80.0), (65.0, 82.0)];
        let d = c.into_detection();
        assert_eq!(d.landmarks.right_eye, Point::new(30.0, 40.0));
        assert_eq!(d.landmarks.left_eye, Point::new(70.0, 40.0));
        assert_eq!(d.landmarks.nose_tip, Point::new(50.0, 60.0));
        assert_eq!(d.landmarks.mouth_center, Point::new(50.0, 81.0));
        assert!(d.landmarks.right_ear.is_none());
    }

    #[test]
    fn test_letterbox_unmap_roundtrip() {
        let (w, h) = (320.0f32, 240.0f32);
        let scale = (640.0 / w).min(640.0 / h);
        let letterbox = LetterboxInfo {
            scale,
            pad_x: (640.0 - (w * scale).round()) / 2.0,
            pad_y: (640.0 - (h * scale).round()) / 2.0,
        };
        let (x, y) = letterbox.unmap(100.0 * scale + letterbox.pad_x, 50.0 * scale + letterbox.pad_y);
        assert!((x - 100.0).abs() < 0.1, "x: {x}");
        assert!((y - 50.0).abs() < 0.1, "y: {y}");
    }

    #[test]
    fn test_preprocess_pads_to_zero() {
        // 640×320 letterboxes with 160 rows of padding top and bottom.
        let frame = RgbImage::from_pixel(640, 320, image::Rgb([255, 0, 128]));
        let (tensor, letterbox) = ScrfdDetector::preprocess(&frame);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert!((letterbox.pad_y - 160.0).abs() < 1e-6);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        assert!((tensor[[0, 0, 320, 320]] - (255.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-4);
        assert!((tensor[[0, 1, 320, 320]] - (0.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-4);
    }

    #[test]
    fn test_discover_output_indices_named() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32", "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let indices = discover_output_indices(&names);
        assert_eq!(indices, [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);
    }

    #[test]
    fn test_discover_output_indices_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(discover_output_indices(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }
}

use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Dimension of the face embeddings produced by the recognition model.
pub const EMBEDDING_DIM: usize = 512;

/// Side length of the canonical aligned face crop.
pub const ALIGNED_SIZE: u32 = 112;

/// A captured camera frame, converted to packed RGB.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub timestamp: Instant,
    /// Capture sequence number, monotonic per frame source.
    pub sequence: u32,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u32) -> Self {
        Self {
            image,
            timestamp: Instant::now(),
            sequence,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Luma plane (BT.601 weights), one byte per pixel.
    pub fn luma(&self) -> Vec<u8> {
        self.image
            .pixels()
            .map(|p| {
                let [r, g, b] = p.0;
                (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32)
                    .round()
                    .clamp(0.0, 255.0) as u8
            })
            .collect()
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        let luma = self.luma();
        if luma.is_empty() {
            return 0.0;
        }
        luma.iter().map(|&b| b as f32).sum::<f32>() / luma.len() as f32
    }
}

/// A 2D point in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Named facial landmarks reported by a detector.
///
/// "Right" and "left" are from the subject's point of view, so the right eye
/// appears on the image's left side for a frontal face.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Landmarks {
    pub right_eye: Point,
    pub left_eye: Point,
    pub nose_tip: Point,
    pub mouth_center: Point,
    /// Not every detector model reports ear tragions.
    pub right_ear: Option<Point>,
    pub left_ear: Option<Point>,
}

/// Axis-aligned face box in frame coordinates, `(x1, y1)` top-left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }
}

/// One detected face: its box and landmarks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub landmarks: Landmarks,
}

/// A face crop warped into the canonical 112×112 geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedFace(RgbImage);

impl AlignedFace {
    /// Wrap an image that is already a canonical crop. Returns `None` when the
    /// dimensions are not 112×112.
    pub fn from_image(image: RgbImage) -> Option<Self> {
        (image.dimensions() == (ALIGNED_SIZE, ALIGNED_SIZE)).then_some(Self(image))
    }

    pub(crate) fn from_canonical(image: RgbImage) -> Self {
        debug_assert_eq!(image.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
        Self(image)
    }

    pub fn image(&self) -> &RgbImage {
        &self.0
    }

    pub fn into_image(self) -> RgbImage {
        self.0
    }
}

/// Unit-length face embedding. Inner product between two embeddings is their
/// cosine similarity. Serialized as a plain array; deserialization goes
/// through [`Embedding::from_raw`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    /// L2-normalize a raw model output.
    ///
    /// Returns `None` for empty, all-zero or non-finite vectors, which cannot
    /// be normalized.
    pub fn from_raw(mut values: Vec<f32>) -> Option<Self> {
        let norm = l2_norm(&values);
        if values.is_empty() || !norm.is_finite() || norm <= f32::EPSILON {
            return None;
        }
        for v in values.iter_mut() {
            *v /= norm;
        }
        Some(Self { values })
    }

    /// Mean of `samples`, renormalized to unit length.
    ///
    /// Returns `None` for an empty slice, mismatched dimensions, or a mean that
    /// collapses to zero.
    pub fn centroid(samples: &[Embedding]) -> Option<Self> {
        let dim = samples.first()?.dim();
        if samples.iter().any(|s| s.dim() != dim) {
            return None;
        }

        let mut sum = vec![0.0f64; dim];
        for sample in samples {
            for (acc, &v) in sum.iter_mut().zip(&sample.values) {
                *acc += v as f64;
            }
        }
        let n = samples.len() as f64;
        Self::from_raw(sum.into_iter().map(|v| (v / n) as f32).collect())
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn into_values(self) -> Vec<f32> {
        self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn norm(&self) -> f32 {
        l2_norm(&self.values)
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum()
    }
}

impl TryFrom<Vec<f32>> for Embedding {
    type Error = &'static str;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Self::from_raw(values).ok_or("embedding is empty, zero or not finite")
    }
}

impl From<Embedding> for Vec<f32> {
    fn from(embedding: Embedding) -> Self {
        embedding.values
    }
}

pub(crate) fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|x| x * x).sum::<f32>().sqrt()
}

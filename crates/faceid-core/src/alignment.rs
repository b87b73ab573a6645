//! Face alignment via a three-point affine transform.
//!
//! Maps the right eye, left eye and nose tip of a detected face onto fixed
//! positions in a 112×112 canvas, then resamples the frame through that
//! transform. The target coordinates are shared with the embedding model.

use crate::types::{AlignedFace, Landmarks, Point, ALIGNED_SIZE};
use image::{Rgb, RgbImage};
use thiserror::Error;

/// Canonical landmark targets for a 112×112 output.
pub const REFERENCE_POINTS_112: [Point; 3] = [
    Point::new(38.2946, 51.6963), // right eye
    Point::new(73.5318, 51.5014), // left eye
    Point::new(56.0252, 71.7366), // nose tip
];

/// Fill value for output pixels that map outside the source frame.
const BORDER: Rgb<u8> = Rgb([0, 0, 0]);

/// Minimum |2·area| of the source triangle relative to its longest squared side.
const MIN_RELATIVE_AREA: f64 = 1e-6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlignError {
    #[error("landmarks are collinear or coincident; no unique affine transform")]
    Degenerate,
    #[error("landmark coordinates are not finite")]
    NonFinite,
}

/// A 2×3 affine matrix:
/// ```text
/// | a  b  c |
/// | d  e  f |
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTransform {
    m: [f64; 6],
}

impl AffineTransform {
    pub const IDENTITY: Self = Self {
        m: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
    };

    /// Solve the unique affine transform taking each `src[i]` to `dst[i]`.
    pub fn from_points(src: &[Point; 3], dst: &[Point; 3]) -> Result<Self, AlignError> {
        if src
            .iter()
            .chain(dst.iter())
            .any(|p| !p.x.is_finite() || !p.y.is_finite())
        {
            return Err(AlignError::NonFinite);
        }

        let s = src.map(|p| (p.x as f64, p.y as f64));
        if is_degenerate(&s) {
            return Err(AlignError::Degenerate);
        }

        // Each output axis is an independent 3×3 system sharing one matrix:
        //   [sx sy 1] · [a b c]^T = dx
        //   [sx sy 1] · [d e f]^T = dy
        let a = s.map(|(x, y)| [x, y, 1.0]);
        let row_x = solve_3x3(a, dst.map(|p| p.x as f64)).ok_or(AlignError::Degenerate)?;
        let row_y = solve_3x3(a, dst.map(|p| p.y as f64)).ok_or(AlignError::Degenerate)?;

        Ok(Self {
            m: [row_x[0], row_x[1], row_x[2], row_y[0], row_y[1], row_y[2]],
        })
    }

    pub fn coefficients(&self) -> [f64; 6] {
        self.m
    }

    pub fn apply(&self, p: Point) -> Point {
        let (x, y) = self.apply_f64(p.x as f64, p.y as f64);
        Point::new(x as f32, y as f32)
    }

    fn apply_f64(&self, x: f64, y: f64) -> (f64, f64) {
        let [a, b, c, d, e, f] = self.m;
        (a * x + b * y + c, d * x + e * y + f)
    }

    /// Inverse transform, or `None` if the linear part is singular.
    pub fn inverse(&self) -> Option<Self> {
        let [a, b, c, d, e, f] = self.m;
        let det = a * e - b * d;
        if det.abs() < 1e-12 {
            return None;
        }
        Some(Self {
            m: [
                e / det,
                -b / det,
                (b * f - c * e) / det,
                -d / det,
                a / det,
                (c * d - a * f) / det,
            ],
        })
    }
}

/// True if the three points are (numerically) collinear or coincident.
fn is_degenerate(p: &[(f64, f64); 3]) -> bool {
    let (x0, y0) = p[0];
    let (x1, y1) = p[1];
    let (x2, y2) = p[2];

    let area2 = (x1 - x0) * (y2 - y0) - (x2 - x0) * (y1 - y0);
    let sq = |ax: f64, ay: f64, bx: f64, by: f64| (ax - bx).powi(2) + (ay - by).powi(2);
    let longest = sq(x0, y0, x1, y1)
        .max(sq(x1, y1, x2, y2))
        .max(sq(x0, y0, x2, y2));

    longest <= f64::EPSILON || area2.abs() <= MIN_RELATIVE_AREA * longest
}

/// Solve a 3×3 linear system via Gaussian elimination with partial pivoting.
#[allow(clippy::needless_range_loop)]
fn solve_3x3(a: [[f64; 3]; 3], b: [f64; 3]) -> Option<[f64; 3]> {
    let mut m = [[0.0f64; 4]; 3];
    for i in 0..3 {
        m[i][..3].copy_from_slice(&a[i]);
        m[i][3] = b[i];
    }

    for col in 0..3 {
        let mut max_row = col;
        for row in (col + 1)..3 {
            if m[row][col].abs() > m[max_row][col].abs() {
                max_row = row;
            }
        }
        m.swap(col, max_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return None;
        }

        for row in (col + 1)..3 {
            let factor = m[row][col] / pivot;
            for j in col..4 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f64; 3];
    for i in (0..3).rev() {
        x[i] = m[i][3];
        for j in (i + 1)..3 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }

    Some(x)
}

/// Resample `frame` through `transform` into an `out_size`×`out_size` image.
///
/// Uses bilinear interpolation. Samples outside the frame take the border
/// color. Returns `None` if the transform is not invertible.
pub fn warp_affine(frame: &RgbImage, transform: &AffineTransform, out_size: u32) -> Option<RgbImage> {
    let inv = transform.inverse()?;
    let (w, h) = (frame.width() as i64, frame.height() as i64);

    let sample = |x: i64, y: i64| -> [f32; 3] {
        let px = if x >= 0 && x < w && y >= 0 && y < h {
            frame.get_pixel(x as u32, y as u32)
        } else {
            &BORDER
        };
        px.0.map(|c| c as f32)
    };

    let mut output = RgbImage::from_pixel(out_size, out_size, BORDER);
    for (ox, oy, out_px) in output.enumerate_pixels_mut() {
        let (sx, sy) = inv.apply_f64(ox as f64, oy as f64);

        let x0 = sx.floor() as i64;
        let y0 = sy.floor() as i64;
        let fx = (sx - x0 as f64) as f32;
        let fy = (sy - y0 as f64) as f32;

        let tl = sample(x0, y0);
        let tr = sample(x0 + 1, y0);
        let bl = sample(x0, y0 + 1);
        let br = sample(x0 + 1, y0 + 1);

        for c in 0..3 {
            let val = tl[c] * (1.0 - fx) * (1.0 - fy)
                + tr[c] * fx * (1.0 - fy)
                + bl[c] * (1.0 - fx) * fy
                + br[c] * fx * fy;
            out_px.0[c] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    Some(output)
}

/// Align a detected face to the canonical 112×112 crop.
///
/// Only the right eye, left eye and nose tip take part in the solve.
pub fn align_face(frame: &RgbImage, landmarks: &Landmarks) -> Result<AlignedFace, AlignError> {
    let src = [landmarks.right_eye, landmarks.left_eye, landmarks.nose_tip];
    let transform = AffineTransform::from_points(&src, &REFERENCE_POINTS_112)?;
    let warped = warp_affine(frame, &transform, ALIGNED_SIZE).ok_or(AlignError::Degenerate)?;
    Ok(AlignedFace::from_canonical(warped))
}

//! Frame quality gate: reject frames too dark, too bright or too blurry to be
//! worth a detector call.

use crate::types::Frame;

/// Why a frame was rejected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rejection {
    TooDark(f32),
    TooBright(f32),
    Blurry(f32),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityGate {
    pub min_brightness: f32,
    pub max_brightness: f32,
    /// Minimum variance of the Laplacian of the luma plane. 0 disables the check.
    pub blur_threshold: f32,
}

impl Default for QualityGate {
    fn default() -> Self {
        Self {
            min_brightness: 15.0,
            max_brightness: 240.0,
            blur_threshold: 20.0,
        }
    }
}

impl QualityGate {
    /// Accepts every frame.
    pub const OPEN: Self = Self {
        min_brightness: 0.0,
        max_brightness: 255.0,
        blur_threshold: 0.0,
    };

    pub fn check(&self, frame: &Frame) -> Result<(), Rejection> {
        let luma = frame.luma();
        let brightness = if luma.is_empty() {
            0.0
        } else {
            luma.iter().map(|&b| b as f32).sum::<f32>() / luma.len() as f32
        };

        if brightness < self.min_brightness {
            return Err(Rejection::TooDark(brightness));
        }
        if brightness > self.max_brightness {
            return Err(Rejection::TooBright(brightness));
        }
        if self.blur_threshold > 0.0 {
            let focus = laplacian_variance(&luma, frame.width() as usize, frame.height() as usize);
            if focus < self.blur_threshold {
                return Err(Rejection::Blurry(focus));
            }
        }
        Ok(())
    }
}

/// Variance of the 4-neighbour Laplacian over the interior pixels.
pub fn laplacian_variance(gray: &[u8], width: usize, height: usize) -> f32 {
    if width < 3 || height < 3 || gray.len() < width * height {
        return 0.0;
    }

    let at = |x: usize, y: usize| gray[y * width + x] as f64;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut n = 0usize;

    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let lap = at(x - 1, y) + at(x + 1, y) + at(x, y - 1) + at(x, y + 1) - 4.0 * at(x, y);
            sum += lap;
            sum_sq += lap * lap;
            n += 1;
        }
    }

    let mean = sum / n as f64;
    (sum_sq / n as f64 - mean * mean).max(0.0) as f32
}

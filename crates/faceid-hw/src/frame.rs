//! Pixel format conversion: raw V4L2 buffers to packed RGB.

use image::{ImageFormat, Rgb, RgbImage};

/// Camera pixel formats the capture path understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// 8-bit grayscale (1 byte/pixel, native IR camera output).
    Grey,
    /// 16-bit little-endian grayscale (2 bytes/pixel).
    Y16,
    /// Motion JPEG, one complete JPEG per buffer.
    Mjpg,
}

impl PixelFormat {
    pub fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Grey),
            b"Y16 " | b"Y16\0" => Some(Self::Y16),
            b"MJPG" => Some(Self::Mjpg),
            _ => None,
        }
    }

    /// Decode one buffer of this format into an RGB image.
    pub fn to_rgb(self, buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
        match self {
            Self::Yuyv => yuyv_to_rgb(buf, width, height),
            Self::Grey => grey_to_rgb(buf, width, height),
            Self::Y16 => y16_to_rgb(buf, width, height),
            Self::Mjpg => mjpeg_to_rgb(buf),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("decode failed: {0}")]
    Decode(#[from] image::ImageError),
}

fn check_len(buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// BT.601 limited-range YCbCr to RGB.
fn ycbcr_to_rgb(y: u8, cb: u8, cr: u8) -> Rgb<u8> {
    let c = (y as f32 - 16.0) * 1.164;
    let d = cb as f32 - 128.0;
    let e = cr as f32 - 128.0;
    let r = c + 1.596 * e;
    let g = c - 0.392 * d - 0.813 * e;
    let b = c + 2.017 * d;
    Rgb([
        r.round().clamp(0.0, 255.0) as u8,
        g.round().clamp(0.0, 255.0) as u8,
        b.round().clamp(0.0, 255.0) as u8,
    ])
}

/// Convert packed YUYV (4:2:2) to RGB.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share
/// the chroma pair.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len(yuyv, pixels * 2)?;

    let mut out = Vec::with_capacity(pixels * 3);
    for chunk in yuyv[..pixels * 2].chunks_exact(4) {
        let [y0, u, y1, v] = [chunk[0], chunk[1], chunk[2], chunk[3]];
        out.extend_from_slice(&ycbcr_to_rgb(y0, u, v).0);
        out.extend_from_slice(&ycbcr_to_rgb(y1, u, v).0);
    }
    // Odd pixel count: the last pixel has no partner.
    if pixels % 2 == 1 {
        let y = yuyv[pixels * 2 - 2];
        out.extend_from_slice(&[y, y, y]);
    }

    Ok(RgbImage::from_raw(width, height, out).expect("buffer sized to width * height * 3"))
}

/// Replicate an 8-bit grayscale plane into three channels.
pub fn grey_to_rgb(gray: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len(gray, pixels)?;
    Ok(RgbImage::from_fn(width, height, |x, y| {
        let v = gray[(y * width + x) as usize];
        Rgb([v, v, v])
    }))
}

/// 16-bit little-endian grayscale, keeping the high byte.
pub fn y16_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len(buf, pixels * 2)?;
    Ok(RgbImage::from_fn(width, height, |x, y| {
        let idx = (y * width + x) as usize * 2;
        let value = u16::from_le_bytes([buf[idx], buf[idx + 1]]);
        let v = (value >> 8) as u8;
        Rgb([v, v, v])
    }))
}

/// Decode one MJPG buffer.
pub fn mjpeg_to_rgb(jpeg: &[u8]) -> Result<RgbImage, FrameError> {
    Ok(image::load_from_memory_with_format(jpeg, ImageFormat::Jpeg)?.to_rgb8())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_fourcc_mapping() {
        assert_eq!(PixelFormat::from_fourcc(b"YUYV"), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(b"GREY"), Some(PixelFormat::Grey));
        assert_eq!(PixelFormat::from_fourcc(b"Y16 "), Some(PixelFormat::Y16));
        assert_eq!(PixelFormat::from_fourcc(b"MJPG"), Some(PixelFormat::Mjpg));
        assert_eq!(PixelFormat::from_fourcc(b"NV12"), None);
    }

    #[test]
    fn test_yuyv_neutral_chroma_is_gray() {
        // 2x1: [Y0=16 (black), U=128, Y1=235 (white), V=128]
        let img = yuyv_to_rgb(&[16, 128, 235, 128], 2, 1).unwrap();
        assert_eq!(img.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(img.get_pixel(1, 0).0, [255, 255, 255]);
    }

    #[test]
    fn test_yuyv_red_chroma() {
        let img = yuyv_to_rgb(&[81, 90, 81, 240], 2, 1).unwrap();
        let [r, g, b] = img.get_pixel(0, 0).0;
        assert!(r > 200 && g < 40 && b < 40, "got {r},{g},{b}");
    }

    #[test]
    fn test_yuyv_4x2_dimensions() {
        let yuyv: Vec<u8> = (0..16).map(|i| 100 + i).collect();
        let img = yuyv_to_rgb(&yuyv, 4, 2).unwrap();
        assert_eq!(img.dimensions(), (4, 2));
    }

    #[test]
    fn test_yuyv_invalid_length() {
        assert!(matches!(
            yuyv_to_rgb(&[100, 128], 2, 1),
            Err(FrameError::InvalidLength { expected: 4, actual: 2 })
        ));
    }

    #[test]
    fn test_grey_replicated() {
        let img = grey_to_rgb(&[10, 20, 30, 40], 2, 2).unwrap();
        assert_eq!(img.get_pixel(1, 1).0, [40, 40, 40]);
        assert!(grey_to_rgb(&[1, 2, 3], 2, 2).is_err());
    }

    #[test]
    fn test_y16_keeps_high_byte() {
        // 0x1234 little-endian, 0xFF00
        let img = y16_to_rgb(&[0x34, 0x12, 0x00, 0xFF], 2, 1).unwrap();
        assert_eq!(img.get_pixel(0, 0).0, [0x12; 3]);
        assert_eq!(img.get_pixel(1, 0).0, [0xFF; 3]);
    }

    #[test]
    fn test_mjpeg_decode() {
        let src = RgbImage::from_pixel(8, 8, Rgb([120, 60, 30]));
        let mut jpeg = Vec::new();
        src.write_to(&mut Cursor::new(&mut jpeg), ImageFormat::Jpeg).unwrap();

        let img = PixelFormat::Mjpg.to_rgb(&jpeg, 0, 0).unwrap();
        assert_eq!(img.dimensions(), (8, 8));
        let [r, g, b] = img.get_pixel(4, 4).0;
        assert!((r as i32 - 120).abs() < 8 && (g as i32 - 60).abs() < 8 && (b as i32 - 30).abs() < 8);
    }

    #[test]
    fn test_mjpeg_garbage() {
        assert!(matches!(mjpeg_to_rgb(b"not a jpeg"), Err(FrameError::Decode(_))));
    }
}

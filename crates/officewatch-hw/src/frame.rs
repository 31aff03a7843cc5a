//! Grayscale frame type and raw-buffer conversion.

use std::time::Instant;

/// Fraction of near-black pixels above which a frame counts as dark.
pub const DARK_FRAME_RATIO: f32 = 0.95;
/// Pixels below this value are "near-black".
const DARK_PIXEL_MAX: u8 = 32;

/// A captured grayscale camera frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    /// Wrap a grayscale buffer, computing the dark flag.
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        let is_dark = is_dark_frame(&data, DARK_FRAME_RATIO);
        Ok(Self {
            data,
            width,
            height,
            timestamp: Instant::now(),
            sequence,
            is_dark,
        })
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }
}

/// Packed YUYV 4:2:2 to grayscale: keep the Y byte of each `[Y0, U, Y1, V]` group.
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = width as usize * height as usize * 2;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// 16-bit little-endian grayscale to 8-bit, keeping the high byte.
pub fn y16_to_grayscale(y16: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = width as usize * height as usize * 2;
    if y16.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: y16.len(),
        });
    }
    Ok(y16[..expected].chunks_exact(2).map(|px| px[1]).collect())
}

/// First `width * height` bytes of an 8-bit grayscale buffer.
pub fn grey_to_grayscale(grey: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = width as usize * height as usize;
    if grey.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: grey.len(),
        });
    }
    Ok(grey[..expected].to_vec())
}

/// Decode one Motion-JPEG buffer to grayscale. The decoded size must match the
/// negotiated format.
pub fn mjpeg_to_grayscale(jpeg: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let decoded = image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg)
        .map_err(|e| FrameError::Decode(e.to_string()))?
        .to_luma8();
    if decoded.width() != width || decoded.height() != height {
        return Err(FrameError::SizeMismatch {
            expected: (width, height),
            actual: (decoded.width(), decoded.height()),
        });
    }
    Ok(decoded.into_raw())
}

/// True if more than `threshold_pct` of the pixels are near-black. Empty frames are dark.
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark = gray.iter().filter(|&&p| p < DARK_PIXEL_MAX).count();
    (dark as f32 / gray.len() as f32) > threshold_pct
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("MJPEG decode failed: {0}")]
    Decode(String),
    #[error("decoded frame is {actual:?}, negotiated {expected:?}")]
    SizeMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_to_grayscale() {
        // 2x1: [Y0=100, U, Y1=200, V]
        assert_eq!(yuyv_to_grayscale(&[100, 128, 200, 128], 2, 1).unwrap(), vec![100, 200]);
    }

    #[test]
    fn test_yuyv_ignores_trailing_bytes() {
        let yuyv: Vec<u8> = (0..20).collect();
        assert_eq!(yuyv_to_grayscale(&yuyv, 4, 2).unwrap(), vec![0, 2, 4, 6, 8, 10, 12, 14]);
    }

    #[test]
    fn test_yuyv_too_short() {
        assert!(matches!(
            yuyv_to_grayscale(&[100, 128], 2, 1),
            Err(FrameError::InvalidLength { expected: 4, actual: 2 })
        ));
    }

    #[test]
    fn test_y16_keeps_high_byte() {
        // 0x1234 and 0xFF00, little-endian.
        assert_eq!(y16_to_grayscale(&[0x34, 0x12, 0x00, 0xFF], 2, 1).unwrap(), vec![0x12, 0xFF]);
    }

    #[test]
    fn test_grey_passthrough() {
        assert_eq!(grey_to_grayscale(&[1, 2, 3, 4, 5], 2, 2).unwrap(), vec![1, 2, 3, 4]);
        assert!(grey_to_grayscale(&[1, 2, 3], 2, 2).is_err());
    }

    #[test]
    fn test_mjpeg_roundtrip_dimensions() {
        let img = image::GrayImage::from_pixel(8, 6, image::Luma([200u8]));
        let mut jpeg = Vec::new();
        image::DynamicImage::ImageLuma8(img)
            .write_to(&mut std::io::Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
            .unwrap();

        let gray = mjpeg_to_grayscale(&jpeg, 8, 6).unwrap();
        assert_eq!(gray.len(), 48);
        assert!(gray.iter().all(|&p| (p as i32 - 200).abs() <= 3));

        assert!(matches!(
            mjpeg_to_grayscale(&jpeg, 16, 12),
            Err(FrameError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_mjpeg_garbage() {
        assert!(matches!(mjpeg_to_grayscale(&[0, 1, 2, 3], 2, 2), Err(FrameError::Decode(_))));
    }

    #[test]
    fn test_dark_frame_thresholds() {
        assert!(is_dark_frame(&[0u8; 1000], DARK_FRAME_RATIO));
        assert!(!is_dark_frame(&[128u8; 1000], DARK_FRAME_RATIO));
        assert!(is_dark_frame(&[], DARK_FRAME_RATIO));

        let mut mostly_dark = vec![10u8; 960];
        mostly_dark.extend([128u8; 40]);
        assert!(is_dark_frame(&mostly_dark, DARK_FRAME_RATIO));

        let mut lit = vec![10u8; 940];
        lit.extend([128u8; 60]);
        assert!(!is_dark_frame(&lit, DARK_FRAME_RATIO));
    }

    #[test]
    fn test_frame_new_validates_and_flags_dark() {
        let f = Frame::new(vec![0u8; 12], 4, 3, 7).unwrap();
        assert!(f.is_dark);
        assert_eq!(f.sequence, 7);
        assert!(Frame::new(vec![0u8; 11], 4, 3, 0).is_err());

        let lit = Frame::new(vec![100u8; 12], 4, 3, 8).unwrap();
        assert!(!lit.is_dark);
        assert_eq!(lit.avg_brightness(), 100.0);
    }
}

//! Latest annotated frame, shared between the monitoring worker and snapshot readers.

use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use officewatch_core::{BoundingBox, IdentityId};
use serde::Serialize;
use std::sync::{Arc, Mutex};

pub const UNKNOWN_LABEL: &str = "Unknown";
const JPEG_QUALITY: u8 = 85;
const BOX_THICKNESS: u32 = 2;
const RECOGNIZED_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const UNKNOWN_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

/// What the worker decided about one face in a frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceAnnotation {
    /// Display name, or "Unknown".
    pub label: String,
    pub identity_id: Option<IdentityId>,
    /// Distance to the nearest gallery entry, if any was compared.
    pub distance: Option<f32>,
    pub bbox: BoundingBox,
}

impl FaceAnnotation {
    pub fn unknown(bbox: BoundingBox, distance: Option<f32>) -> Self {
        Self {
            label: UNKNOWN_LABEL.to_string(),
            identity_id: None,
            distance,
            bbox,
        }
    }

    pub fn recognized(&self) -> bool {
        self.identity_id.is_some()
    }
}

/// What was recognized in one published frame, without the pixels.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameSummary {
    pub sequence: u32,
    pub captured_at: DateTime<Utc>,
    pub faces: Vec<FaceAnnotation>,
}

/// An annotated RGB frame.
#[derive(Debug, Clone)]
pub struct PublishedFrame {
    pub image: RgbImage,
    pub annotations: Vec<FaceAnnotation>,
    pub captured_at: DateTime<Utc>,
    pub sequence: u32,
}

impl PublishedFrame {
    /// Expand a grayscale buffer to RGB and outline each annotated face.
    pub fn annotate(
        gray: &[u8],
        width: u32,
        height: u32,
        annotations: Vec<FaceAnnotation>,
        captured_at: DateTime<Utc>,
        sequence: u32,
    ) -> Self {
        let mut image = RgbImage::from_fn(width, height, |x, y| {
            let v = gray
                .get(y as usize * width as usize + x as usize)
                .copied()
                .unwrap_or(0);
            Rgb([v, v, v])
        });
        for annotation in &annotations {
            let color = if annotation.recognized() {
                RECOGNIZED_COLOR
            } else {
                UNKNOWN_COLOR
            };
            if let Some(rect) = annotation.bbox.clamped(width, height) {
                draw_rect(&mut image, rect, color);
            }
        }
        Self {
            image,
            annotations,
            captured_at,
            sequence,
        }
    }

    pub fn summary(&self) -> FrameSummary {
        FrameSummary {
            sequence: self.sequence,
            captured_at: self.captured_at,
            faces: self.annotations.clone(),
        }
    }

    pub fn encode_jpeg(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY).encode_image(&self.image)?;
        Ok(out)
    }
}

/// Rectangle outline, `BOX_THICKNESS` pixels wide, drawn inward from the corners.
fn draw_rect(image: &mut RgbImage, (left, top, right, bottom): (u32, u32, u32, u32), color: Rgb<u8>) {
    for t in 0..BOX_THICKNESS {
        let (l, tp) = (left + t, top + t);
        let (r, b) = (right.saturating_sub(t), bottom.saturating_sub(t));
        if r < l || b < tp {
            break;
        }
        for x in l..=r {
            image.put_pixel(x, tp, color);
            image.put_pixel(x, b, color);
        }
        for y in tp..=b {
            image.put_pixel(l, y, color);
            image.put_pixel(r, y, color);
        }
    }
}

/// Holds exactly one current frame.
///
/// The lock covers only the pointer swap or the `Arc` clone; copying pixels for a
/// reader happens outside it.
#[derive(Default)]
pub struct FramePublisher {
    current: Mutex<Option<Arc<PublishedFrame>>>,
}

impl FramePublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current frame.
    pub fn publish(&self, frame: PublishedFrame) {
        let frame = Arc::new(frame);
        let previous = {
            let mut current = self.current.lock().unwrap_or_else(|p| p.into_inner());
            current.replace(frame)
        };
        // The old frame is freed here, outside the lock, unless a reader still holds it.
        drop(previous);
    }

    /// Shared handle to the current frame. Copies no pixels.
    pub fn latest(&self) -> Option<Arc<PublishedFrame>> {
        self.current.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Independent copy of the current frame.
    pub fn snapshot(&self) -> Option<PublishedFrame> {
        let shared = self.latest()?;
        Some(PublishedFrame::clone(&shared))
    }
}

//! Face alignment to the canonical 112×112 ArcFace crop.

use crate::types::BoundingBox;

/// Reference landmark positions in a 112×112 crop
/// (left eye, right eye, nose, left mouth corner, right mouth corner).
pub const REFERENCE_LANDMARKS: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

pub const ALIGNED_SIZE: usize = 112;

/// 4-DOF similarity transform: `dst = [a -b; b a] * src + [tx; ty]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityTransform {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl SimilarityTransform {
    pub const IDENTITY: SimilarityTransform = SimilarityTransform {
        a: 1.0,
        b: 0.0,
        tx: 0.0,
        ty: 0.0,
    };

    /// Least-squares fit mapping `src` points onto `dst` points.
    ///
    /// Uses the closed form on centered coordinates. Degenerate input (all source
    /// points coincident) yields the identity.
    pub fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Self {
        let n = src.len() as f32;
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), (x, y)| (ax + x, ay + y));
            (sx / n, sy / n)
        };
        let (smx, smy) = mean(src);
        let (dmx, dmy) = mean(dst);

        let mut dot = 0.0f32;
        let mut cross = 0.0f32;
        let mut norm = 0.0f32;
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            let (sx, sy) = (sx - smx, sy - smy);
            let (dx, dy) = (dx - dmx, dy - dmy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            norm += sx * sx + sy * sy;
        }

        if norm < 1e-12 {
            return Self::IDENTITY;
        }

        let a = dot / norm;
        let b = cross / norm;
        Self {
            a,
            b,
            tx: dmx - (a * smx - b * smy),
            ty: dmy - (b * smx + a * smy),
        }
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    /// Inverse mapping, or `None` for a zero-scale transform.
    pub fn inverse(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let a = self.a / det;
        let b = -self.b / det;
        Some(Self {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }

    pub fn scale(&self) -> f32 {
        (self.a * self.a + self.b * self.b).sqrt()
    }
}

/// Bilinear sample of a grayscale frame; outside pixels read as black.
fn sample(frame: &[u8], width: usize, height: usize, x: f32, y: f32) -> f32 {
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let px = |xi: f32, yi: f32| -> f32 {
        if xi < 0.0 || yi < 0.0 || xi >= width as f32 || yi >= height as f32 {
            0.0
        } else {
            frame[yi as usize * width + xi as usize] as f32
        }
    };
    px(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + px(x0 + 1.0, y0) * fx * (1.0 - fy)
        + px(x0, y0 + 1.0) * (1.0 - fx) * fy
        + px(x0 + 1.0, y0 + 1.0) * fx * fy
}

/// Warp `frame` into an `out_size`×`out_size` crop under `transform` (frame -> crop).
pub fn warp(
    frame: &[u8],
    width: usize,
    height: usize,
    transform: &SimilarityTransform,
    out_size: usize,
) -> Vec<u8> {
    let mut out = vec![0u8; out_size * out_size];
    let Some(back) = transform.inverse() else {
        return out;
    };
    for oy in 0..out_size {
        for ox in 0..out_size {
            let (sx, sy) = back.apply((ox as f32, oy as f32));
            out[oy * out_size + ox] = sample(frame, width, height, sx, sy).round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// Approximate landmark positions from a face box, using the reference layout
/// scaled into the box.
pub fn landmarks_from_box(face: &BoundingBox) -> [(f32, f32); 5] {
    let sx = face.width / ALIGNED_SIZE as f32;
    let sy = face.height / ALIGNED_SIZE as f32;
    REFERENCE_LANDMARKS.map(|(x, y)| (face.x + x * sx, face.y + y * sy))
}

/// Align a face to the canonical 112×112 crop from its five landmarks.
pub fn align_face(frame: &[u8], width: u32, height: u32, landmarks: &[(f32, f32); 5]) -> Vec<u8> {
    let transform = SimilarityTransform::estimate(landmarks, &REFERENCE_LANDMARKS);
    warp(frame, width as usize, height as usize, &transform, ALIGNED_SIZE)
}

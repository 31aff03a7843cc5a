//! SCRFD face localizer via ONNX Runtime.
//!
//! Letterboxes the grayscale frame into the 640×640 model input, decodes the three
//! stride heads (8, 16, 32; two anchors per cell) into boxes with five landmarks,
//! then applies non-maximum suppression.

use crate::types::BoundingBox;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
const SCRFD_OUTPUTS: usize = SCRFD_STRIDES.len() * 3;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Tunables for the localizer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorConfig {
    /// Minimum anchor score to keep a candidate.
    pub confidence_threshold: f32,
    /// IoU above which the weaker of two overlapping boxes is dropped.
    pub nms_threshold: f32,
    /// Faces whose shorter side is below this many pixels are ignored.
    pub min_face_size: f32,
    /// Upper bound on faces reported per frame.
    pub max_faces: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            nms_threshold: 0.4,
            min_face_size: 30.0,
            max_faces: 16,
        }
    }
}

/// Scale and padding applied when fitting the frame into the square model input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    scaled_w: usize,
    scaled_h: usize,
}

impl Letterbox {
    fn fit(width: usize, height: usize, target: usize) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let scaled_w = ((width as f32 * scale).round() as usize).min(target);
        let scaled_h = ((height as f32 * scale).round() as usize).min(target);
        Self {
            scale,
            pad_x: (target - scaled_w) as f32 / 2.0,
            pad_y: (target - scaled_h) as f32 / 2.0,
            scaled_w,
            scaled_h,
        }
    }

    /// Map a point in model-input space back to frame space.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Tensor indices (score, bbox, kps) of one stride head.
type HeadIndices = (usize, usize, usize);

pub struct FaceDetector {
    session: Session,
    config: DetectorConfig,
    heads: [HeadIndices; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model.
    pub fn load(model_path: &str, config: DetectorConfig) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        if output_names.len() < SCRFD_OUTPUTS {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs {SCRFD_OUTPUTS} outputs (score/bbox/kps per stride), model has {}",
                output_names.len()
            )));
        }

        let heads = head_indices(&output_names);
        tracing::info!(path = model_path, outputs = ?output_names, ?heads, ?config, "loaded SCRFD model");

        Ok(Self {
            session,
            config,
            heads,
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Detect faces in a grayscale frame, most confident first.
    pub fn detect(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        let (width, height) = (width as usize, height as usize);
        let letterbox = Letterbox::fit(width, height, SCRFD_INPUT_SIZE);
        let resized = resize_bilinear(frame, width, height, letterbox.scaled_w, letterbox.scaled_h);
        let input = to_input_tensor(&resized, &letterbox);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (head, &stride) in self.heads.iter().zip(SCRFD_STRIDES.iter()) {
            let (score_idx, bbox_idx, kps_idx) = *head;
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let head = HeadOutput {
                scores: extract(score_idx, "scores")?,
                bboxes: extract(bbox_idx, "bboxes")?,
                kps: extract(kps_idx, "kps")?,
            };
            candidates.extend(head.decode(stride, &letterbox, self.config.confidence_threshold));
        }

        let mut faces = nms(candidates, self.config.nms_threshold);
        faces.retain(|f| f.min_side() >= self.config.min_face_size);
        faces.truncate(self.config.max_faces);
        tracing::trace!(faces = faces.len(), "SCRFD detections");
        Ok(faces)
    }
}

/// Locate the score/bbox/kps tensors of each stride.
///
/// Named exports ("score_8", "bbox_16", "kps_32", ...) are mapped by name; anything
/// else falls back to the usual positional order: scores 0-2, boxes 3-5, landmarks 6-8.
fn head_indices(names: &[String]) -> [HeadIndices; 3] {
    let find = |prefix: &str, stride: usize| {
        let wanted = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let mut heads = [(0, 3, 6), (1, 4, 7), (2, 5, 8)];
    for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride), find("kps", stride)) {
            (Some(s), Some(b), Some(k)) => heads[slot] = (s, b, k),
            _ => {
                tracing::debug!(?names, "SCRFD output names not recognized; using positional mapping");
                return [(0, 3, 6), (1, 4, 7), (2, 5, 8)];
            }
        }
    }
    heads
}

/// Raw outputs of one stride head.
struct HeadOutput<'a> {
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

impl HeadOutput<'_> {
    fn decode(&self, stride: usize, letterbox: &Letterbox, threshold: f32) -> Vec<BoundingBox> {
        let grid_w = SCRFD_INPUT_SIZE / stride;
        let grid_h = SCRFD_INPUT_SIZE / stride;
        let anchors = grid_w * grid_h * SCRFD_ANCHORS_PER_CELL;
        let step = stride as f32;

        let mut faces = Vec::new();
        for idx in 0..anchors {
            let score = self.scores.get(idx).copied().unwrap_or(0.0);
            if score <= threshold {
                continue;
            }
            let Some(d) = self.bboxes.get(idx * 4..idx * 4 + 4) else {
                continue;
            };

            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let ax = (cell % grid_w) as f32 * step;
            let ay = (cell / grid_w) as f32 * step;

            let (x1, y1) = letterbox.unmap(ax - d[0] * step, ay - d[1] * step);
            let (x2, y2) = letterbox.unmap(ax + d[2] * step, ay + d[3] * step);

            let landmarks = self.kps.get(idx * 10..idx * 10 + 10).map(|k| {
                std::array::from_fn(|i| letterbox.unmap(ax + k[i * 2] * step, ay + k[i * 2 + 1] * step))
            });

            faces.push(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
                landmarks,
            });
        }
        faces
    }
}

/// Bilinear resize of a grayscale buffer.
fn resize_bilinear(src: &[u8], src_w: usize, src_h: usize, dst_w: usize, dst_h: usize) -> Vec<u8> {
    let mut out = vec![0u8; dst_w * dst_h];
    if src_w == 0 || src_h == 0 || dst_w == 0 || dst_h == 0 {
        return out;
    }
    let sx_ratio = src_w as f32 / dst_w as f32;
    let sy_ratio = src_h as f32 / dst_h as f32;

    for y in 0..dst_h {
        let fy_src = (y as f32 + 0.5) * sy_ratio - 0.5;
        let y0 = (fy_src.floor().max(0.0) as usize).min(src_h - 1);
        let y1 = (y0 + 1).min(src_h - 1);
        let wy = (fy_src - y0 as f32).clamp(0.0, 1.0);

        for x in 0..dst_w {
            let fx_src = (x as f32 + 0.5) * sx_ratio - 0.5;
            let x0 = (fx_src.floor().max(0.0) as usize).min(src_w - 1);
            let x1 = (x0 + 1).min(src_w - 1);
            let wx = (fx_src - x0 as f32).clamp(0.0, 1.0);

            let top = src[y0 * src_w + x0] as f32 * (1.0 - wx) + src[y0 * src_w + x1] as f32 * wx;
            let bottom = src[y1 * src_w + x0] as f32 * (1.0 - wx) + src[y1 * src_w + x1] as f32 * wx;
            out[y * dst_w + x] = (top * (1.0 - wy) + bottom * wy).round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// Place the resized frame in the padded square input and normalize into NCHW.
///
/// Padding takes the mean value so it normalizes to zero. The gray channel is
/// replicated into all three color planes.
fn to_input_tensor(resized: &[u8], letterbox: &Letterbox) -> Array4<f32> {
    let size = SCRFD_INPUT_SIZE;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    let off_x = letterbox.pad_x.floor() as usize;
    let off_y = letterbox.pad_y.floor() as usize;

    for y in 0..letterbox.scaled_h {
        for x in 0..letterbox.scaled_w {
            let v = (resized[y * letterbox.scaled_w + x] as f32 - SCRFD_MEAN) / SCRFD_STD;
            for c in 0..3 {
                tensor[[0, c, y + off_y, x + off_x]] = v;
            }
        }
    }
    tensor
}

/// Non-maximum suppression. Output is sorted by descending confidence.
fn nms(mut faces: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    faces.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<BoundingBox> = Vec::with_capacity(faces.len());
    for face in faces {
        if keep.iter().all(|k| iou(k, &face) <= iou_threshold) {
            keep.push(face);
        }
    }
    keep
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

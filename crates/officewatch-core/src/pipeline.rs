//! Seams between the monitoring loop and the recognition models.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, Embedding};
use thiserror::Error;

/// Localization or encoding failed for one frame or one face region.
/// Never fatal: the affected region is treated as having no detection.
#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Check that a grayscale buffer holds exactly `width * height` pixels.
pub fn check_frame(frame: &[u8], width: u32, height: u32) -> Result<(), RecognitionError> {
    let expected = width as usize * height as usize;
    if expected == 0 || frame.len() != expected {
        return Err(RecognitionError::MalformedFrame(format!(
            "{width}x{height} frame needs {expected} bytes, got {}",
            frame.len()
        )));
    }
    Ok(())
}

/// Finds face regions in a grayscale frame.
pub trait FaceLocalizer: Send {
    /// Detected faces, in the order they should be processed.
    fn localize(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, RecognitionError>;
}

/// Computes an identity embedding for one located face.
pub trait FaceEncoder: Send {
    fn encode(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        face: &BoundingBox,
    ) -> Result<Embedding, RecognitionError>;
}

impl FaceLocalizer for FaceDetector {
    fn localize(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, RecognitionError> {
        check_frame(frame, width, height)?;
        Ok(self.detect(frame, width, height)?)
    }
}

impl FaceEncoder for FaceRecognizer {
    fn encode(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        face: &BoundingBox,
    ) -> Result<Embedding, RecognitionError> {
        check_frame(frame, width, height)?;
        Ok(self.extract(frame, width, height, face)?)
    }
}

/// The localizer/encoder pair owned by the monitoring worker.
pub struct Pipeline {
    pub localizer: Box<dyn FaceLocalizer>,
    pub encoder: Box<dyn FaceEncoder>,
}

impl Pipeline {
    pub fn new(localizer: Box<dyn FaceLocalizer>, encoder: Box<dyn FaceEncoder>) -> Self {
        Self { localizer, encoder }
    }
}

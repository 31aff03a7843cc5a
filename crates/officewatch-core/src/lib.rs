//! officewatch-core — recognition and presence core.
//!
//! SCRFD face localization and ArcFace encoding via ONNX Runtime, nearest-neighbor
//! identity matching against the encoding gallery, and the per-identity presence
//! state machine that turns matches into attendance sessions.

pub mod alignment;
pub mod detector;
pub mod gallery;
pub mod matcher;
pub mod pipeline;
pub mod presence;
pub mod recognizer;
pub mod store;
pub mod types;

pub use detector::{DetectorConfig, FaceDetector};
pub use gallery::{
    load_gallery, load_gallery_or_empty, EncoderProfile, Gallery, GalleryEntry, GalleryError,
};
pub use matcher::{EuclideanMatcher, MatchResult, Matcher, DEFAULT_TOLERANCE};
pub use pipeline::{FaceEncoder, FaceLocalizer, Pipeline, RecognitionError};
pub use presence::{
    PresenceError, PresenceState, PresenceStatus, PresenceTracker, Transition, TransitionKind,
    DEFAULT_COOLDOWN,
};
pub use recognizer::{FaceRecognizer, ARCFACE_PROFILE};
pub use store::{AttendanceStore, IdentityDirectory, StoreError, DEFAULT_ACTION};
pub use types::{AttendanceSession, BoundingBox, Embedding, Identity, IdentityId, SessionStatus};

/// Directory searched for `det_10g.onnx` and `w600k_r50.onnx` when none is configured.
pub fn default_model_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("/usr/share/officewatch/models")
}

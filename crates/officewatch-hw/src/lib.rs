//! officewatch-hw — camera capture for the monitoring loop.
//!
//! V4L2 device access with YUYV, MJPG, GREY and Y16 conversion to grayscale frames.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, CaptureConfig, FrameSource, PixelFormat};
pub use frame::{Frame, FrameError};

//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::FourCC;

/// Number of mmap buffers queued with the driver.
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Something that produces grayscale frames on demand.
///
/// Dropping the source releases the underlying device.
pub trait FrameSource {
    fn read_frame(&mut self) -> Result<Frame, CameraError>;
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, Y channel extracted).
    Yuyv,
    /// Motion-JPEG, decoded per frame.
    Mjpg,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"MJPG" => Some(PixelFormat::Mjpg),
            b"GREY" => Some(PixelFormat::Grey),
            b"Y16 " | b"Y16\0" => Some(PixelFormat::Y16),
            _ => None,
        }
    }
}

/// Requested capture parameters. The driver may adjust them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    pub device_path: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Frames read and discarded after opening, while exposure settles.
    pub warmup_frames: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_path: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            fps: 30,
            warmup_frames: 4,
        }
    }
}

/// An open V4L2 capture handle with a running mmap stream.
///
/// The stream shares the device handle, so it alone keeps the device open.
pub struct Camera {
    stream: MmapStream<'static>,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub pixel_format: PixelFormat,
}

impl Camera {
    /// Open the device, negotiate format and frame rate, start streaming and
    /// discard warmup frames.
    pub fn open(config: &CaptureConfig) -> Result<Self, CameraError> {
        let device_path = config.device_path.as_str();
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            let msg = e.to_string();
            if msg.contains("busy") || msg.contains("EBUSY") {
                CameraError::DeviceBusy(device_path.to_string())
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }
        tracing::info!(device = device_path, driver = %caps.driver, card = %caps.card, "opened camera");

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = config.width;
        fmt.height = config.height;
        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need YUYV, MJPG, GREY or Y16)",
                negotiated.fourcc
            ))
        })?;

        if let Err(e) = device.set_params(&Parameters::with_fps(config.fps)) {
            tracing::warn!(fps = config.fps, error = %e, "could not set frame rate; using driver default");
        }

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            format = ?pixel_format,
            "negotiated format"
        );

        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;

        let mut camera = Self {
            stream,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            pixel_format,
        };

        for _ in 0..config.warmup_frames {
            if let Err(e) = camera.read_frame() {
                tracing::debug!(error = %e, "warmup frame failed");
            }
        }

        Ok(camera)
    }
}

/// Convert a raw driver buffer to grayscale based on the negotiated format.
fn to_grayscale(
    format: PixelFormat,
    buf: &[u8],
    width: u32,
    height: u32,
) -> Result<Vec<u8>, frame::FrameError> {
    match format {
        PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, width, height),
        PixelFormat::Mjpg => frame::mjpeg_to_grayscale(buf, width, height),
        PixelFormat::Grey => frame::grey_to_grayscale(buf, width, height),
        PixelFormat::Y16 => frame::y16_to_grayscale(buf, width, height),
    }
}

impl FrameSource for Camera {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        let (format, width, height) = (self.pixel_format, self.width, self.height);
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        let sequence = meta.sequence;
        // MJPG payloads are shorter than the mapped buffer.
        let used = (meta.bytesused as usize).min(buf.len());
        let raw = if format == PixelFormat::Mjpg && used > 0 {
            &buf[..used]
        } else {
            buf
        };

        let gray = to_grayscale(format, raw, width, height)
            .map_err(|e| CameraError::CaptureFailed(format!("frame conversion: {e}")))?;
        Frame::new(gray, width, height, sequence)
            .map_err(|e| CameraError::CaptureFailed(e.to_string()))
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        tracing::debug!(device = %self.device_path, "closing camera");
    }
}

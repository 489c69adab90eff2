//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, FrameError};
use image::RgbImage;
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;
use vigil_core::{Frame, FrameSource};

const STREAM_BUFFERS: u32 = 4;
/// Longest wait for a filled buffer. A stalled device then fails the
/// capture instead of blocking the caller (and shutdown) forever.
pub const CAPTURE_TIMEOUT: Duration = Duration::from_secs(2);
/// Frames darker than this (mean luma) are discarded during warm-up.
const WARMUP_DARK_LUMA: f32 = 8.0;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("not a video capture device: {0}")]
    NotCaptureDevice(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("frame conversion failed: {0}")]
    Frame(#[from] FrameError),
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Pixel formats the camera can deliver and we can convert to RGB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Yuyv,
    Mjpg,
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"MJPG" => Some(Self::Mjpg),
            b"GREY" => Some(Self::Grey),
            _ => None,
        }
    }

    fn fourcc(self) -> FourCC {
        FourCC::new(match self {
            Self::Yuyv => b"YUYV",
            Self::Mjpg => b"MJPG",
            Self::Grey => b"GREY",
        })
    }

    fn convert(self, buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
        match self {
            Self::Yuyv => frame::yuyv_to_rgb(buf, width, height),
            Self::Mjpg => frame::mjpg_to_rgb(buf, width, height),
            Self::Grey => frame::grey_to_rgb(buf, width, height),
        }
    }
}

/// Requested capture geometry.
#[derive(Debug, Clone)]
pub struct CameraConfig {
    pub device: String,
    pub width: u32,
    pub height: u32,
    /// Frames discarded after the stream starts while exposure settles.
    pub warmup_frames: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".into(),
            width: 640,
            height: 480,
            warmup_frames: 4,
        }
    }
}

/// An open, streaming V4L2 camera. The device is released when dropped.
pub struct Camera {
    stream: MmapStream<'static>,
    // Keeps the device handle alive alongside the stream.
    _device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
}

impl Camera {
    pub fn open(config: &CameraConfig) -> Result<Self, CameraError> {
        let path = config.device.as_str();
        if !Path::new(path).exists() {
            return Err(CameraError::DeviceNotFound(path.to_string()));
        }

        let device = Device::with_path(path).map_err(|e| {
            if e.raw_os_error() == Some(16) || e.to_string().contains("busy") {
                CameraError::DeviceBusy(path.to_string())
            } else {
                CameraError::DeviceNotFound(format!("{path}: {e}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::NotCaptureDevice(path.to_string()));
        }
        tracing::info!(device = path, driver = %caps.driver, card = %caps.card, "opened camera");

        let (width, height, pixel_format) = negotiate(&device, config.width, config.height)?;

        let mut stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
        stream.set_timeout(CAPTURE_TIMEOUT);

        // Skip the first frames, not counting black ones, while exposure settles.
        let mut settled = 0u32;
        for _ in 0..config.warmup_frames.saturating_mul(3) {
            if settled >= config.warmup_frames {
                break;
            }
            let (buf, meta) = stream.next().map_err(dequeue_error)?;
            match pixel_format.convert(buf, width, height) {
                Ok(image) if frame::mean_luma(&image) < WARMUP_DARK_LUMA => {
                    tracing::debug!(seq = meta.sequence, "dark warm-up frame");
                }
                _ => settled += 1,
            }
        }

        Ok(Self {
            stream,
            _device: device,
            width,
            height,
            device_path: path.to_string(),
            pixel_format,
        })
    }

    /// Dequeue and convert the next frame.
    pub fn capture(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self.stream.next().map_err(dequeue_error)?;
        let sequence = meta.sequence;
        let image = self.pixel_format.convert(buf, self.width, self.height)?;
        Ok(Frame::new(image, sequence))
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .filter_map(|i| {
                let path = format!("/dev/video{i}");
                if !Path::new(&path).exists() {
                    return None;
                }
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                    return None;
                }
                Some(DeviceInfo {
                    path,
                    name: caps.card,
                    driver: caps.driver,
                    bus: caps.bus,
                })
            })
            .collect()
    }
}

impl FrameSource for Camera {
    type Error = CameraError;

    fn acquire(&mut self) -> Result<Frame, CameraError> {
        self.capture()
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        tracing::info!(device = %self.device_path, "camera released");
    }
}

fn dequeue_error(e: io::Error) -> CameraError {
    if e.kind() == io::ErrorKind::TimedOut {
        CameraError::CaptureFailed(format!("no frame within {CAPTURE_TIMEOUT:?}"))
    } else {
        CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}"))
    }
}

/// Ask for YUYV, then MJPG, at the requested size; accept whatever
/// convertible format and size the driver settles on.
fn negotiate(device: &Device, width: u32, height: u32) -> Result<(u32, u32, PixelFormat), CameraError> {
    let mut fmt = device
        .format()
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;

    for wanted in [PixelFormat::Yuyv, PixelFormat::Mjpg] {
        fmt.fourcc = wanted.fourcc();
        fmt.width = width;
        fmt.height = height;
        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to set format: {e}")))?;

        if let Some(format) = PixelFormat::from_fourcc(negotiated.fourcc) {
            tracing::info!(
                width = negotiated.width,
                height = negotiated.height,
                fourcc = %negotiated.fourcc,
                "negotiated format"
            );
            return Ok((negotiated.width, negotiated.height, format));
        }
        fmt = negotiated;
    }

    Err(CameraError::FormatNegotiationFailed(format!(
        "unsupported pixel format {} (need YUYV, MJPG or GREY)",
        fmt.fourcc
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_mapping() {
        for format in [PixelFormat::Yuyv, PixelFormat::Mjpg, PixelFormat::Grey] {
            assert_eq!(PixelFormat::from_fourcc(format.fourcc()), Some(format));
        }
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"NV12")), None);
    }

    #[test]
    fn test_open_missing_device() {
        let config = CameraConfig {
            device: "/dev/video-does-not-exist".into(),
            ..CameraConfig::default()
        };
        assert!(matches!(Camera::open(&config), Err(CameraError::DeviceNotFound(_))));
    }

    #[test]
    fn test_dequeue_timeout_is_capture_failure() {
        let err = dequeue_error(io::Error::new(io::ErrorKind::TimedOut, "VIDIOC_DQBUF"));
        match err {
            CameraError::CaptureFailed(msg) => assert_eq!(msg, "no frame within 2s"),
            other => panic!("unexpected error: {other}"),
        }

        let err = dequeue_error(io::Error::from_raw_os_error(19));
        assert!(matches!(err, CameraError::CaptureFailed(msg) if msg.starts_with("failed to dequeue buffer")));
    }

    #[test]
    fn test_convert_dispatches_by_format() {
        let image = PixelFormat::Grey.convert(&[10, 20], 2, 1).unwrap();
        assert_eq!(image.get_pixel(1, 0).0, [20, 20, 20]);
        assert!(PixelFormat::Yuyv.convert(&[10, 20], 2, 1).is_err());
    }
}

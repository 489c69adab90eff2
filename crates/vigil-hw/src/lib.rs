//! vigil-hw: V4L2 camera capture producing RGB frames for the pipeline.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraConfig, CameraError, DeviceInfo, PixelFormat};
pub use frame::FrameError;

//! faceid-hw — Camera capture for the face identity engine.
//!
//! V4L2 device access, pixel format conversion to RGB, and the Frame Source
//! that keeps the newest frame available to sessions and previews.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, DeviceOpener, V4lOpener, VideoDevice};
pub use frame::{FrameError, PixelFormat};
pub use source::{CaptureStats, FrameSource, SourceConfig};

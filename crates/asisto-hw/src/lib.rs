//! asisto-hw — Live frame capture.
//!
//! V4L2 camera access with conversion of YUYV, GREY and Y16 output to RGB
//! frames for the recognition loop.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, FrameSource, PixelFormat};
pub use frame::{Frame, FrameError};

//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame, FrameError};
use image::RgbImage;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const EBUSY: i32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("frame conversion failed: {0}")]
    Frame(#[from] FrameError),
}

/// Anything that yields RGB frames, one at a time.
///
/// Blocking; the recognition loop calls it from a blocking thread.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Frame, CameraError>;
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Pixel layouts the camera may negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed, converted to RGB.
    Yuyv,
    /// 8-bit grayscale, replicated across channels.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"GREY" => Some(PixelFormat::Grey),
            b"Y16 " | b"Y16\0" => Some(PixelFormat::Y16),
            _ => None,
        }
    }

    fn to_rgb(self, buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
        match self {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, width, height),
            PixelFormat::Grey => frame::grey_to_rgb(buf, width, height),
            PixelFormat::Y16 => frame::y16_to_rgb(buf, width, height),
        }
    }
}

/// V4L2 capture device producing RGB frames. Streaming starts on the first
/// capture and stays on until the camera is dropped.
pub struct Camera {
    device: Device,
    stream: Option<MmapStream<'static>>,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub pixel_format: PixelFormat,
}

impl Camera {
    /// Open `device_path` (e.g. "/dev/video0") asking for `width`x`height`.
    /// The driver has the final say on the size.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }
        let device = Device::with_path(device_path).map_err(|e| open_error(device_path, e))?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }
        tracing::info!(device = device_path, driver = %caps.driver, card = %caps.card, "opened camera");

        let (width, height, pixel_format) = negotiate(&device, width, height)?;

        Ok(Self {
            device,
            stream: None,
            width,
            height,
            device_path: device_path.to_string(),
            pixel_format,
        })
    }

    /// Dequeue the next buffer and convert it to an RGB frame.
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => self.stream.insert(
                MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4).map_err(|e| {
                    CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
                })?,
            ),
        };

        let (image, sequence) = match stream.next() {
            Ok((buf, meta)) => (self.pixel_format.to_rgb(buf, self.width, self.height)?, meta.sequence),
            Err(e) => {
                // Restart streaming on the next call.
                self.stream = None;
                return Err(CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")));
            }
        };

        let captured = Frame {
            is_dark: frame::is_dark_frame(&image, frame::DARK_FRACTION),
            image,
            timestamp: std::time::Instant::now(),
            sequence,
        };
        if captured.is_dark {
            tracing::debug!(seq = sequence, brightness = captured.avg_brightness(), "dark frame");
        }
        Ok(captured)
    }

    /// Video capture devices known to the V4L2 subsystem.
    pub fn list_devices() -> Vec<DeviceInfo> {
        v4l::context::enum_devices()
            .into_iter()
            .filter_map(|node| {
                let path = node.path().to_string_lossy().into_owned();
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities
                    .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path,
                        name: caps.card,
                        driver: caps.driver,
                        bus: caps.bus,
                    })
            })
            .collect()
    }
}

fn open_error(device_path: &str, e: std::io::Error) -> CameraError {
    if e.raw_os_error() == Some(EBUSY) || e.to_string().contains("busy") {
        CameraError::DeviceBusy
    } else {
        CameraError::DeviceNotFound(format!("{device_path}: {e}"))
    }
}

/// Request YUYV at the given size and accept whatever supported layout the
/// driver settles on.
fn negotiate(device: &Device, width: u32, height: u32) -> Result<(u32, u32, PixelFormat), CameraError> {
    let mut wanted = device
        .format()
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;
    wanted.fourcc = FourCC::new(b"YUYV");
    wanted.width = width;
    wanted.height = height;

    let got = device
        .set_format(&wanted)
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to set format: {e}")))?;
    let pixel_format = PixelFormat::from_fourcc(got.fourcc).ok_or_else(|| {
        CameraError::FormatNegotiationFailed(format!(
            "unsupported pixel format {} (need YUYV, GREY or Y16)",
            got.fourcc
        ))
    })?;

    tracing::info!(width = got.width, height = got.height, ?pixel_format, "negotiated format");
    Ok((got.width, got.height, pixel_format))
}

impl FrameSource for Camera {
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        self.capture_frame()
    }
}

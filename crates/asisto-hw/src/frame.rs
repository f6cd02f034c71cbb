//! Frame type and pixel conversion: YUYV/GREY/Y16 to RGB, dark detection.

use image::RgbImage;

/// A captured RGB camera frame.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    /// Wrap an already decoded image (still images, test fixtures).
    pub fn from_image(image: RgbImage) -> Self {
        let is_dark = is_dark_frame(&image, DARK_FRACTION);
        Self {
            image,
            timestamp: std::time::Instant::now(),
            sequence: 0,
            is_dark,
        }
    }

    /// Average luma (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        let pixels = self.image.pixels().len();
        if pixels == 0 {
            return 0.0;
        }
        self.image.pixels().map(|p| luma(p.0)).sum::<f32>() / pixels as f32
    }
}

/// Share of near-black pixels above which a frame counts as dark.
pub const DARK_FRACTION: f32 = 0.95;

fn luma([r, g, b]: [u8; 3]) -> f32 {
    0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32
}

fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// BT.601 limited-range YCbCr to RGB.
fn ycbcr_to_rgb(y: u8, cb: u8, cr: u8) -> [u8; 3] {
    let c = 1.164 * (y as f32 - 16.0);
    let d = cb as f32 - 128.0;
    let e = cr as f32 - 128.0;
    [
        clamp_u8(c + 1.596 * e),
        clamp_u8(c - 0.392 * d - 0.813 * e),
        clamp_u8(c + 2.017 * d),
    ]
}

fn check_len(buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn sized_image(width: u32, height: u32, raw: Vec<u8>) -> Result<RgbImage, FrameError> {
    RgbImage::from_raw(width, height, raw).ok_or(FrameError::InvalidDimensions { width, height })
}

/// Convert packed YUYV (4:2:2) to RGB.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share the chroma.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 2) as usize;
    check_len(yuyv, expected)?;

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for quad in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(y0, u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(y1, u, v));
    }
    sized_image(width, height, rgb)
}

/// Replicate 8-bit grayscale into the three channels.
pub fn grey_to_rgb(grey: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len(grey, pixels)?;
    let rgb = grey[..pixels].iter().flat_map(|&g| [g, g, g]).collect();
    sized_image(width, height, rgb)
}

/// 16-bit little-endian grayscale, keeping the high byte.
pub fn y16_to_rgb(y16: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len(y16, pixels * 2)?;
    let rgb = y16[..pixels * 2]
        .chunks_exact(2)
        .flat_map(|px| {
            let g = (u16::from_le_bytes([px[0], px[1]]) >> 8) as u8;
            [g, g, g]
        })
        .collect();
    sized_image(width, height, rgb)
}

/// Returns true if more than `fraction` of pixels have luma below 32.
pub fn is_dark_frame(image: &RgbImage, fraction: f32) -> bool {
    let total = image.pixels().len();
    if total == 0 {
        return true;
    }
    let dark = image.pixels().filter(|p| luma(p.0) < 32.0).count();
    (dark as f32 / total as f32) > fraction
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("invalid frame dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
}

//! Raw V4L2 buffer → RGB conversion.

use image::{ImageFormat, RgbImage};

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid {format} buffer length: expected {expected}, got {actual}")]
    InvalidLength {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("MJPG decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("decoded MJPG frame is {actual:?}, negotiated {expected:?}")]
    SizeMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },
}

fn check_len(format: &'static str, buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            format,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Packed YUYV 4:2:2 (`[Y0, U, Y1, V]` per pixel pair) to RGB, BT.601 limited range.
pub fn yuyv_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len("YUYV", buf, pixels * 2)?;

    let mut rgb = Vec::with_capacity(pixels * 3);
    for chunk in buf[..pixels * 2].chunks_exact(4) {
        let (u, v) = (chunk[1] as f32 - 128.0, chunk[3] as f32 - 128.0);
        for y in [chunk[0], chunk[2]] {
            let c = 1.164 * (y as f32 - 16.0);
            rgb.extend([
                (c + 1.596 * v).round().clamp(0.0, 255.0) as u8,
                (c - 0.392 * u - 0.813 * v).round().clamp(0.0, 255.0) as u8,
                (c + 2.017 * u).round().clamp(0.0, 255.0) as u8,
            ]);
        }
    }
    // Odd widths leave one pixel without a full chunk.
    rgb.resize(pixels * 3, 0);

    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        format: "YUYV",
        expected: pixels * 3,
        actual: 0,
    })
}

/// 8-bit greyscale replicated into three channels.
pub fn grey_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len("GREY", buf, pixels)?;
    let rgb = buf[..pixels].iter().flat_map(|&g| [g, g, g]).collect();
    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        format: "GREY",
        expected: pixels,
        actual: buf.len(),
    })
}

/// Motion-JPEG frame decoded to RGB.
pub fn mjpg_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let decoded = image::load_from_memory_with_format(buf, ImageFormat::Jpeg)?.to_rgb8();
    if decoded.dimensions() != (width, height) {
        return Err(FrameError::SizeMismatch {
            expected: (width, height),
            actual: decoded.dimensions(),
        });
    }
    Ok(decoded)
}

/// Mean luma (0–255), used to skip black frames while the sensor settles.
pub fn mean_luma(image: &RgbImage) -> f32 {
    let pixels = image.width() as usize * image.height() as usize;
    if pixels == 0 {
        return 0.0;
    }
    let sum: f32 = image
        .pixels()
        .map(|p| 0.299 * p.0[0] as f32 + 0.587 * p.0[1] as f32 + 0.114 * p.0[2] as f32)
        .sum();
    sum / pixels as f32
}

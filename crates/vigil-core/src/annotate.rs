//! Draws verdict boxes and labels onto a frame copy.

use image::{Rgb, RgbImage};

use crate::font::{self, ADVANCE, GLYPH_HEIGHT, GLYPH_WIDTH};
use crate::types::{DetectedFace, Verdict};

pub const DEFAULT_THICKNESS: u32 = 2;
pub const DEFAULT_TEXT_SCALE: u32 = 2;

const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

#[derive(Debug, Clone, Copy)]
pub struct FrameAnnotator {
    thickness: u32,
    text_scale: u32,
}

impl FrameAnnotator {
    pub fn new(thickness: u32, text_scale: u32) -> Self {
        Self {
            thickness: thickness.max(1),
            text_scale: text_scale.max(1),
        }
    }

    /// Outline `face` in the verdict color with a filled label bar above it
    /// (or inside the top edge when the face touches the top of the frame).
    pub fn annotate(&self, canvas: &mut RgbImage, face: &DetectedFace, verdict: &Verdict) {
        let Some((x, y, w, h)) = face.clip_to(canvas.width(), canvas.height()) else {
            return;
        };
        let color = Rgb(verdict.color());
        draw_outline(canvas, x, y, w, h, self.thickness, color);

        let label = verdict.label();
        let pad = self.text_scale;
        let bar_h = GLYPH_HEIGHT * self.text_scale + 2 * pad;
        let bar_w = font::text_width(&label, self.text_scale) + 2 * pad;
        let bar_y = y.checked_sub(bar_h).unwrap_or(y);

        fill_rect(canvas, x, bar_y, bar_w, bar_h, color);
        draw_text(canvas, x + pad, bar_y + pad, &label, self.text_scale, TEXT_COLOR);
    }
}

impl Default for FrameAnnotator {
    fn default() -> Self {
        Self::new(DEFAULT_THICKNESS, DEFAULT_TEXT_SCALE)
    }
}

/// Fill a rectangle, clipped to the canvas.
fn fill_rect(canvas: &mut RgbImage, x: u32, y: u32, w: u32, h: u32, color: Rgb<u8>) {
    let right = x.saturating_add(w).min(canvas.width());
    let bottom = y.saturating_add(h).min(canvas.height());
    for py in y..bottom {
        for px in x..right {
            canvas.put_pixel(px, py, color);
        }
    }
}

fn draw_outline(canvas: &mut RgbImage, x: u32, y: u32, w: u32, h: u32, thickness: u32, color: Rgb<u8>) {
    let t = thickness.min(w).min(h);
    fill_rect(canvas, x, y, w, t, color);
    fill_rect(canvas, x, (y + h).saturating_sub(t), w, t, color);
    fill_rect(canvas, x, y, t, h, color);
    fill_rect(canvas, (x + w).saturating_sub(t), y, t, h, color);
}

fn draw_text(canvas: &mut RgbImage, x: u32, y: u32, text: &str, scale: u32, color: Rgb<u8>) {
    for (i, ch) in text.chars().enumerate() {
        let origin_x = x.saturating_add(i as u32 * ADVANCE * scale);
        if origin_x >= canvas.width() {
            break;
        }
        for (row, bits) in font::glyph(ch).iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if (bits >> (GLYPH_WIDTH - 1 - col)) & 1 == 1 {
                    fill_rect(
                        canvas,
                        origin_x + col * scale,
                        y + row as u32 * scale,
                        scale,
                        scale,
                        color,
                    );
                }
            }
        }
    }
}

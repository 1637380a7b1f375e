//! Bounding-box geometry mapping and page annotation.
//!
//! Maps the model's `[ymin, xmin, ymax, xmax]` boxes (normalized 0–1000 or
//! absolute pixels) onto page images and renders an annotated copy:
//! translucent fill, opaque outline, optional label block. The source
//! image is never mutated; every call returns a new image.

use ab_glyph::{FontVec, PxScale};
use image::{DynamicImage, Rgba, RgbaImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use tracing::debug;

use crate::config::resolve_color;

pub const DEFAULT_COLOR: &str = "red";
pub const DEFAULT_LINE_WIDTH: u32 = 3;

/// Outward padding applied to mapped boxes, in pixels.
const BOX_PADDING_PX: i64 = 2;

/// Fill opacity for the box interior (0.0 transparent, 1.0 opaque).
const FILL_ALPHA: f32 = 0.25;

/// Label text height in pixels.
const LABEL_SCALE: f32 = 16.0;

/// A bounding box resolved to pixel coordinates, clamped to the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelBox {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl PixelBox {
    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }
}

/// Map a raw `[ymin, xmin, ymax, xmax]` box to pixel coordinates for an
/// image of the given size. Returns `None` unless the box has exactly
/// four values.
///
/// If all four values are ≤ 1000 they are treated as normalized to a
/// 0–1000 grid and scaled by the image dimensions; otherwise they are
/// taken as absolute pixels. This heuristic is ambiguous for images
/// smaller than 1000px on a side — a known limitation, kept as-is.
/// Axis ordering is defended via min/max, so a producer that swaps the
/// coordinate pairs still yields a sane box.
pub fn map_bbox(bbox: &[i64], width: u32, height: u32) -> Option<PixelBox> {
    if bbox.len() != 4 {
        return None;
    }
    let (ymin, xmin, ymax, xmax) = (bbox[0], bbox[1], bbox[2], bbox[3]);

    let normalized = bbox.iter().all(|v| *v <= 1000);
    let (y0, x0, y1, x1) = if normalized {
        (
            ymin as f64 / 1000.0 * height as f64,
            xmin as f64 / 1000.0 * width as f64,
            ymax as f64 / 1000.0 * height as f64,
            xmax as f64 / 1000.0 * width as f64,
        )
    } else {
        (ymin as f64, xmin as f64, ymax as f64, xmax as f64)
    };

    // Never trust the pair ordering; derive edges via min/max, pad
    // outward, then clamp to the image bounds.
    let left = (x0.min(x1) as i64 - BOX_PADDING_PX).clamp(0, width as i64) as u32;
    let right = (x0.max(x1) as i64 + BOX_PADDING_PX).clamp(0, width as i64) as u32;
    let top = (y0.min(y1) as i64 - BOX_PADDING_PX).clamp(0, height as i64) as u32;
    let bottom = (y0.max(y1) as i64 + BOX_PADDING_PX).clamp(0, height as i64) as u32;

    Some(PixelBox {
        left,
        top,
        right,
        bottom,
    })
}

/// Renders labeled boxes onto copies of page images.
///
/// The label text needs a font; none is embedded in the crate, so callers
/// pass TTF/OTF bytes via `with_font`. Without a font the label block is
/// drawn without glyph text.
#[derive(Default)]
pub struct Annotator {
    font: Option<FontVec>,
}

impl Annotator {
    pub fn new() -> Self {
        Self { font: None }
    }

    /// Attach a TTF/OTF font for label text rendering.
    pub fn with_font(font_bytes: Vec<u8>) -> Result<Self, ab_glyph::InvalidFont> {
        let font = FontVec::try_from_vec(font_bytes)?;
        Ok(Self { font: Some(font) })
    }

    /// Draw one bounding box (plus optional label) on a copy of `image`.
    ///
    /// A malformed box (length ≠ 4) is a no-op: the returned image is
    /// pixel-identical to the input. This never fails — the overlay is a
    /// presentation aid and must not take down a completed extraction.
    pub fn annotate(
        &self,
        image: &DynamicImage,
        bbox: &[i64],
        label: Option<&str>,
        color: &str,
        line_width: u32,
    ) -> DynamicImage {
        let mut canvas: RgbaImage = image.to_rgba8();

        let Some(pixel_box) = map_bbox(bbox, canvas.width(), canvas.height()) else {
            debug!(bbox_len = bbox.len(), "Skipping malformed bounding box");
            return DynamicImage::ImageRgba8(canvas);
        };
        if pixel_box.width() == 0 || pixel_box.height() == 0 {
            return DynamicImage::ImageRgba8(canvas);
        }

        let [r, g, b] = resolve_color(color);
        let outline = Rgba([r, g, b, 255]);

        fill_translucent(&mut canvas, &pixel_box, [r, g, b]);

        for inset in 0..line_width {
            let w = pixel_box.width().saturating_sub(inset * 2);
            let h = pixel_box.height().saturating_sub(inset * 2);
            if w == 0 || h == 0 {
                break;
            }
            let rect = Rect::at(
                (pixel_box.left + inset) as i32,
                (pixel_box.top + inset) as i32,
            )
            .of_size(w, h);
            draw_hollow_rect_mut(&mut canvas, rect, outline);
        }

        if let Some(text) = label {
            self.draw_label(&mut canvas, &pixel_box, text, outline);
        }

        DynamicImage::ImageRgba8(canvas)
    }

    /// Contrasting label block at the box's top-left corner.
    fn draw_label(&self, canvas: &mut RgbaImage, pixel_box: &PixelBox, text: &str, bg: Rgba<u8>) {
        let scale = PxScale::from(LABEL_SCALE);
        let (text_w, text_h) = match &self.font {
            Some(font) => text_size(scale, font, text),
            // No font: block sized from a fixed per-glyph estimate.
            None => (text.len() as u32 * (LABEL_SCALE as u32 / 2), LABEL_SCALE as u32),
        };

        let block_w = (text_w + 8).min(canvas.width().saturating_sub(pixel_box.left));
        let block_h = (text_h + 6).min(canvas.height().saturating_sub(pixel_box.top));
        if block_w == 0 || block_h == 0 {
            return;
        }

        let rect = Rect::at(pixel_box.left as i32, pixel_box.top as i32).of_size(block_w, block_h);
        imageproc::drawing::draw_filled_rect_mut(canvas, rect, bg);

        if let Some(font) = &self.font {
            let text_color = contrasting_text_color(bg);
            draw_text_mut(
                canvas,
                text_color,
                pixel_box.left as i32 + 4,
                pixel_box.top as i32 + 3,
                scale,
                font,
                text,
            );
        }
    }
}

/// Blend the box interior toward the color at `FILL_ALPHA`.
fn fill_translucent(canvas: &mut RgbaImage, pixel_box: &PixelBox, rgb: [u8; 3]) {
    for y in pixel_box.top..pixel_box.bottom.min(canvas.height()) {
        for x in pixel_box.left..pixel_box.right.min(canvas.width()) {
            let px = canvas.get_pixel_mut(x, y);
            for c in 0..3 {
                px.0[c] =
                    (px.0[c] as f32 * (1.0 - FILL_ALPHA) + rgb[c] as f32 * FILL_ALPHA) as u8;
            }
        }
    }
}

/// White text on dark backgrounds, black on light.
fn contrasting_text_color(bg: Rgba<u8>) -> Rgba<u8> {
    let luma = 0.299 * bg.0[0] as f32 + 0.587 * bg.0[1] as f32 + 0.114 * bg.0[2] as f32;
    if luma > 150.0 {
        Rgba([0, 0, 0, 255])
    } else {
        Rgba([255, 255, 255, 255])
    }
}

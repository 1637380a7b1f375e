//! PDF page rendering via Google PDFium.
//!
//! Renders every PDF page to a raster image for vision model extraction.
//! `PdfiumRasterizer` is stateless (`Send + Sync`). Each operation creates
//! a fresh `Pdfium` instance because the upstream type is `!Send`. The OS
//! caches `dlopen`/`LoadLibrary` calls, so repeat loads are near-free.

use image::DynamicImage;
use pdfium_render::prelude::*;
use tracing::{debug, warn};

use super::{PageImage, PageRasterizer, RasterizeError};

/// Maximum dimension (width or height) for rendered page images.
/// Prevents OOM on extremely large pages or absurd DPI settings.
const MAX_DIMENSION_PX: u32 = 4096;

/// Default rendering DPI. 200 DPI balances quality and inference cost.
pub const DEFAULT_RENDER_DPI: u32 = 200;

/// PDF points per inch (standard PDF unit).
const POINTS_PER_INCH: f32 = 72.0;

/// Renders PDF pages to images using Google PDFium.
///
/// PDFium handles all PDF complexities: CIDFont encodings, embedded fonts,
/// form fields, transparency, layers.
pub struct PdfiumRasterizer;

impl PdfiumRasterizer {
    /// Create a new rasterizer, verifying the PDFium library is loadable
    /// (fail-fast at construction time).
    pub fn new() -> Result<Self, RasterizeError> {
        let _ = load_pdfium()?;
        Ok(Self)
    }
}

/// Load the PDFium dynamic library.
///
/// Discovery order:
/// 1. `PDFIUM_DYNAMIC_LIB_PATH` env var (explicit path to library file)
/// 2. Alongside the running executable
/// 3. System library search paths
fn load_pdfium() -> Result<Pdfium, RasterizeError> {
    if let Ok(path) = std::env::var("PDFIUM_DYNAMIC_LIB_PATH") {
        debug!(path = %path, "Loading PDFium from env var");
        let bindings = Pdfium::bind_to_library(&path).map_err(|e| {
            RasterizeError::LibraryLoad(format!("Failed to load PDFium from {path}: {e}"))
        })?;
        return Ok(Pdfium::new(bindings));
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(exe_dir) = exe.parent() {
            let lib_path =
                Pdfium::pdfium_platform_library_name_at_path(exe_dir.to_string_lossy().as_ref());
            if let Ok(bindings) = Pdfium::bind_to_library(&lib_path) {
                debug!(dir = %exe_dir.display(), "Loaded PDFium from executable directory");
                return Ok(Pdfium::new(bindings));
            }
        }
    }

    let bindings = Pdfium::bind_to_system_library().map_err(|e| {
        RasterizeError::LibraryLoad(format!(
            "PDFium library not found. Set PDFIUM_DYNAMIC_LIB_PATH or install PDFium: {e}"
        ))
    })?;
    Ok(Pdfium::new(bindings))
}

/// Map PDF load errors — detect encrypted PDFs for precise messaging.
fn map_load_error(e: PdfiumError) -> RasterizeError {
    let msg = format!("{e}");
    let lower = msg.to_lowercase();
    if lower.contains("password") || lower.contains("encrypt") {
        RasterizeError::PdfEncrypted
    } else {
        RasterizeError::PdfRendering {
            page: 0,
            reason: format!("Failed to load PDF: {e}"),
        }
    }
}

/// Compute pixel dimensions for rendering, applying the dimension guard.
///
/// Returns (width_px, height_px), both clamped to [1, MAX_DIMENSION_PX].
/// Preserves aspect ratio when capping.
fn compute_render_dimensions(width_points: f32, height_points: f32, dpi: u32) -> (u32, u32) {
    let scale = dpi as f32 / POINTS_PER_INCH;
    let raw_w = (width_points * scale).max(1.0);
    let raw_h = (height_points * scale).max(1.0);

    let max_dim = raw_w.max(raw_h);
    if max_dim > MAX_DIMENSION_PX as f32 {
        let ratio = MAX_DIMENSION_PX as f32 / max_dim;
        let w = ((raw_w * ratio) as u32).clamp(1, MAX_DIMENSION_PX);
        let h = ((raw_h * ratio) as u32).clamp(1, MAX_DIMENSION_PX);
        (w, h)
    } else {
        (raw_w as u32, raw_h as u32)
    }
}

impl PageRasterizer for PdfiumRasterizer {
    fn rasterize(&self, pdf_bytes: &[u8], dpi: u32) -> Result<Vec<PageImage>, RasterizeError> {
        let pdfium = load_pdfium()?;
        let document = pdfium
            .load_pdf_from_byte_slice(pdf_bytes, None)
            .map_err(map_load_error)?;

        let pages = document.pages();
        let mut rendered = Vec::with_capacity(pages.len() as usize);

        for (index, page) in pages.iter().enumerate() {
            let width_points = page.width().value;
            let height_points = page.height().value;
            let (target_w, target_h) = compute_render_dimensions(width_points, height_points, dpi);

            let uncapped_w = (width_points * dpi as f32 / POINTS_PER_INCH) as u32;
            let uncapped_h = (height_points * dpi as f32 / POINTS_PER_INCH) as u32;
            if target_w != uncapped_w || target_h != uncapped_h {
                warn!(
                    page = index + 1,
                    raw_width = uncapped_w,
                    raw_height = uncapped_h,
                    capped_width = target_w,
                    capped_height = target_h,
                    "Page dimensions capped to {MAX_DIMENSION_PX}px",
                );
            }

            let render_config = PdfRenderConfig::new()
                .set_target_width(target_w as i32)
                .set_maximum_height(target_h as i32);

            let bitmap = page.render_with_config(&render_config).map_err(|e| {
                RasterizeError::PdfRendering {
                    page: index + 1,
                    reason: format!("Rendering failed: {e}"),
                }
            })?;

            let dynamic_image = bitmap.as_image();
            debug!(
                page = index + 1,
                width = dynamic_image.width(),
                height = dynamic_image.height(),
                "Rendered PDF page"
            );
            rendered.push(PageImage::new(index as u32 + 1, dynamic_image));
        }

        Ok(rendered)
    }

    fn page_count(&self, pdf_bytes: &[u8]) -> Result<usize, RasterizeError> {
        let pdfium = load_pdfium()?;
        let document = pdfium
            .load_pdf_from_byte_slice(pdf_bytes, None)
            .map_err(map_load_error)?;
        Ok(document.pages().len() as usize)
    }
}

// ── Mock for testing ──────────────────────────────────────

/// Mock rasterizer returning N synthetic blank pages, or a scripted
/// failure. Used by orchestrator tests that need a `PageRasterizer`
/// without requiring the actual PDFium binary.
pub struct MockRasterizer {
    page_count: usize,
    fail: bool,
}

impl MockRasterizer {
    pub fn new(page_count: usize) -> Self {
        Self {
            page_count,
            fail: false,
        }
    }

    /// Rasterizer that always fails (conversion-error paths).
    pub fn failing() -> Self {
        Self {
            page_count: 0,
            fail: true,
        }
    }
}

impl PageRasterizer for MockRasterizer {
    fn rasterize(&self, _pdf_bytes: &[u8], _dpi: u32) -> Result<Vec<PageImage>, RasterizeError> {
        if self.fail {
            return Err(RasterizeError::PdfRendering {
                page: 0,
                reason: "mock conversion failure".into(),
            });
        }
        Ok((0..self.page_count)
            .map(|i| PageImage::new(i as u32 + 1, DynamicImage::new_rgb8(100, 140)))
            .collect())
    }

    fn page_count(&self, _pdf_bytes: &[u8]) -> Result<usize, RasterizeError> {
        if self.fail {
            return Err(RasterizeError::PdfRendering {
                page: 0,
                reason: "mock conversion failure".into(),
            });
        }
        Ok(self.page_count)
    }
}

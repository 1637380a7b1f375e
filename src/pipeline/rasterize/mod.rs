pub mod pdfium;

pub use pdfium::{MockRasterizer, PdfiumRasterizer, DEFAULT_RENDER_DPI};

use std::io::Cursor;
use std::path::Path;

use image::DynamicImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RasterizeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PDFium library unavailable: {0}")]
    LibraryLoad(String),

    #[error("PDF is password-protected")]
    PdfEncrypted,

    #[error("PDF rendering failed on page {page}: {reason}")]
    PdfRendering { page: usize, reason: String },

    #[error("Image processing error: {0}")]
    ImageProcessing(String),
}

/// One rendered document page. `number` is 1-indexed and matches the
/// page's position in the rasterizer output.
#[derive(Debug, Clone)]
pub struct PageImage {
    pub number: u32,
    image: DynamicImage,
}

impl PageImage {
    pub fn new(number: u32, image: DynamicImage) -> Self {
        Self { number, image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    /// Encode as PNG (lossless, for annotation output).
    pub fn to_png_bytes(&self) -> Result<Vec<u8>, RasterizeError> {
        let mut cursor = Cursor::new(Vec::new());
        self.image
            .write_to(&mut cursor, image::ImageFormat::Png)
            .map_err(|e| RasterizeError::ImageProcessing(format!("PNG encoding failed: {e}")))?;
        Ok(cursor.into_inner())
    }

    /// Encode as JPEG (compact, for inline model payloads). Alpha is
    /// dropped since the JPEG encoder rejects RGBA.
    pub fn to_jpeg_bytes(&self) -> Result<Vec<u8>, RasterizeError> {
        let rgb = DynamicImage::ImageRgb8(self.image.to_rgb8());
        let mut cursor = Cursor::new(Vec::new());
        rgb.write_to(&mut cursor, image::ImageFormat::Jpeg)
            .map_err(|e| RasterizeError::ImageProcessing(format!("JPEG encoding failed: {e}")))?;
        Ok(cursor.into_inner())
    }
}

/// Document-to-pages abstraction (allows mocking for tests).
pub trait PageRasterizer {
    /// Render every page of the document, in page order. An empty
    /// document yields an empty sequence, not an error.
    fn rasterize(&self, pdf_bytes: &[u8], dpi: u32) -> Result<Vec<PageImage>, RasterizeError>;

    fn page_count(&self, pdf_bytes: &[u8]) -> Result<usize, RasterizeError>;
}

/// Path convenience wrapper over the byte-buffer entrypoint.
pub fn rasterize_path(
    rasterizer: &dyn PageRasterizer,
    path: &Path,
    dpi: u32,
) -> Result<Vec<PageImage>, RasterizeError> {
    let bytes = std::fs::read(path)?;
    rasterizer.rasterize(&bytes, dpi)
}

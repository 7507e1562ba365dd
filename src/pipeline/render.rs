//! pdfium-backed document access: native text layer and page rasterisation.
//!
//! ## Why re-open the document per call?
//!
//! The upstream `Pdfium` handle is not `Send`, and every call here runs on a
//! `spawn_blocking` worker. Binding the library per operation keeps
//! [`PdfiumBackend`] `Send + Sync`; the OS caches the `dlopen`, so repeat
//! binds are close to free.
//!
//! ## Why cap pixels as well as DPI?
//!
//! A 300 DPI render of an A3 scan is ~3500 × 5000 px, which tesseract handles
//! fine; a poster-sized page is not. `max_rendered_pixels` caps the longest
//! edge regardless of physical page size.

use crate::config::IngestConfig;
use crate::error::DocumentError;
use crate::pipeline::text::PdfBackend;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::io::Cursor;
use std::path::PathBuf;
use tracing::{debug, warn};

/// PDF points per inch.
const POINTS_PER_INCH: f32 = 72.0;

/// Reads and rasterises PDFs through Google's pdfium.
#[derive(Debug, Clone)]
pub struct PdfiumBackend {
    library_path: Option<PathBuf>,
    max_rendered_pixels: u32,
}

impl PdfiumBackend {
    pub fn new(config: &IngestConfig) -> Self {
        Self {
            library_path: config.pdfium_library_path.clone(),
            max_rendered_pixels: config.max_rendered_pixels,
        }
    }

    /// Bind to the pdfium shared library.
    ///
    /// Discovery order:
    /// 1. the configured `pdfium_library_path`
    /// 2. alongside the running executable
    /// 3. system library search paths
    fn bind(&self) -> Result<Pdfium, DocumentError> {
        if let Some(ref path) = self.library_path {
            debug!(path = %path.display(), "Loading pdfium from configured path");
            let bindings = Pdfium::bind_to_library(path).map_err(|e| {
                DocumentError::PdfiumBindingFailed(format!("{}: {e}", path.display()))
            })?;
            return Ok(Pdfium::new(bindings));
        }

        if let Ok(exe) = std::env::current_exe() {
            if let Some(exe_dir) = exe.parent() {
                let lib_path = Pdfium::pdfium_platform_library_name_at_path(exe_dir);
                if let Ok(bindings) = Pdfium::bind_to_library(&lib_path) {
                    debug!(dir = %exe_dir.display(), "Loaded pdfium next to executable");
                    return Ok(Pdfium::new(bindings));
                }
            }
        }

        let bindings = Pdfium::bind_to_system_library()
            .map_err(|e| DocumentError::PdfiumBindingFailed(e.to_string()))?;
        Ok(Pdfium::new(bindings))
    }
}

impl PdfBackend for PdfiumBackend {
    fn page_texts(&self, pdf_bytes: &[u8]) -> Result<Vec<String>, DocumentError> {
        let pdfium = self.bind()?;
        let document = pdfium
            .load_pdf_from_byte_slice(pdf_bytes, None)
            .map_err(map_load_error)?;

        let mut texts = Vec::new();
        for (idx, page) in document.pages().iter().enumerate() {
            // A page whose text layer cannot be read counts as having none;
            // the OCR fallback will pick it up if the whole document is empty.
            let text = match page.text() {
                Ok(t) => t.all(),
                Err(e) => {
                    warn!("Page {}: text layer unreadable: {}", idx + 1, e);
                    String::new()
                }
            };
            texts.push(text);
        }
        debug!("Read text layer of {} pages", texts.len());
        Ok(texts)
    }

    fn render_page_grayscale(
        &self,
        pdf_bytes: &[u8],
        page_index: usize,
        dpi: u32,
    ) -> Result<Vec<u8>, DocumentError> {
        let pdfium = self.bind()?;
        let document = pdfium
            .load_pdf_from_byte_slice(pdf_bytes, None)
            .map_err(map_load_error)?;

        let page = document.pages().iter().nth(page_index).ok_or_else(|| {
            DocumentError::RasterisationFailed {
                page: page_index + 1,
                detail: "page out of range".to_string(),
            }
        })?;

        let (width, height) = compute_render_dimensions(
            page.width().value,
            page.height().value,
            dpi,
            self.max_rendered_pixels,
        );

        let render_config = PdfRenderConfig::new()
            .set_target_width(width as i32)
            .set_maximum_height(height as i32);

        let bitmap = page.render_with_config(&render_config).map_err(|e| {
            DocumentError::RasterisationFailed {
                page: page_index + 1,
                detail: format!("{:?}", e),
            }
        })?;

        let gray = bitmap.as_image().grayscale();
        debug!(
            "Rendered page {} → {}x{} px grayscale",
            page_index + 1,
            gray.width(),
            gray.height()
        );
        encode_png(&gray).map_err(|e| DocumentError::RasterisationFailed {
            page: page_index + 1,
            detail: format!("PNG encoding failed: {e}"),
        })
    }
}

/// Map pdfium load errors, singling out encrypted documents.
fn map_load_error(e: PdfiumError) -> DocumentError {
    let msg = format!("{e:?}");
    let lower = msg.to_lowercase();
    if lower.contains("password") || lower.contains("encrypt") {
        DocumentError::PasswordProtected
    } else {
        DocumentError::Corrupt { detail: msg }
    }
}

/// Pixel dimensions for a page at `dpi`, longest edge capped at `max_px`.
///
/// Returns (width_px, height_px), both ≥ 1, preserving aspect ratio.
pub(crate) fn compute_render_dimensions(
    width_points: f32,
    height_points: f32,
    dpi: u32,
    max_px: u32,
) -> (u32, u32) {
    let scale = dpi as f32 / POINTS_PER_INCH;
    let raw_w = (width_points * scale).max(1.0);
    let raw_h = (height_points * scale).max(1.0);

    let longest = raw_w.max(raw_h);
    if longest > max_px as f32 {
        let ratio = max_px as f32 / longest;
        let w = ((raw_w * ratio).round() as u32).clamp(1, max_px);
        let h = ((raw_h * ratio).round() as u32).clamp(1, max_px);
        (w, h)
    } else {
        (raw_w.round() as u32, raw_h.round() as u32)
    }
}

/// Encode an image as lossless PNG; JPEG artefacts hurt OCR on small print.
pub(crate) fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}

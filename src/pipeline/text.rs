//! Document → text, with an OCR fallback for scanned reports.
//!
//! ## Why text layer first?
//!
//! Most lab reports are exported from practice-management software and carry
//! a perfect text layer; reading it is instant and lossless. Only when the
//! layer is empty (a scan, a photo printed to PDF) do we pay for
//! rasterisation plus tesseract, page by page.
//!
//! Both backends sit behind traits ([`PdfBackend`], [`OcrEngine`]) so the
//! fallback decision can be tested without pdfium or tesseract installed.

use crate::config::IngestConfig;
use crate::error::{DocumentError, IngestError};
use crate::pipeline::ocr::TesseractOcr;
use crate::pipeline::render::PdfiumBackend;
use crate::progress::ProgressCallback;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Read access to a PDF's pages.
///
/// Called from a blocking worker thread; implementations may block.
pub trait PdfBackend: Send + Sync {
    /// Native text layer of every page, in page order.
    fn page_texts(&self, pdf_bytes: &[u8]) -> Result<Vec<String>, DocumentError>;

    /// Render one page (0-indexed) at `dpi` and return grayscale PNG bytes.
    fn render_page_grayscale(
        &self,
        pdf_bytes: &[u8],
        page_index: usize,
        dpi: u32,
    ) -> Result<Vec<u8>, DocumentError>;
}

/// Turns a page image into text.
pub trait OcrEngine: Send + Sync {
    /// Recognise text in a PNG image. `page_num` is 1-indexed, for errors.
    fn recognize(&self, png: &[u8], page_num: usize) -> Result<String, DocumentError>;
}

/// How the text of a document was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    TextLayer,
    Ocr,
}

/// Result of [`DocumentTextExtractor::extract`].
#[derive(Debug, Clone, Serialize)]
pub struct TextExtraction {
    pub text: String,
    pub method: ExtractionMethod,
    pub page_count: usize,
}

/// Extracts the textual content of a PDF.
#[derive(Clone)]
pub struct DocumentTextExtractor {
    backend: Arc<dyn PdfBackend>,
    ocr: Arc<dyn OcrEngine>,
    dpi: u32,
    max_document_bytes: usize,
    progress: Option<ProgressCallback>,
}

impl DocumentTextExtractor {
    /// pdfium for the text layer and rendering, tesseract for OCR.
    pub fn new(config: &IngestConfig) -> Self {
        Self::with_engines(
            Arc::new(PdfiumBackend::new(config)),
            Arc::new(TesseractOcr::new(config)),
            config,
        )
    }

    /// Use caller-supplied backends.
    pub fn with_engines(
        backend: Arc<dyn PdfBackend>,
        ocr: Arc<dyn OcrEngine>,
        config: &IngestConfig,
    ) -> Self {
        Self {
            backend,
            ocr,
            dpi: config.ocr_dpi,
            max_document_bytes: config.max_document_bytes,
            progress: config.progress_callback.clone(),
        }
    }

    /// Extract text on a blocking worker thread.
    pub async fn extract(&self, pdf_bytes: &[u8]) -> Result<TextExtraction, IngestError> {
        let this = self.clone();
        let bytes = pdf_bytes.to_vec();
        let result = tokio::task::spawn_blocking(move || this.extract_blocking(&bytes))
            .await
            .map_err(|e| IngestError::Internal(format!("Text extraction task panicked: {}", e)))?;
        Ok(result?)
    }

    /// Synchronous extraction; blocks on pdfium and the OCR engine.
    pub fn extract_blocking(&self, pdf_bytes: &[u8]) -> Result<TextExtraction, DocumentError> {
        validate_document(pdf_bytes, self.max_document_bytes)?;

        let pages = self.backend.page_texts(pdf_bytes)?;
        let page_count = pages.len();

        if pages.iter().any(|p| !p.trim().is_empty()) {
            let text = pages
                .iter()
                .map(|p| p.trim())
                .filter(|p| !p.is_empty())
                .collect::<Vec<_>>()
                .join("\n\n");
            debug!("Text layer: {} pages, {} chars", page_count, text.len());
            return Ok(TextExtraction {
                text,
                method: ExtractionMethod::TextLayer,
                page_count,
            });
        }

        info!("No text layer found; running OCR on {} pages", page_count);
        let mut recognised = Vec::with_capacity(page_count);
        for idx in 0..page_count {
            let page_num = idx + 1;
            let png = self.backend.render_page_grayscale(pdf_bytes, idx, self.dpi)?;
            let text = self.ocr.recognize(&png, page_num)?;
            debug!("OCR page {}: {} chars", page_num, text.len());
            if let Some(ref cb) = self.progress {
                cb.on_ocr_page(page_num, page_count);
            }
            recognised.push(text);
        }

        // A blank scan stays blank: no page markers around nothing.
        let text = if recognised.iter().all(|t| t.trim().is_empty()) {
            String::new()
        } else {
            recognised
                .iter()
                .enumerate()
                .map(|(i, t)| format!("# Page {}\n\n{}\n\n---\n\n", i + 1, t.trim()))
                .collect()
        };

        Ok(TextExtraction {
            text,
            method: ExtractionMethod::Ocr,
            page_count,
        })
    }
}

/// Reject uploads that cannot be a PDF before any parser sees them.
pub fn validate_document(bytes: &[u8], max_bytes: usize) -> Result<(), DocumentError> {
    if bytes.is_empty() {
        return Err(DocumentError::Empty);
    }
    if bytes.len() > max_bytes {
        return Err(DocumentError::TooLarge {
            size: bytes.len(),
            limit: max_bytes,
        });
    }
    if !bytes.starts_with(b"%PDF") {
        return Err(DocumentError::NotAPdf {
            magic: bytes.iter().take(8).copied().collect(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PDF: &[u8] = b"%PDF-1.7\n%fake body";

    struct FakePdf {
        pages: Vec<String>,
        renders: AtomicUsize,
    }

    impl FakePdf {
        fn new(pages: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                pages: pages.iter().map(|s| s.to_string()).collect(),
                renders: AtomicUsize::new(0),
            })
        }
    }

    impl PdfBackend for FakePdf {
        fn page_texts(&self, _pdf_bytes: &[u8]) -> Result<Vec<String>, DocumentError> {
            Ok(self.pages.clone())
        }

        fn render_page_grayscale(
            &self,
            _pdf_bytes: &[u8],
            page_index: usize,
            _dpi: u32,
        ) -> Result<Vec<u8>, DocumentError> {
            self.renders.fetch_add(1, Ordering::SeqCst);
            Ok(vec![page_index as u8])
        }
    }

    struct FakeOcr {
        calls: AtomicUsize,
        blank: bool,
    }

    impl FakeOcr {
        fn new(blank: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                blank,
            })
        }
    }

    impl OcrEngine for FakeOcr {
        fn recognize(&self, png: &[u8], page_num: usize) -> Result<String, DocumentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.blank {
                return Ok("  \n".to_string());
            }
            Ok(format!("scanned text {} (img {})", page_num, png[0]))
        }
    }

    fn extractor(pdf: Arc<FakePdf>, ocr: Arc<FakeOcr>) -> DocumentTextExtractor {
        let config = IngestConfig::default();
        DocumentTextExtractor::with_engines(pdf, ocr, &config)
    }

    #[test]
    fn text_layer_skips_ocr() {
        let pdf = FakePdf::new(&["Glucose 95 mg/dL", "", "ALT 40 U/L"]);
        let ocr = FakeOcr::new(false);
        let out = extractor(pdf.clone(), ocr.clone())
            .extract_blocking(PDF)
            .unwrap();

        assert_eq!(out.method, ExtractionMethod::TextLayer);
        assert_eq!(out.text, "Glucose 95 mg/dL\n\nALT 40 U/L");
        assert_eq!(out.page_count, 3);
        assert_eq!(ocr.calls.load(Ordering::SeqCst), 0);
        assert_eq!(pdf.renders.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn empty_text_layer_falls_back_to_ocr_per_page() {
        let pdf = FakePdf::new(&["", "  ", "\n"]);
        let ocr = FakeOcr::new(false);
        let out = extractor(pdf.clone(), ocr.clone())
            .extract_blocking(PDF)
            .unwrap();

        assert_eq!(out.method, ExtractionMethod::Ocr);
        assert_eq!(ocr.calls.load(Ordering::SeqCst), 3);
        assert_eq!(pdf.renders.load(Ordering::SeqCst), 3);

        let first = out.text.find("# Page 1\n\n").unwrap();
        let second = out.text.find("# Page 2\n\n").unwrap();
        let third = out.text.find("# Page 3\n\n").unwrap();
        assert!(first < second && second < third);
        assert_eq!(out.text.matches("# Page ").count(), 3);
        assert!(out.text.starts_with("# Page 1\n\nscanned text 1 (img 0)\n\n---\n\n"));
    }

    #[test]
    fn blank_document_yields_empty_text() {
        let pdf = FakePdf::new(&["", ""]);
        let ocr = FakeOcr::new(true);
        let out = extractor(pdf, ocr.clone()).extract_blocking(PDF).unwrap();
        assert_eq!(out.text, "");
        assert_eq!(ocr.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn rejects_non_pdf_before_parsing() {
        let pdf = FakePdf::new(&["text"]);
        let err = extractor(pdf, FakeOcr::new(false))
            .extract_blocking(b"PK\x03\x04zipfile")
            .unwrap_err();
        assert!(matches!(err, DocumentError::NotAPdf { .. }));
    }

    #[test]
    fn validate_document_limits() {
        assert!(matches!(validate_document(b"", 10), Err(DocumentError::Empty)));
        assert!(matches!(
            validate_document(b"%PDF-1.4 too long", 8),
            Err(DocumentError::TooLarge { size: 17, limit: 8 })
        ));
        assert!(validate_document(b"%PDF-1.4", 1024).is_ok());
    }

    #[tokio::test]
    async fn async_extract_reports_ocr_progress() {
        use crate::progress::IngestProgressCallback;

        struct PageCounter(AtomicUsize);
        impl IngestProgressCallback for PageCounter {
            fn on_ocr_page(&self, _page_num: usize, _total_pages: usize) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let counter = Arc::new(PageCounter(AtomicUsize::new(0)));
        let config = IngestConfig::builder()
            .progress_callback(counter.clone())
            .build()
            .unwrap();
        let extractor =
            DocumentTextExtractor::with_engines(FakePdf::new(&["", ""]), FakeOcr::new(false), &config);

        let out = extractor.extract(PDF).await.unwrap();
        assert_eq!(out.method, ExtractionMethod::Ocr);
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }
}

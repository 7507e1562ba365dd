//! Optical character recognition via the tesseract command-line tool.
//!
//! Each page image is written into its own `TempDir` so concurrent
//! ingestions never share a path; the directory is removed on drop whether
//! recognition succeeded or not.

use crate::config::IngestConfig;
use crate::error::DocumentError;
use crate::pipeline::text::OcrEngine;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Command;
use tracing::{debug, warn};

/// Runs the `tesseract` executable on one page image at a time.
#[derive(Debug, Clone)]
pub struct TesseractOcr {
    cmd: PathBuf,
    psm: u8,
    language: String,
}

impl TesseractOcr {
    pub fn new(config: &IngestConfig) -> Self {
        Self {
            cmd: config.tesseract_cmd.clone(),
            psm: config.tesseract_psm,
            language: config.ocr_language.clone(),
        }
    }
}

impl OcrEngine for TesseractOcr {
    fn recognize(&self, png: &[u8], page_num: usize) -> Result<String, DocumentError> {
        let dir = tempfile::Builder::new().prefix("labpage-").tempdir()?;
        let image_path = dir.path().join(format!("page-{page_num}.png"));
        std::fs::write(&image_path, png)?;

        debug!(
            "tesseract page {} (psm {}, lang {})",
            page_num, self.psm, self.language
        );
        let output = Command::new(&self.cmd)
            .arg(&image_path)
            .arg("stdout")
            .arg("--psm")
            .arg(self.psm.to_string())
            .arg("-l")
            .arg(&self.language)
            .output()
            .map_err(|e| DocumentError::Ocr {
                page: page_num,
                detail: if e.kind() == ErrorKind::NotFound {
                    format!("executable '{}' not found", self.cmd.display())
                } else {
                    e.to_string()
                },
            })?;

        if let Err(e) = dir.close() {
            warn!("Failed to remove OCR staging dir for page {}: {}", page_num, e);
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DocumentError::Ocr {
                page: page_num,
                detail: format!("exit status {}: {}", output.status, stderr.trim()),
            });
        }

        Ok(clean_ocr_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Strip form feeds tesseract emits between pages and trailing whitespace.
fn clean_ocr_output(raw: &str) -> String {
    raw.replace('\u{000C}', "")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_feeds_and_trailing_space_removed() {
        let raw = "Glucose   95 mg/dL   \nALT 40 U/L\n\n\u{000C}";
        assert_eq!(clean_ocr_output(raw), "Glucose   95 mg/dL\nALT 40 U/L");
    }

    #[test]
    fn missing_executable_is_ocr_error() {
        let config = IngestConfig::builder()
            .tesseract_cmd("/nonexistent/bin/tesseract-labsift")
            .build()
            .unwrap();
        let ocr = TesseractOcr::new(&config);
        let err = ocr.recognize(b"\x89PNG\r\n\x1a\n", 4).unwrap_err();
        match err {
            DocumentError::Ocr { page, detail } => {
                assert_eq!(page, 4);
                assert!(detail.contains("not found"), "got: {detail}");
            }
            other => panic!("expected Ocr error, got {other:?}"),
        }
    }
}

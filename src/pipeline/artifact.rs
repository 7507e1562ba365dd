//! The durable audit artifact: the parsed report as pretty JSON on disk.
//!
//! Layout: `<content_dir>/<subject_id>/<filename>.json`. The artifact's
//! canonical path doubles as the lab's `source_path`, so re-ingesting the
//! same file name for the same subject deduplicates against earlier runs.
//!
//! Writes are atomic: the JSON goes to a uniquely named temp file in the
//! target directory, which is then renamed over the final path. Readers never
//! see a half-written artifact and concurrent writers never share a temp file.

use crate::error::{IngestError, SchemaError};
use crate::model::LabReport;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Artifact path for `filename` of `subject_id`, without touching the disk.
///
/// Only the final component of `filename` is used, so a client-supplied
/// `../../etc/passwd` lands in the subject's directory as `passwd.json`.
pub fn artifact_path(content_dir: &Path, subject_id: i64, filename: &str) -> PathBuf {
    let base = Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.trim().is_empty() && n != "." && n != "..")
        .unwrap_or_else(|| "document".to_string());
    content_dir
        .join(subject_id.to_string())
        .join(format!("{base}.json"))
}

/// Atomically write `report` and return the artifact's canonical path.
pub fn write_artifact(
    content_dir: &Path,
    subject_id: i64,
    filename: &str,
    report: &LabReport,
) -> Result<PathBuf, IngestError> {
    let path = artifact_path(content_dir, subject_id, filename);
    let write_err = |source: std::io::Error| IngestError::ArtifactWriteFailed {
        path: path.clone(),
        source,
    };

    let dir = path
        .parent()
        .ok_or_else(|| IngestError::Internal(format!("no parent for {}", path.display())))?;
    std::fs::create_dir_all(dir).map_err(write_err)?;

    let json = serde_json::to_vec_pretty(report)
        .map_err(|e| IngestError::Internal(format!("artifact serialisation: {e}")))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".artifact-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(write_err)?;
    tmp.write_all(&json).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(&path).map_err(|e| write_err(e.error))?;

    let canonical = std::fs::canonicalize(&path).map_err(write_err)?;
    debug!("Wrote audit artifact {} ({} bytes)", canonical.display(), json.len());
    Ok(canonical)
}

/// Read an artifact back, returning its canonical path and report.
pub fn read_artifact(path: &Path) -> Result<(PathBuf, LabReport), SchemaError> {
    let read_err = |source: std::io::Error| SchemaError::ArtifactRead {
        path: path.to_path_buf(),
        source,
    };
    let canonical = std::fs::canonicalize(path).map_err(read_err)?;
    let bytes = std::fs::read(&canonical).map_err(read_err)?;
    let report = serde_json::from_slice::<LabReport>(&bytes).map_err(|e| SchemaError::Shape {
        reason: format!("{}: {e}", canonical.display()),
    })?;
    Ok((canonical, report))
}

use crate::error::IngestError;
use crate::models::DocumentFingerprint;
use crate::pipeline::{IngestionPipeline, IngestionRun};
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

pub fn discover_pdf_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_pdf = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

        if is_pdf {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

pub fn digest_file(path: &Path) -> Result<String, IngestError> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn document_fingerprint(path: &Path) -> Result<DocumentFingerprint, IngestError> {
    let checksum = digest_file(path)?;
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| IngestError::MissingFileName(path.display().to_string()))?;

    Ok(DocumentFingerprint {
        document_id: generate_document_id(path),
        document_title: name.to_string(),
        source_path: path.to_string_lossy().to_string(),
        checksum,
        ingested_at: Utc::now(),
    })
}

fn generate_document_id(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedPdf {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestionReport {
    pub runs: Vec<IngestionRun>,
    pub skipped_files: Vec<SkippedPdf>,
}

impl IngestionReport {
    pub fn children_written(&self) -> usize {
        self.runs.iter().map(|run| run.children_written).sum()
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.runs.iter().map(|run| run.cost.total_cost_usd).sum()
    }
}

pub fn resolve_targets(target: &Path) -> Result<Vec<PathBuf>, IngestError> {
    if target.is_file() {
        return Ok(vec![target.to_path_buf()]);
    }
    if !target.is_dir() {
        return Err(IngestError::InvalidArgument(format!(
            "{} is neither a file nor a folder",
            target.display()
        )));
    }

    let files = discover_pdf_files(target);
    if files.is_empty() {
        return Err(IngestError::InvalidArgument(format!(
            "no pdf files found in {}",
            target.display()
        )));
    }
    Ok(files)
}

pub async fn ingest_best_effort(
    pipeline: &mut IngestionPipeline,
    target: &Path,
) -> Result<IngestionReport, IngestError> {
    let files = resolve_targets(target)?;
    info!(target = %target.display(), files = files.len(), "ingestion started");

    let mut report = IngestionReport::default();
    for path in files {
        match pipeline.ingest_document(&path).await {
            Ok(run) => report.runs.push(run),
            Err(error) => {
                warn!(path = %path.display(), %error, "pdf skipped");
                report.skipped_files.push(SkippedPdf {
                    path,
                    reason: error.to_string(),
                });
            }
        }
    }

    info!(
        documents = report.runs.len(),
        skipped = report.skipped_files.len(),
        children = report.children_written(),
        cost_usd = report.total_cost_usd(),
        "ingestion finished"
    );
    Ok(report)
}

//! Document access: page counts and page-range extraction.
//!
//! The default implementation drives the `qpdf` system binary, the same way
//! text extraction elsewhere in this codebase's lineage shells out to PDF
//! tooling rather than linking a renderer.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::TempDir;

use crate::error::AnalysisError;
use crate::service::DocumentBlob;

/// Access to source documents by id (here: filesystem path).
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Number of pages in the document.
    async fn page_count(&self, doc_id: &str) -> Result<u32, AnalysisError>;

    /// Extract an inclusive 1-based page range into a standalone document.
    async fn extract_pages(
        &self,
        doc_id: &str,
        start: u32,
        end: u32,
    ) -> Result<DocumentBlob, AnalysisError>;

    /// Load the whole document.
    async fn load(&self, doc_id: &str) -> Result<DocumentBlob, AnalysisError>;
}

/// `qpdf`-backed store for PDF files on disk.
pub struct PdfToolStore {
    qpdf: PathBuf,
    scratch: TempDir,
    /// Page counts by document id, filled on first query.
    page_counts: std::sync::Mutex<std::collections::HashMap<String, u32>>,
}

impl PdfToolStore {
    pub fn new() -> Result<Self, AnalysisError> {
        let qpdf =
            which::which("qpdf").map_err(|_| AnalysisError::MissingTool("qpdf".to_string()))?;
        let scratch = tempfile::tempdir()?;
        Ok(Self {
            qpdf,
            scratch,
            page_counts: std::sync::Mutex::new(std::collections::HashMap::new()),
        })
    }

    fn display_name(doc_id: &str) -> String {
        Path::new(doc_id)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| doc_id.to_string())
    }
}

#[async_trait]
impl DocumentStore for PdfToolStore {
    async fn page_count(&self, doc_id: &str) -> Result<u32, AnalysisError> {
        if let Ok(cache) = self.page_counts.lock() {
            if let Some(&count) = cache.get(doc_id) {
                return Ok(count);
            }
        }
        let output = tokio::process::Command::new(&self.qpdf)
            .arg("--show-npages")
            .arg(doc_id)
            .output()
            .await?;
        if !output.status.success() {
            return Err(AnalysisError::invalid_document(
                doc_id,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let count: u32 = String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse()
            .map_err(|_| {
                AnalysisError::invalid_document(doc_id, "page count could not be determined")
            })?;
        if count == 0 {
            return Err(AnalysisError::invalid_document(doc_id, "document is empty"));
        }
        if let Ok(mut cache) = self.page_counts.lock() {
            cache.insert(doc_id.to_string(), count);
        }
        Ok(count)
    }

    async fn extract_pages(
        &self,
        doc_id: &str,
        start: u32,
        end: u32,
    ) -> Result<DocumentBlob, AnalysisError> {
        let out_path = self
            .scratch
            .path()
            .join(format!("{}.pdf", uuid::Uuid::new_v4()));
        let output = tokio::process::Command::new(&self.qpdf)
            .arg("--empty")
            .arg("--pages")
            .arg(doc_id)
            .arg(format!("{}-{}", start, end))
            .arg("--")
            .arg(&out_path)
            .output()
            .await?;
        if !output.status.success() {
            return Err(AnalysisError::Store(format!(
                "qpdf failed extracting pages {}-{} of {}: {}",
                start,
                end,
                doc_id,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let data = tokio::fs::read(&out_path).await?;
        let _ = tokio::fs::remove_file(&out_path).await;
        tracing::debug!(
            "Extracted pages {}-{} of {} ({} bytes)",
            start,
            end,
            doc_id,
            data.len()
        );
        Ok(DocumentBlob::pdf(
            format!("{} p{}-{}", Self::display_name(doc_id), start, end),
            data,
        ))
    }

    async fn load(&self, doc_id: &str) -> Result<DocumentBlob, AnalysisError> {
        let data = tokio::fs::read(doc_id).await?;
        Ok(DocumentBlob::pdf(Self::display_name(doc_id), data))
    }
}

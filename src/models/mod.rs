//! Core data model: chunk descriptors, analysis tasks, per-task outcomes,
//! and the merged final result.

mod records;

pub use records::{ChunkRecords, Connection, Finding, PrimaryPage};

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Which document the analysis output is organized around.
///
/// Primary-centric responses group findings by primary-document page, each
/// finding carrying connections into the partner chunk. Partner-centric
/// responses are a flat list of partner pages relevant to the primary.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum AnalysisMode {
    #[default]
    PrimaryCentric,
    PartnerCentric,
}

impl AnalysisMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisMode::PrimaryCentric => "primary-centric",
            AnalysisMode::PartnerCentric => "partner-centric",
        }
    }
}

impl std::fmt::Display for AnalysisMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bounded, non-overlapping page range of a partner document.
///
/// Pages are 1-based inclusive. Immutable once planned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    /// Document this chunk was cut from.
    pub doc_id: String,
    /// Position within the document's chunk sequence, starting at 0.
    pub chunk_index: usize,
    pub start_page: u32,
    pub end_page: u32,
}

impl ChunkDescriptor {
    /// Number of pages covered by this chunk.
    pub fn page_span(&self) -> u32 {
        self.end_page - self.start_page + 1
    }

    /// Offset added to chunk-local page references to map them back into
    /// the owning document's coordinate space.
    pub fn page_offset(&self) -> u32 {
        self.start_page - 1
    }
}

/// One unit of work: analyze a partner-document chunk against the primary.
#[derive(Debug, Clone)]
pub struct AnalysisTask {
    /// Slot in the output buffer. Stable across retries and completion order.
    pub task_index: usize,
    pub chunk: ChunkDescriptor,
    /// Partner document this chunk belongs to. Mirrors `chunk.doc_id`.
    pub partner_doc: String,
    /// Failover attempts consumed so far, updated when the task runs.
    pub attempts_used: u32,
}

impl AnalysisTask {
    pub fn new(task_index: usize, chunk: ChunkDescriptor) -> Self {
        let partner_doc = chunk.doc_id.clone();
        Self {
            task_index,
            chunk,
            partner_doc,
            attempts_used: 0,
        }
    }
}

/// Result of one task, written exactly once into its output-buffer slot.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_index: usize,
    pub chunk: ChunkDescriptor,
    /// Parsed records, present on full or partial success.
    pub records: Option<ChunkRecords>,
    /// Whether the records were salvaged from a malformed response.
    pub is_partial: bool,
    pub error: Option<ErrorKind>,
    pub attempts_used: u32,
}

impl TaskOutcome {
    pub fn failed(task: &AnalysisTask, error: ErrorKind, attempts: u32) -> Self {
        Self {
            task_index: task.task_index,
            chunk: task.chunk.clone(),
            records: None,
            is_partial: false,
            error: Some(error),
            attempts_used: attempts,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.records.is_some()
    }
}

/// Findings for one primary-document page after merging all chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedPage {
    pub page: u32,
    pub findings: Vec<Finding>,
}

/// Final merged output: ordered, deduplicated, score-filtered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergedResult {
    pub mode: AnalysisMode,
    pub primary_doc: String,
    /// Populated in primary-centric mode, sorted ascending by page.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pages: Vec<MergedPage>,
    /// Populated in partner-centric mode, sorted by (doc, page).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<Connection>,
    /// Chunks that produced no usable records.
    pub failed_chunks: usize,
    /// Chunks recovered only partially from malformed responses.
    pub partial_chunks: usize,
    pub generated_at: chrono::DateTime<chrono::Utc>,
}

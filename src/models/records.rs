//! Closed response record shapes, validated strictly on ingress.
//!
//! The analysis service is asked for JSON matching one of these shapes per
//! mode. Unknown or extra fields are dropped during deserialization rather
//! than propagated.

use serde::{Deserialize, Serialize};

/// A reference from the analyzed content into a partner document page.
///
/// On the wire the `page` field is chunk-local; the merger maps it into the
/// partner document's coordinate space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub doc: String,
    pub page: u32,
    #[serde(default)]
    pub reason: String,
    pub score: u32,
}

/// A single matched item on a primary-document page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub label: String,
    pub excerpt: String,
    pub summary: String,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

impl Finding {
    /// Minimal-shape check used by partial recovery: all required fields
    /// present with real content, no placeholders standing in for answers.
    pub fn is_complete(&self) -> bool {
        !self.label.trim().is_empty()
            && !self.excerpt.trim().is_empty()
            && !self.summary.trim().is_empty()
    }
}

/// Findings grouped under one primary-document page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimaryPage {
    pub page: u32,
    #[serde(default)]
    pub findings: Vec<Finding>,
}

/// Validated records decoded from one chunk response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkRecords {
    PrimaryCentric { pages: Vec<PrimaryPage> },
    PartnerCentric { related: Vec<Connection> },
}

impl ChunkRecords {
    /// Total record count, used for quality heuristics and logging.
    pub fn record_count(&self) -> usize {
        match self {
            ChunkRecords::PrimaryCentric { pages } => {
                pages.iter().map(|p| p.findings.len()).sum()
            }
            ChunkRecords::PartnerCentric { related } => related.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.record_count() == 0
    }
}

//! Error taxonomy for the analysis orchestrator.
//!
//! `ErrorKind` classifies individual service-call failures and drives the
//! failover policy; `AnalysisError` is the job-level error surfaced to
//! callers of [`crate::analyzer::Analyzer::analyze`].

use thiserror::Error;

/// Classification of a failed operation.
///
/// The dispatcher keys its retry decisions off this: `RateLimited` rotates
/// to another credential immediately, transient kinds back off and retry,
/// `ContentBlocked` is terminal for the task on every credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Quota or rate limiting (HTTP 429, resource exhausted).
    RateLimited,
    /// Content-policy refusal. Depends on the input, not the credential.
    ContentBlocked,
    /// Server-side failure (5xx, malformed service reply).
    Server,
    /// Client-side connectivity failure.
    Network,
    /// The bounded call deadline elapsed.
    Timeout,
    /// The response survived no stage of the repair pipeline.
    Parse,
    /// The document store could not produce the chunk payload.
    Store,
    /// No credential was selectable within the wait bound.
    PoolExhausted,
    /// The job was cancelled before this task ran.
    Cancelled,
}

impl ErrorKind {
    /// Whether a retry with backoff can plausibly change the outcome.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::Server | ErrorKind::Network | ErrorKind::Timeout)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ContentBlocked => "content_blocked",
            ErrorKind::Server => "server",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Parse => "parse",
            ErrorKind::Store => "store",
            ErrorKind::PoolExhausted => "pool_exhausted",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job-level analysis errors.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("no credentials configured")]
    NoCredentials,
    #[error("invalid document {path}: {reason}")]
    InvalidDocument { path: String, reason: String },
    #[error("analysis cancelled")]
    Cancelled,
    #[error("document store error: {0}")]
    Store(String),
    #[error("required tool not found: {0}")]
    MissingTool(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AnalysisError {
    pub fn invalid_document(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDocument {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

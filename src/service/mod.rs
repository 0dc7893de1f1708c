//! Content-analysis service abstraction.
//!
//! The orchestrator talks to the external matching service through the
//! [`ContentAnalysisService`] trait, with one independent client instance
//! per credential so no client state is shared across tasks.

pub mod gemini;
pub mod prompts;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::ErrorKind;

/// An in-memory document payload sent with an analysis request.
#[derive(Debug, Clone)]
pub struct DocumentBlob {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl DocumentBlob {
    pub fn pdf(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: "application/pdf".to_string(),
            data,
        }
    }
}

/// Failure modes of a single service invocation.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("content blocked: {0}")]
    ContentBlocked(String),
    #[error("server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::RateLimited(_) => ErrorKind::RateLimited,
            ServiceError::ContentBlocked(_) => ErrorKind::ContentBlocked,
            ServiceError::Server { .. } => ErrorKind::Server,
            ServiceError::Network(_) => ErrorKind::Network,
            ServiceError::Timeout(_) => ErrorKind::Timeout,
        }
    }
}

/// A client for the external semantic-matching service.
///
/// Implementations hold their own credential and connection state; the
/// dispatcher owns one instance per pool credential, index-aligned.
#[async_trait]
pub trait ContentAnalysisService: Send + Sync {
    /// Send a prompt plus document payloads, returning the raw response text.
    async fn invoke(
        &self,
        prompt: &str,
        documents: &[DocumentBlob],
    ) -> Result<String, ServiceError>;
}

//! Google Gemini backend for the content-analysis service.
//!
//! Talks to the Generative Language REST API with JSON response mode.
//! Each client instance is bound to exactly one API key; multi-key
//! deployments construct one client per credential.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ContentAnalysisService, DocumentBlob, ServiceError};

/// Connection settings for the Gemini API.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub endpoint: String,
    /// Model id, e.g. "gemini-2.5-flash" or "gemini-2.5-pro".
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    /// Bounded deadline for one generateContent call.
    pub request_timeout: Duration,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            model: "gemini-2.5-flash".to_string(),
            temperature: 0.2,
            max_output_tokens: 8192,
            request_timeout: Duration::from_secs(300),
        }
    }
}

impl GeminiConfig {
    /// Apply `ANALYSIS_MODEL` / `ANALYSIS_ENDPOINT` environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(model) = std::env::var("ANALYSIS_MODEL") {
            config.model = model;
        }
        if let Ok(endpoint) = std::env::var("ANALYSIS_ENDPOINT") {
            config.endpoint = endpoint;
        }
        config
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum GeminiPart {
    Text { text: String },
    InlineData { inline_data: GeminiInlineData },
}

#[derive(Debug, Serialize)]
struct GeminiInlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct GeminiGenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    #[serde(rename = "responseMimeType")]
    response_mime_type: String,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    #[serde(rename = "promptFeedback")]
    prompt_feedback: Option<GeminiPromptFeedback>,
    error: Option<GeminiError>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiResponseContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiPromptFeedback {
    #[serde(rename = "blockReason")]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    message: String,
}

/// Gemini client bound to a single API key.
pub struct GeminiClient {
    config: GeminiConfig,
    api_key: String,
    /// Safe identifier for logs, e.g. `k2:***abcd`.
    key_tag: String,
    http: reqwest::Client,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig, api_key: impl Into<String>, key_tag: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self {
            config,
            api_key: api_key.into(),
            key_tag: key_tag.into(),
            http,
        }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn build_request(&self, prompt: &str, documents: &[DocumentBlob]) -> GeminiRequest {
        let mut parts = vec![GeminiPart::Text {
            text: prompt.to_string(),
        }];
        for blob in documents {
            parts.push(GeminiPart::InlineData {
                inline_data: GeminiInlineData {
                    mime_type: blob.mime_type.clone(),
                    data: base64::engine::general_purpose::STANDARD.encode(&blob.data),
                },
            });
        }
        GeminiRequest {
            contents: vec![GeminiContent { parts }],
            generation_config: GeminiGenerationConfig {
                temperature: self.config.temperature,
                max_output_tokens: self.config.max_output_tokens,
                response_mime_type: "application/json".to_string(),
            },
        }
    }

    fn classify_transport_error(&self, err: reqwest::Error) -> ServiceError {
        if err.is_timeout() {
            ServiceError::Timeout(self.config.request_timeout)
        } else {
            ServiceError::Network(err.to_string())
        }
    }
}

#[async_trait]
impl ContentAnalysisService for GeminiClient {
    async fn invoke(
        &self,
        prompt: &str,
        documents: &[DocumentBlob],
    ) -> Result<String, ServiceError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.config.endpoint, self.config.model, self.api_key
        );
        let request = self.build_request(prompt, documents);

        tracing::debug!(
            "Invoking {} with {} document payloads [key={}]",
            self.config.model,
            documents.len(),
            self.key_tag
        );

        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.classify_transport_error(e))?;

        let status = response.status();
        if status.as_u16() == 429 {
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::RateLimited(body));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::Server {
                status: status.as_u16(),
                message: body,
            });
        }

        let reply: GeminiResponse = response.json().await.map_err(|e| ServiceError::Server {
            status: status.as_u16(),
            message: format!("unreadable response body: {}", e),
        })?;

        if let Some(feedback) = reply.prompt_feedback {
            if let Some(reason) = feedback.block_reason {
                tracing::warn!(
                    "Prompt blocked (reason={}) [key={}]",
                    reason,
                    self.key_tag
                );
                return Err(ServiceError::ContentBlocked(reason));
            }
        }
        if let Some(error) = reply.error {
            return Err(ServiceError::Server {
                status: status.as_u16(),
                message: error.message,
            });
        }

        let candidate = reply
            .candidates
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| ServiceError::Server {
                status: status.as_u16(),
                message: "no candidates in response".to_string(),
            })?;

        if let Some(reason) = candidate.finish_reason.as_deref() {
            if reason.contains("SAFETY") {
                return Err(ServiceError::ContentBlocked(reason.to_string()));
            }
            if reason.contains("MAX_TOKENS") {
                tracing::warn!(
                    "Response truncated at the token limit [key={}]",
                    self.key_tag
                );
            }
        }

        let text: String = candidate
            .content
            .map(|c| {
                c.parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();

        if text.is_empty() {
            return Err(ServiceError::Server {
                status: status.as_u16(),
                message: "empty response text".to_string(),
            });
        }
        Ok(text)
    }
}

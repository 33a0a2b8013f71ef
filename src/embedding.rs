//! Embedding client used by schema retrieval.
//!
//! Talks to any OpenAI-compatible `/embeddings` endpoint. The client makes a
//! single attempt per call; timeouts and retries are applied by the caller
//! through [`crate::retry::with_retry`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::RetrievalConfig;
use crate::retry::Retryable;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding request timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("embedding API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),
}

impl Retryable for EmbeddingError {
    fn is_retryable(&self) -> bool {
        match self {
            EmbeddingError::Timeout(_) => true,
            EmbeddingError::Request(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            EmbeddingError::Api { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            EmbeddingError::InvalidResponse(_) => false,
        }
    }

    fn timed_out(after: Duration) -> Self {
        EmbeddingError::Timeout(after)
    }
}

/// Converts text into a fixed-length vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    fn model_name(&self) -> &str;
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: [&'a str; 1],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Embedding client for OpenAI-compatible endpoints.
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl HttpEmbedder {
    pub fn new(api_key: String, config: &RetrievalConfig) -> Result<Self, EmbeddingError> {
        let client = reqwest::Client::builder()
            .timeout(config.embed_timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", config.embed_base_url.trim_end_matches('/')),
            api_key,
            model: config.embed_model.clone(),
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: [text],
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Api { status, body });
        }

        let result: EmbeddingResponse = response.json().await?;
        let embedding = result
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| EmbeddingError::InvalidResponse("no embedding returned".to_string()))?;
        if embedding.is_empty() || embedding.iter().any(|x| !x.is_finite()) {
            return Err(EmbeddingError::InvalidResponse(
                "embedding is empty or contains non-finite values".to_string(),
            ));
        }
        Ok(embedding)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Cosine similarity between two vectors, or `None` when their lengths differ.
///
/// Zero vectors have similarity 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }

    let mut dot_product = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot_product += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let norm_a = norm_a.sqrt();
    let norm_b = norm_b.sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return Some(0.0);
    }
    Some(dot_product / (norm_a * norm_b))
}

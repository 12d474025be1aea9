//! Embedding provider abstraction and implementations.
//!
//! Defines the [`Embedder`] trait and two implementations:
//!
//! - **[`HttpEmbedder`]** — client for the plain HTTP embedding server
//!   (`POST /embed`, `GET /health`) with batching, retry, and backoff.
//! - **[`StubEmbedder`]** — deterministic hash-derived vectors for tests and
//!   air-gapped builds; no network.
//!
//! # Retry strategy
//!
//! Transient failures (HTTP 429, 5xx, network errors) retry with
//! exponential backoff: 200 ms, 400 ms, 800 ms, 1.6 s, 3.2 s (5 attempts).
//! Other 4xx responses fail immediately.

use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::config::EmbeddingConfig;
use crate::error::{CpmError, Result};
use crate::packet::vectors::normalize;

/// A batch of embeddings plus the dimension reported by the provider.
#[derive(Debug, Clone)]
pub struct EmbedBatch {
    pub vectors: Vec<Vec<f32>>,
    pub dim: usize,
}

/// Trait for embedding providers.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier recorded in manifests and cache keys.
    fn model(&self) -> &str;

    /// True when the provider is reachable and ready.
    async fn health(&self) -> bool;

    /// Embed a batch of texts, preserving input order.
    async fn embed(&self, texts: &[String]) -> Result<EmbedBatch>;
}

/// Create the configured provider.
pub fn create_embedder(config: &EmbeddingConfig, http: &reqwest::Client) -> Result<Box<dyn Embedder>> {
    match config.provider.as_str() {
        "http" => Ok(Box::new(HttpEmbedder::new(config, http.clone()))),
        "stub" => {
            let dim = config
                .dim
                .filter(|&d| d > 0)
                .ok_or_else(|| CpmError::Usage("embedding.dim required for stub provider".into()))?;
            Ok(Box::new(StubEmbedder::new(config.model.clone(), dim)))
        }
        other => Err(CpmError::Usage(format!(
            "unknown embedding provider: '{}'",
            other
        ))),
    }
}

// ============ HTTP embedder ============

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
    #[serde(default)]
    dimension: Option<usize>,
}

/// Client for the embedding server's `POST /embed` contract.
pub struct HttpEmbedder {
    http: reqwest::Client,
    base_url: String,
    model: String,
    max_seq_length: usize,
    normalize: bool,
    max_retries: u32,
    timeout: Duration,
}

impl HttpEmbedder {
    pub fn new(config: &EmbeddingConfig, http: reqwest::Client) -> Self {
        Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_seq_length: config.max_seq_length,
            normalize: config.normalize,
            max_retries: config.max_retries,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    async fn request_once(&self, texts: &[String]) -> std::result::Result<EmbedBatch, Attempt> {
        let body = serde_json::json!({
            "model": self.model,
            "texts": texts,
            "options": {
                "max_seq_length": self.max_seq_length,
                "normalize": self.normalize,
            },
        });
        let response = self
            .http
            .post(format!("{}/embed", self.base_url))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| Attempt::retryable(anyhow!("embedding request failed: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            let retryable = status.as_u16() == 429 || status.is_server_error();
            let text = response.text().await.unwrap_or_default();
            let err = anyhow!("embedding server error {}: {}", status, text);
            return Err(if retryable {
                Attempt::retryable(err)
            } else {
                Attempt::fatal(err)
            });
        }
        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| Attempt::fatal(anyhow!("invalid embedding response: {}", e)))?;
        if parsed.embeddings.len() != texts.len() {
            return Err(Attempt::fatal(anyhow!(
                "embedding server returned {} vectors for {} texts",
                parsed.embeddings.len(),
                texts.len()
            )));
        }
        let dim = parsed
            .dimension
            .or_else(|| parsed.embeddings.first().map(Vec::len))
            .unwrap_or(0);
        if dim == 0 || parsed.embeddings.iter().any(|v| v.len() != dim) {
            return Err(Attempt::fatal(anyhow!(
                "embedding server returned inconsistent dimensions"
            )));
        }
        Ok(EmbedBatch {
            vectors: parsed.embeddings,
            dim,
        })
    }
}

/// Outcome of one failed request: retry or give up.
struct Attempt {
    retryable: bool,
    error: anyhow::Error,
}

impl Attempt {
    fn retryable(error: anyhow::Error) -> Self {
        Self {
            retryable: true,
            error,
        }
    }

    fn fatal(error: anyhow::Error) -> Self {
        Self {
            retryable: false,
            error,
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    async fn health(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self
            .http
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn embed(&self, texts: &[String]) -> Result<EmbedBatch> {
        let mut last_err = None;
        for attempt in 0..self.max_retries {
            if attempt > 0 {
                // 200 ms, 400 ms, 800 ms, 1.6 s, 3.2 s
                let delay = Duration::from_millis(200 << (attempt - 1).min(4));
                tokio::time::sleep(delay).await;
            }
            match self.request_once(texts).await {
                Ok(batch) => return Ok(batch),
                Err(failure) => {
                    if !failure.retryable {
                        return Err(CpmError::Embedder(failure.error.to_string()));
                    }
                    tracing::debug!(attempt, error = %failure.error, "embed attempt failed");
                    last_err = Some(failure.error);
                }
            }
        }
        Err(CpmError::Embedder(format!(
            "embedding failed after {} attempts: {}",
            self.max_retries,
            last_err.unwrap_or_else(|| anyhow!("no attempts made"))
        )))
    }
}

// ============ Stub embedder ============

/// Deterministic offline embedder: each vector is derived from
/// `sha256(model \0 text)` and L2-normalized. Identical inputs always embed
/// identically, which is what build/replay determinism tests need.
pub struct StubEmbedder {
    model: String,
    dim: usize,
}

impl StubEmbedder {
    pub fn new(model: String, dim: usize) -> Self {
        Self { model, dim }
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut values = Vec::with_capacity(self.dim);
        let mut counter = 0u32;
        while values.len() < self.dim {
            let mut hasher = Sha256::new();
            hasher.update(self.model.as_bytes());
            hasher.update([0]);
            hasher.update(text.as_bytes());
            hasher.update(counter.to_le_bytes());
            let digest = hasher.finalize();
            for window in digest.chunks_exact(4) {
                if values.len() >= self.dim {
                    break;
                }
                let raw = u32::from_le_bytes([window[0], window[1], window[2], window[3]]);
                // Map to [-1, 1].
                values.push((raw as f64 / u32::MAX as f64 * 2.0 - 1.0) as f32);
            }
            counter += 1;
        }
        normalize(&mut values);
        values
    }
}

#[async_trait]
impl Embedder for StubEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    async fn health(&self) -> bool {
        true
    }

    async fn embed(&self, texts: &[String]) -> Result<EmbedBatch> {
        Ok(EmbedBatch {
            vectors: texts.iter().map(|t| self.vector_for(t)).collect(),
            dim: self.dim,
        })
    }
}

//! OpenAI-compatible embeddings client using the `/v1/embeddings` endpoint.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::EmbeddingProvider;
use crate::config::EmbeddingConfig;
use crate::error::{EngineError, EngineResult};

pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    dims: usize,
}

fn has_version_suffix(base_url: &str) -> bool {
    let Some(last_segment) = base_url.rsplit('/').next() else {
        return false;
    };
    let Some(rest) = last_segment.strip_prefix('v') else {
        return false;
    };
    !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
}

/// Accept a bare host, a versioned base, or the full embeddings URL.
fn embeddings_endpoint(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/embeddings") {
        base.to_string()
    } else if has_version_suffix(base) {
        format!("{base}/embeddings")
    } else {
        format!("{base}/v1/embeddings")
    }
}

impl HttpEmbeddingProvider {
    pub fn from_config(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !config.endpoint.trim().is_empty(),
            "embedding.endpoint is required for the http provider"
        );
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .context("failed to build embedding http client")?;
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty());
        if api_key.is_none() {
            tracing::debug!(env = %config.api_key_env, "no embedding api key set");
        }

        Ok(Self {
            client,
            endpoint: embeddings_endpoint(&config.endpoint),
            api_key,
            model: config.model.clone(),
            dims: config.dimensions,
        })
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

/// 429 and 5xx are worth retrying; any other failure status is not.
fn classify_status(status: reqwest::StatusCode, body: &str) -> EngineError {
    let msg = format!("embedding endpoint returned {status}: {body}");
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        EngineError::Transient(msg)
    } else {
        EngineError::Internal(msg)
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed_batch(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let req = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };
        let mut builder = self.client.post(&self.endpoint).json(&req);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        // Anything that fails before a status line (connect, timeout) is transient.
        let response = builder
            .send()
            .await
            .map_err(|e| EngineError::Transient(format!("embedding request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let mut resp: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Internal(format!("bad embedding response: {e}")))?;
        if resp.data.len() != texts.len() {
            return Err(EngineError::Internal(format!(
                "embedding response has {} vectors for {} inputs",
                resp.data.len(),
                texts.len()
            )));
        }
        resp.data.sort_by_key(|d| d.index.unwrap_or(usize::MAX));

        let vectors: Vec<Vec<f32>> = resp.data.into_iter().map(|d| d.embedding).collect();
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dims) {
            return Err(EngineError::Internal(format!(
                "embedding has {} dimensions, expected {}",
                bad.len(),
                self.dims
            )));
        }
        Ok(vectors)
    }

    fn model_version(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

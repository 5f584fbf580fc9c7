//! Text-to-vector embedding pipeline.
//!
//! Provides the [`EmbeddingProvider`] trait, two implementations (a deterministic
//! local hashing embedder and an OpenAI-compatible HTTP client), and the cached
//! [`EmbeddingPipeline`] the rest of the engine talks to. Providers are created via
//! [`create_provider`] from configuration.

pub mod cache;
pub mod hashing;
pub mod http;
pub mod pipeline;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::EmbeddingConfig;
use crate::error::EngineResult;

pub use pipeline::EmbeddingPipeline;

/// Trait for embedding text into vectors.
///
/// For a fixed [`model_version`](Self::model_version) the output must be a pure
/// function of the input text.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch of texts, returning one vector per input in the same order.
    async fn embed_batch(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>>;

    /// Identifier stored next to every vector this provider produces.
    fn model_version(&self) -> &str;

    fn dimensions(&self) -> usize;
}

/// Create an embedding provider from config.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    anyhow::ensure!(config.dimensions > 0, "embedding.dimensions must be positive");
    match config.provider.as_str() {
        "hash" => Ok(Arc::new(hashing::HashEmbedder::new(
            config.model.clone(),
            config.dimensions,
        ))),
        "http" => Ok(Arc::new(http::HttpEmbeddingProvider::from_config(config)?)),
        other => anyhow::bail!("unknown embedding provider: {other}. Supported: hash, http"),
    }
}

/// Canonical form used for cache keys and sent to providers: trimmed, lowercased,
/// internal whitespace collapsed to single spaces.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_collapses_case_and_space() {
        assert_eq!(normalize_text("  Took   10mg\tLisinopril \n"), "took 10mg lisinopril");
        assert_eq!(normalize_text("   "), "");
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let config = EmbeddingConfig {
            provider: "onnx".into(),
            ..EmbeddingConfig::default()
        };
        assert!(create_provider(&config).is_err());
    }

    #[test]
    fn default_provider_is_hash() {
        let provider = create_provider(&EmbeddingConfig::default()).unwrap();
        assert_eq!(provider.dimensions(), 384);
        assert_eq!(provider.model_version(), "hash-v1");
    }
}

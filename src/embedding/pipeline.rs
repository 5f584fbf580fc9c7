use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::cache::{cache_key, CacheKey, CacheStats, EmbeddingCache};
use super::{normalize_text, EmbeddingProvider};
use crate::config::EmbeddingConfig;
use crate::error::{EngineError, EngineResult};

/// Cached front end over an [`EmbeddingProvider`].
///
/// Providers always see normalized text, so a cache hit and a fresh call return
/// the same vector for the same input.
pub struct EmbeddingPipeline {
    provider: Arc<dyn EmbeddingProvider>,
    cache: EmbeddingCache,
    batch_size: usize,
}

impl EmbeddingPipeline {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: &EmbeddingConfig) -> Self {
        Self {
            provider,
            cache: EmbeddingCache::new(
                config.cache_capacity,
                Duration::from_secs(config.cache_ttl_secs),
                config.cache_shards,
            ),
            batch_size: config.batch_size.max(1),
        }
    }

    pub fn model_version(&self) -> &str {
        self.provider.model_version()
    }

    pub fn dimensions(&self) -> usize {
        self.provider.dimensions()
    }

    /// Single-item path used at query time.
    pub async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| EngineError::Internal("empty embedding result".into()))
    }

    /// Embed many texts, serving what it can from cache and sending the misses to
    /// the provider in chunks of `batch_size`. Output order matches input order.
    pub async fn embed_batch(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        let model = self.provider.model_version().to_string();
        let mut out: Vec<Option<Vec<f32>>> = vec![None; texts.len()];

        // Misses grouped by key: identical texts in one batch are embedded once.
        let mut pending: Vec<(CacheKey, String)> = Vec::new();
        let mut waiting: HashMap<CacheKey, Vec<usize>> = HashMap::new();

        for (i, text) in texts.iter().enumerate() {
            let normalized = normalize_text(text);
            let key = cache_key(&model, &normalized);
            if let Some(v) = self.cache.get(&key) {
                out[i] = Some(v);
                continue;
            }
            let slots = waiting.entry(key).or_default();
            if slots.is_empty() {
                pending.push((key, normalized));
            }
            slots.push(i);
        }

        for chunk in pending.chunks(self.batch_size) {
            let inputs: Vec<String> = chunk.iter().map(|(_, t)| t.clone()).collect();
            let vectors = self.provider.embed_batch(&inputs).await?;
            if vectors.len() != inputs.len() {
                return Err(EngineError::Internal(format!(
                    "provider returned {} vectors for {} inputs",
                    vectors.len(),
                    inputs.len()
                )));
            }
            for ((key, _), vector) in chunk.iter().zip(vectors) {
                if let Some(slots) = waiting.get(key) {
                    for &i in slots {
                        out[i] = Some(vector.clone());
                    }
                }
                self.cache.insert(*key, vector);
            }
        }

        tracing::debug!(
            total = texts.len(),
            computed = pending.len(),
            model = %model,
            "embedded batch"
        );

        out.into_iter()
            .map(|v| v.ok_or_else(|| EngineError::Internal("missing embedding".into())))
            .collect()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::hashing::HashEmbedder;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts how many texts actually reach the provider.
    struct Counting {
        inner: HashEmbedder,
        calls: AtomicUsize,
        texts: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for Counting {
        async fn embed_batch(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts.fetch_add(texts.len(), Ordering::SeqCst);
            self.inner.embed_batch(texts).await
        }
        fn model_version(&self) -> &str {
            self.inner.model_version()
        }
        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }
    }

    fn pipeline(batch_size: usize) -> (EmbeddingPipeline, Arc<Counting>) {
        let provider = Arc::new(Counting {
            inner: HashEmbedder::new("hash-v1", 32),
            calls: AtomicUsize::new(0),
            texts: AtomicUsize::new(0),
        });
        let config = EmbeddingConfig {
            batch_size,
            ..EmbeddingConfig::default()
        };
        (EmbeddingPipeline::new(provider.clone(), &config), provider)
    }

    #[tokio::test]
    async fn second_call_is_served_from_cache() {
        let (p, counter) = pipeline(8);
        let a = p.embed("Walked 5k").await.unwrap();
        let b = p.embed("  walked   5K ").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(counter.texts.load(Ordering::SeqCst), 1);
        assert_eq!(p.cache_stats().hits, 1);
    }

    #[tokio::test]
    async fn misses_are_chunked_and_ordered() {
        let (p, counter) = pipeline(2);
        let texts: Vec<String> = ["a", "b", "c", "a", "d"].iter().map(|s| s.to_string()).collect();
        let vectors = p.embed_batch(&texts).await.unwrap();
        assert_eq!(vectors.len(), 5);
        assert_eq!(vectors[0], vectors[3]);
        // four distinct texts in chunks of two
        assert_eq!(counter.texts.load(Ordering::SeqCst), 4);
        assert_eq!(counter.calls.load(Ordering::SeqCst), 2);
        assert_eq!(vectors[2], p.embed("c").await.unwrap());
    }
}

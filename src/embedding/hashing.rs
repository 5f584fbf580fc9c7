//! Deterministic local embedder.
//!
//! Feature hashing over word unigrams and bigrams: every feature is hashed with
//! SHA-256 into one of `dims` buckets with a hash-derived sign, then the vector is
//! L2-normalized. No model files, no network, bit-identical across runs and
//! platforms. Texts sharing vocabulary land close together, which is enough for
//! offline use and for tests.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{normalize_text, EmbeddingProvider};
use crate::error::EngineResult;
use crate::memory::l2_normalize;

const BIGRAM_WEIGHT: f32 = 0.5;

pub struct HashEmbedder {
    model: String,
    dims: usize,
}

impl HashEmbedder {
    pub fn new(model: impl Into<String>, dims: usize) -> Self {
        Self {
            model: model.into(),
            dims: dims.max(1),
        }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let normalized = normalize_text(text);
        let tokens: Vec<&str> = normalized
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();

        let mut v = vec![0.0f32; self.dims];
        for token in &tokens {
            self.accumulate(&mut v, token, 1.0);
        }
        for pair in tokens.windows(2) {
            self.accumulate(&mut v, &format!("{} {}", pair[0], pair[1]), BIGRAM_WEIGHT);
        }
        l2_normalize(&mut v);
        v
    }

    fn accumulate(&self, v: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        let bucket = (u64::from_le_bytes(bytes) % self.dims as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        v[bucket] += sign * weight;
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn model_version(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::cosine_similarity;

    #[test]
    fn identical_text_is_bit_identical() {
        let e = HashEmbedder::new("hash-v1", 64);
        let a = e.embed_one("Took 10mg lisinopril after breakfast");
        let b = e.embed_one("Took 10mg lisinopril after breakfast");
        assert_eq!(
            a.iter().map(|x| x.to_bits()).collect::<Vec<_>>(),
            b.iter().map(|x| x.to_bits()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn output_is_unit_length() {
        let e = HashEmbedder::new("hash-v1", 128);
        let v = e.embed_one("walked five kilometres");
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert_eq!(v.len(), 128);
    }

    #[test]
    fn shared_vocabulary_scores_higher() {
        let e = HashEmbedder::new("hash-v1", 384);
        let q = e.embed_one("lisinopril dose");
        let near = e.embed_one("took my lisinopril dose this morning");
        let far = e.embed_one("spent 40 dollars on groceries");
        assert!(cosine_similarity(&q, &near) > cosine_similarity(&q, &far));
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let e = HashEmbedder::new("hash-v1", 16);
        assert!(e.embed_one("  ").iter().all(|x| *x == 0.0));
    }
}

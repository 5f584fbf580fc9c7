pub mod partition;
pub mod store;
pub mod types;

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use sha2::{Digest, Sha256};

/// Encode an f32 vector as little-endian bytes for the `embedding` BLOB column.
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|x| x.to_le_bytes()).collect()
}

/// Decode a BLOB written by [`embedding_to_bytes`]. Trailing partial floats are ignored.
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Cosine similarity in `[-1, 1]`. Zero vectors and length mismatches score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// L2-normalize in place. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

/// Order-independent fingerprint of a set of record ids.
///
/// Both the record table and each index shard compute one; a mismatch means the
/// shard no longer reflects the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IdChecksum {
    pub count: u64,
    pub digest: u64,
}

impl IdChecksum {
    pub fn add(&mut self, id: &str) {
        self.count += 1;
        self.digest ^= id_hash(id);
    }

    pub fn from_ids<'a>(ids: impl IntoIterator<Item = &'a str>) -> Self {
        let mut sum = Self::default();
        for id in ids {
            sum.add(id);
        }
        sum
    }
}

fn id_hash(id: &str) -> u64 {
    let digest = Sha256::digest(id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Score order used by every search: higher score first, then smaller id.
pub fn compare_scored(a: &(String, f32), b: &(String, f32)) -> Ordering {
    b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0))
}

/// Heap entry ordered so the *worst* candidate sits on top.
struct Worst((String, f32));

impl PartialEq for Worst {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Worst {}

impl PartialOrd for Worst {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Worst {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_scored(&self.0, &other.0)
    }
}

/// Bounded best-k collector for `(id, score)` pairs.
pub struct TopK {
    k: usize,
    heap: BinaryHeap<Worst>,
}

impl TopK {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k.saturating_add(1).min(4096)),
        }
    }

    pub fn push(&mut self, id: String, score: f32) {
        if self.k == 0 {
            return;
        }
        self.heap.push(Worst((id, score)));
        if self.heap.len() > self.k {
            self.heap.pop();
        }
    }

    pub fn into_sorted(self) -> Vec<(String, f32)> {
        let mut out: Vec<_> = self.heap.into_iter().map(|w| w.0).collect();
        out.sort_by(compare_scored);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_round_trip() {
        let v = vec![0.25f32, -1.5, 3.0];
        assert_eq!(bytes_to_embedding(&embedding_to_bytes(&v)), v);
    }

    #[test]
    fn cosine_of_parallel_and_orthogonal() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn normalize() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn checksum_is_order_independent() {
        let a = IdChecksum::from_ids(["x", "y", "z"]);
        let b = IdChecksum::from_ids(["z", "x", "y"]);
        assert_eq!(a, b);
        assert_ne!(a, IdChecksum::from_ids(["x", "y"]));
    }

    #[test]
    fn top_k_keeps_best_with_id_tiebreak() {
        let mut top = TopK::new(2);
        top.push("c".into(), 0.5);
        top.push("a".into(), 0.9);
        top.push("d".into(), 0.1);
        top.push("b".into(), 0.9);
        let out = top.into_sorted();
        assert_eq!(out, vec![("a".to_string(), 0.9), ("b".to_string(), 0.9)]);
    }
}

//! Sharded LRU + TTL embedding cache.
//!
//! Keys are SHA-256 digests of `model_version` plus the normalized text, so a model
//! upgrade never serves stale vectors. Each shard has its own lock; the shard is
//! picked from the key bytes.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};

pub type CacheKey = [u8; 32];

struct Entry {
    vector: Vec<f32>,
    inserted: Instant,
}

pub struct EmbeddingCache {
    shards: Vec<Mutex<LruCache<CacheKey, Entry>>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Cache key for an already-normalized text.
pub fn cache_key(model_version: &str, normalized: &str) -> CacheKey {
    let mut hasher = Sha256::new();
    hasher.update(model_version.as_bytes());
    hasher.update([0u8]);
    hasher.update(normalized.as_bytes());
    hasher.finalize().into()
}

impl EmbeddingCache {
    pub fn new(capacity: usize, ttl: Duration, shards: usize) -> Self {
        let shards = shards.max(1);
        let per_shard = NonZeroUsize::new(capacity.div_ceil(shards)).unwrap_or(NonZeroUsize::MIN);
        Self {
            shards: (0..shards)
                .map(|_| Mutex::new(LruCache::new(per_shard)))
                .collect(),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn shard(&self, key: &CacheKey) -> &Mutex<LruCache<CacheKey, Entry>> {
        let idx = u32::from_le_bytes([key[0], key[1], key[2], key[3]]) as usize % self.shards.len();
        &self.shards[idx]
    }

    /// Look up a vector. Expired entries count as misses and are evicted.
    pub fn get(&self, key: &CacheKey) -> Option<Vec<f32>> {
        let mut shard = self.shard(key).lock();
        let expired = match shard.get(key) {
            Some(entry) if entry.inserted.elapsed() < self.ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.vector.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            shard.pop(key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn insert(&self, key: CacheKey, vector: Vec<f32>) {
        self.shard(&key).lock().put(
            key,
            Entry {
                vector,
                inserted: Instant::now(),
            },
        );
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.lock().clear();
        }
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, capacity) = self.shards.iter().fold((0, 0), |(n, cap), s| {
            let s = s.lock();
            (n + s.len(), cap + s.cap().get())
        });
        CacheStats {
            entries,
            capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

//! Scoring and context packing. Pure functions over already-fetched records.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::RetrievalConfig;
use crate::memory::types::{MemoryRecord, Source};

#[derive(Debug, Clone, Copy)]
pub struct Weights {
    pub similarity: f64,
    pub recency: f64,
    pub importance: f64,
    pub half_life_hours: f64,
}

impl Weights {
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            similarity: config.similarity_weight,
            recency: config.recency_weight,
            importance: config.importance_weight,
            half_life_hours: config.recency_half_life_hours,
        }
    }
}

/// A record plus its cosine similarity to the query.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub record: MemoryRecord,
    pub similarity: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredMemory {
    pub id: String,
    pub text: String,
    pub score: f64,
    pub similarity: f32,
    pub source: Source,
    pub importance: f64,
    pub created_at: DateTime<Utc>,
    pub tokens: usize,
}

/// `exp(-ln 2 · age / half_life)`: 1.0 for a fresh record, 0.5 one half-life later.
/// Records from the future count as fresh. A non-positive half-life disables the
/// signal.
pub fn recency_decay(age_hours: f64, half_life_hours: f64) -> f64 {
    if half_life_hours <= 0.0 || !half_life_hours.is_finite() {
        return 0.0;
    }
    (-std::f64::consts::LN_2 * age_hours.max(0.0) / half_life_hours).exp()
}

/// Rough token count: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

pub fn score(candidate: &Candidate, weights: &Weights, now: DateTime<Utc>) -> f64 {
    let age_hours = (now - candidate.record.created_at).num_milliseconds() as f64 / 3_600_000.0;
    weights.similarity * f64::from(candidate.similarity)
        + weights.recency * recency_decay(age_hours, weights.half_life_hours)
        + weights.importance * candidate.record.importance
}

/// Best first; equal scores go to the newer record, then to the lower id.
fn compare(a: &ScoredMemory, b: &ScoredMemory) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.created_at.cmp(&a.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

pub fn rank(candidates: Vec<Candidate>, weights: &Weights, now: DateTime<Utc>) -> Vec<ScoredMemory> {
    let mut ranked: Vec<ScoredMemory> = candidates
        .into_iter()
        .map(|c| {
            let score = score(&c, weights, now);
            let tokens = estimate_tokens(&c.record.text);
            ScoredMemory {
                id: c.record.id,
                text: c.record.text,
                score,
                similarity: c.similarity,
                source: c.record.source,
                importance: c.record.importance,
                created_at: c.record.created_at,
                tokens,
            }
        })
        .collect();
    ranked.sort_by(compare);
    ranked
}

/// Take ranked memories whole, best first, until `k` are taken or the next one
/// would overflow `token_budget`. Returns the packed set and its token total.
pub fn pack(ranked: Vec<ScoredMemory>, k: usize, token_budget: usize) -> (Vec<ScoredMemory>, usize) {
    let mut used = 0usize;
    let mut packed = Vec::new();
    for memory in ranked {
        if packed.len() >= k || used + memory.tokens > token_budget {
            break;
        }
        used += memory.tokens;
        packed.push(memory);
    }
    (packed, used)
}

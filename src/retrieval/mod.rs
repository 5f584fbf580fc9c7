//! Query-time retrieval: candidate search, hydration, ranking and packing.
//!
//! The pipeline for one query:
//!
//! 1. Fan out over the partitioned index for `k · candidate_multiplier` candidates.
//! 2. Cover partitions the index reported stale with an exact store scan.
//! 3. Hydrate candidates from the store, dropping tombstoned or filtered-out records.
//! 4. [`ranking::rank`] by weighted similarity, recency and importance.
//! 5. [`ranking::pack`] whole memories into the token budget.

pub mod ranking;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use self::ranking::{Candidate, ScoredMemory, Weights};
use crate::config::RetrievalConfig;
use crate::error::EngineResult;
use crate::index::PartitionedIndex;
use crate::memory::store::MemoryStore;
use crate::memory::types::{MemoryFilter, Source};

/// A retrieval query as accepted by the API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetrieveRequest {
    pub query: String,
    #[serde(default)]
    pub k: Option<usize>,
    #[serde(default)]
    pub token_budget: Option<usize>,
    /// Milliseconds from now.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
}

impl RetrieveRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn filter(&self) -> MemoryFilter {
        MemoryFilter {
            user: self.user.clone(),
            sources: self.sources.clone(),
            since: self.since,
            until: self.until,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RetrieveResponse {
    pub results: Vec<ScoredMemory>,
    pub total_candidates: usize,
    pub token_estimate: usize,
    /// Part of the search was skipped to meet the deadline.
    pub degraded: bool,
}

impl RetrieveResponse {
    pub fn empty(degraded: bool) -> Self {
        Self {
            results: Vec::new(),
            total_candidates: 0,
            token_estimate: 0,
            degraded,
        }
    }
}

/// Resolved per-query limits.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub k: usize,
    pub token_budget: usize,
    pub deadline: Instant,
}

impl Limits {
    pub fn resolve(request: &RetrieveRequest, config: &RetrievalConfig, started: Instant) -> Self {
        let deadline_ms = request.deadline_ms.unwrap_or(config.deadline_ms);
        Self {
            k: request.k.unwrap_or(config.default_k),
            token_budget: request.token_budget.unwrap_or(config.default_token_budget),
            deadline: started + Duration::from_millis(deadline_ms),
        }
    }
}

#[derive(Clone)]
pub struct Retriever {
    store: MemoryStore,
    index: Arc<PartitionedIndex>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(store: MemoryStore, index: Arc<PartitionedIndex>, config: RetrievalConfig) -> Self {
        Self {
            store,
            index,
            config,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Retrieve with an already-embedded query. Deterministic for fixed inputs and
    /// index state.
    pub fn retrieve_vector(
        &self,
        query: &[f32],
        filter: &MemoryFilter,
        limits: Limits,
        now: DateTime<Utc>,
    ) -> EngineResult<RetrieveResponse> {
        if limits.k == 0 {
            return Ok(RetrieveResponse::empty(false));
        }
        let pool = limits
            .k
            .saturating_mul(self.config.candidate_multiplier.max(1));

        let outcome = self.index.search(query, pool, filter, Some(limits.deadline));
        let mut degraded = outcome.degraded;
        let mut similarities: HashMap<String, f32> = outcome.hits.into_iter().collect();

        if !outcome.fallback.is_empty() {
            if Instant::now() < limits.deadline {
                let scanned =
                    self.store
                        .brute_force_search(query, pool, filter, Some(&outcome.fallback))?;
                tracing::debug!(
                    partitions = outcome.fallback.len(),
                    hits = scanned.len(),
                    "covered stale partitions by scan"
                );
                for (id, score) in scanned {
                    similarities.entry(id).or_insert(score);
                }
            } else {
                degraded = true;
            }
        }

        let (mut candidates, dropped) = self.hydrate(similarities, filter)?;

        // Partitions are pruned by bucket only, so a time window can leave the pool
        // full of out-of-window neighbours. Scan the window exactly instead.
        if dropped > 0 && candidates.len() < limits.k && filter.has_time_window() {
            if Instant::now() < limits.deadline {
                let scanned: HashMap<String, f32> = self
                    .store
                    .brute_force_search(query, pool, filter, None)?
                    .into_iter()
                    .filter(|(id, _)| !candidates.iter().any(|c| &c.record.id == id))
                    .collect();
                tracing::debug!(hits = scanned.len(), "time window rescanned");
                candidates.extend(self.hydrate(scanned, filter)?.0);
            } else {
                degraded = true;
            }
        }

        let total_candidates = candidates.len();
        let ranked = ranking::rank(candidates, &Weights::from_config(&self.config), now);
        let (results, token_estimate) = ranking::pack(ranked, limits.k, limits.token_budget);
        Ok(RetrieveResponse {
            results,
            total_candidates,
            token_estimate,
            degraded,
        })
    }
}

impl Retriever {
    /// Load candidate records, keeping the live ones that pass `filter`. Also
    /// returns how many were dropped.
    fn hydrate(
        &self,
        similarities: HashMap<String, f32>,
        filter: &MemoryFilter,
    ) -> EngineResult<(Vec<Candidate>, usize)> {
        let ids: Vec<String> = similarities.keys().cloned().collect();
        let mut records = self.store.get_many(&ids)?;
        let found = similarities.len();
        let candidates: Vec<Candidate> = similarities
            .into_iter()
            .filter_map(|(id, similarity)| {
                let record = records.remove(&id)?;
                (!record.is_deleted() && filter.matches_record(&record)).then_some(Candidate {
                    record,
                    similarity,
                })
            })
            .collect();
        let dropped = found - candidates.len();
        Ok((candidates, dropped))
    }
}

//! Knowledge graph derived from memories.
//!
//! The graph is a cache over the record table: [`KnowledgeBase::build_graph`] runs
//! the extractor over memories and upserts what it finds, and everything can be
//! regenerated from the store.

pub mod extract;
pub mod reason;
pub mod store;
pub mod types;

use std::sync::Arc;

use serde::Serialize;

use self::extract::Extractor;
use self::reason::{KnowledgeGraph, Reasoning};
use self::store::{GraphStats, GraphStore};
use self::types::KnowledgeEntity;
use crate::config::GraphConfig;
use crate::error::EngineResult;
use crate::memory::types::MemoryRecord;

#[derive(Debug, Default, Serialize)]
pub struct BuildReport {
    pub memories: usize,
    pub entities: usize,
    pub relationships: usize,
    pub new_evidence: usize,
}

#[derive(Clone)]
pub struct KnowledgeBase {
    store: GraphStore,
    extractor: Arc<dyn Extractor>,
    config: GraphConfig,
}

impl KnowledgeBase {
    pub fn new(store: GraphStore, extractor: Arc<dyn Extractor>, config: GraphConfig) -> Self {
        Self {
            store,
            extractor,
            config,
        }
    }

    pub fn store(&self) -> &GraphStore {
        &self.store
    }

    /// Extract from each active memory and fold the result into the graph.
    /// Idempotent per memory.
    pub fn build_graph(&self, memories: &[MemoryRecord]) -> EngineResult<BuildReport> {
        let mut report = BuildReport::default();
        for record in memories.iter().filter(|r| !r.is_deleted()) {
            let extraction = self.extractor.extract(record);
            if extraction.entities.is_empty() {
                continue;
            }
            let stats = self
                .store
                .apply(&record.id, &extraction, self.config.strength_prior)?;
            report.memories += 1;
            report.entities += stats.entities;
            report.relationships += stats.relationships;
            report.new_evidence += stats.new_evidence;
        }
        if report.new_evidence > 0 {
            tracing::info!(
                memories = report.memories,
                new_evidence = report.new_evidence,
                "knowledge graph updated"
            );
        }
        Ok(report)
    }

    /// Remove a tombstoned memory's contribution.
    pub fn forget_memory(&self, memory_id: &str) -> EngineResult<usize> {
        self.store.forget_memory(memory_id, self.config.strength_prior)
    }

    /// Snapshot the graph into an arena.
    pub fn load(&self) -> EngineResult<KnowledgeGraph> {
        let (entities, relationships) = self.store.load()?;
        Ok(KnowledgeGraph::new(entities, relationships))
    }

    pub fn reason(&self, entity_id: &str) -> EngineResult<Reasoning> {
        self.load()?
            .reason(entity_id, self.config.max_depth, self.config.max_suggestions)
    }

    pub fn find_entity(&self, label: &str) -> EngineResult<Vec<KnowledgeEntity>> {
        self.store.find_entity(label)
    }

    pub fn stats(&self) -> EngineResult<GraphStats> {
        self.store.stats()
    }
}

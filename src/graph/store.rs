//! Persistence for the derived knowledge graph.
//!
//! Entities and relationships live in explicit tables; edges reference entities by
//! id, never by pointer. Evidence is keyed by `(relationship, memory)` so replaying
//! the same memory never inflates a relationship.

use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::Serialize;

use super::extract::{EntityRef, Extraction};
use super::types::{
    entity_id, evidence_strength, normalize_label, relationship_id, EntityType, KnowledgeEntity,
    KnowledgeRelationship, RelationType,
};
use crate::db::{self, SharedConn};
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct ApplyStats {
    pub entities: usize,
    pub relationships: usize,
    /// Evidence rows that were not already recorded.
    pub new_evidence: usize,
}

#[derive(Debug, Serialize)]
pub struct GraphStats {
    pub entities: u64,
    pub relationships: u64,
    pub evidence: u64,
}

#[derive(Clone)]
pub struct GraphStore {
    conn: SharedConn,
}

impl GraphStore {
    pub fn new(conn: SharedConn) -> Self {
        Self { conn }
    }

    /// Record what was extracted from one memory, in one transaction.
    pub fn apply(&self, memory_id: &str, extraction: &Extraction, prior: f64) -> EngineResult<ApplyStats> {
        let mut conn = db::lock(&self.conn)?;
        let tx = conn.transaction()?;
        let now = db::now_timestamp();
        let mut stats = ApplyStats::default();

        for entity in &extraction.entities {
            let id = upsert_entity(&tx, entity, &now)?;
            tx.execute(
                "INSERT OR IGNORE INTO entity_memories (entity_id, memory_id) VALUES (?1, ?2)",
                params![id, memory_id],
            )?;
            stats.entities += 1;
        }

        for rel in &extraction.relationships {
            let source = upsert_entity(&tx, &rel.source, &now)?;
            let target = upsert_entity(&tx, &rel.target, &now)?;
            let id = relationship_id(&source, &target, rel.relation);
            tx.execute(
                "INSERT INTO knowledge_relationships \
                 (id, source_id, target_id, relation, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5) ON CONFLICT(id) DO NOTHING",
                params![id, source, target, rel.relation.as_str(), now],
            )?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO relationship_evidence (relationship_id, memory_id, confidence) \
                 VALUES (?1, ?2, ?3)",
                params![id, memory_id, rel.confidence.clamp(0.0, 1.0)],
            )?;
            if inserted > 0 {
                refresh_strength(&tx, &id, prior, &now)?;
                stats.new_evidence += 1;
            }
            stats.relationships += 1;
        }

        tx.commit()?;
        Ok(stats)
    }

    /// Withdraw everything a memory contributed. Relationships and entities left
    /// without evidence are deleted. Returns the number of relationships touched.
    pub fn forget_memory(&self, memory_id: &str, prior: f64) -> EngineResult<usize> {
        let mut conn = db::lock(&self.conn)?;
        let tx = conn.transaction()?;
        let affected: Vec<String> = {
            let mut stmt =
                tx.prepare("SELECT relationship_id FROM relationship_evidence WHERE memory_id = ?1")?;
            let rows = stmt
                .query_map(params![memory_id], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            rows
        };
        tx.execute("DELETE FROM relationship_evidence WHERE memory_id = ?1", params![memory_id])?;
        tx.execute("DELETE FROM entity_memories WHERE memory_id = ?1", params![memory_id])?;

        let now = db::now_timestamp();
        for id in &affected {
            refresh_strength(&tx, id, prior, &now)?;
        }
        tx.execute(
            "DELETE FROM knowledge_relationships WHERE evidence_count = 0",
            [],
        )?;
        let orphans = tx.execute(
            "DELETE FROM knowledge_entities \
             WHERE id NOT IN (SELECT entity_id FROM entity_memories) \
               AND id NOT IN (SELECT source_id FROM knowledge_relationships) \
               AND id NOT IN (SELECT target_id FROM knowledge_relationships)",
            [],
        )?;
        tx.commit()?;
        if orphans > 0 {
            tracing::debug!(memory_id = %memory_id, orphans, "entities without evidence removed");
        }
        Ok(affected.len())
    }

    pub fn entity(&self, id: &str) -> EngineResult<KnowledgeEntity> {
        let conn = db::lock(&self.conn)?;
        let row: Option<(String, String, String)> = conn
            .query_row(
                "SELECT id, entity_type, label FROM knowledge_entities WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let (id, ty, label) = row.ok_or_else(|| EngineError::NotFound(format!("entity {id}")))?;
        let memory_ids = entity_memories(&conn, &id)?;
        Ok(KnowledgeEntity {
            entity_type: parse_type(&ty)?,
            id,
            label,
            memory_ids,
        })
    }

    /// Entities whose normalized label matches, any type.
    pub fn find_entity(&self, label: &str) -> EngineResult<Vec<KnowledgeEntity>> {
        let wanted = normalize_label(label);
        let ids: Vec<String> = {
            let conn = db::lock(&self.conn)?;
            let mut stmt =
                conn.prepare("SELECT id FROM knowledge_entities WHERE label = ?1 ORDER BY entity_type")?;
            let rows = stmt
                .query_map(params![wanted], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            rows
        };
        ids.iter().map(|id| self.entity(id)).collect()
    }

    /// Every entity and relationship, for building the in-memory arena.
    pub fn load(&self) -> EngineResult<(Vec<KnowledgeEntity>, Vec<KnowledgeRelationship>)> {
        let conn = db::lock(&self.conn)?;

        let mut links: HashMap<String, Vec<String>> = HashMap::new();
        {
            let mut stmt =
                conn.prepare("SELECT entity_id, memory_id FROM entity_memories ORDER BY memory_id")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
            for row in rows {
                let (entity, memory) = row?;
                links.entry(entity).or_default().push(memory);
            }
        }
        let mut evidence: HashMap<String, Vec<String>> = HashMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT relationship_id, memory_id FROM relationship_evidence ORDER BY memory_id",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
            for row in rows {
                let (rel, memory) = row?;
                evidence.entry(rel).or_default().push(memory);
            }
        }

        let mut stmt =
            conn.prepare("SELECT id, entity_type, label FROM knowledge_entities ORDER BY id")?;
        let raw = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        let mut entities = Vec::with_capacity(raw.len());
        for (id, ty, label) in raw {
            entities.push(KnowledgeEntity {
                entity_type: parse_type(&ty)?,
                memory_ids: links.remove(&id).unwrap_or_default(),
                id,
                label,
            });
        }

        let mut stmt = conn.prepare(
            "SELECT id, source_id, target_id, relation, strength, evidence_count \
             FROM knowledge_relationships ORDER BY id",
        )?;
        let raw = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let mut relationships = Vec::with_capacity(raw.len());
        for (id, source_id, target_id, relation, strength, count) in raw {
            relationships.push(KnowledgeRelationship {
                relation: relation
                    .parse::<RelationType>()
                    .map_err(EngineError::Internal)?,
                memory_ids: evidence.remove(&id).unwrap_or_default(),
                id,
                source_id,
                target_id,
                strength,
                evidence_count: count.max(0) as u32,
            });
        }
        Ok((entities, relationships))
    }

    pub fn stats(&self) -> EngineResult<GraphStats> {
        let conn = db::lock(&self.conn)?;
        let count = |sql: &str| -> rusqlite::Result<u64> {
            conn.query_row(sql, [], |row| row.get::<_, i64>(0)).map(|n| n as u64)
        };
        Ok(GraphStats {
            entities: count("SELECT COUNT(*) FROM knowledge_entities")?,
            relationships: count("SELECT COUNT(*) FROM knowledge_relationships")?,
            evidence: count("SELECT COUNT(*) FROM relationship_evidence")?,
        })
    }
}

fn parse_type(raw: &str) -> EngineResult<EntityType> {
    raw.parse::<EntityType>().map_err(EngineError::Internal)
}

fn upsert_entity(tx: &Transaction<'_>, entity: &EntityRef, now: &str) -> rusqlite::Result<String> {
    let id = entity_id(entity.entity_type, &entity.label);
    tx.execute(
        "INSERT INTO knowledge_entities (id, entity_type, label, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?4) ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at",
        params![id, entity.entity_type.as_str(), entity.label, now],
    )?;
    Ok(id)
}

/// Recompute count and strength of a relationship from its evidence rows.
fn refresh_strength(tx: &Transaction<'_>, id: &str, prior: f64, now: &str) -> rusqlite::Result<()> {
    let (count, sum): (i64, f64) = tx.query_row(
        "SELECT COUNT(*), COALESCE(SUM(confidence), 0.0) FROM relationship_evidence \
         WHERE relationship_id = ?1",
        params![id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let count = count.max(0) as u32;
    tx.execute(
        "UPDATE knowledge_relationships \
         SET evidence_count = ?1, confidence_sum = ?2, strength = ?3, updated_at = ?4 WHERE id = ?5",
        params![count, sum, evidence_strength(sum, count, prior), now, id],
    )?;
    Ok(())
}

fn entity_memories(conn: &Connection, id: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT memory_id FROM entity_memories WHERE entity_id = ?1 ORDER BY memory_id")?;
    let rows = stmt
        .query_map(params![id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::extract::RelationCandidate;

    fn store() -> GraphStore {
        GraphStore::new(db::shared(db::open_memory_database().unwrap()))
    }

    fn extraction(confidence: f64) -> Extraction {
        let walk = EntityRef::new(EntityType::Habit, "walk").unwrap();
        let sleep = EntityRef::new(EntityType::Concept, "sleep").unwrap();
        Extraction {
            entities: vec![walk.clone(), sleep.clone()],
            relationships: vec![RelationCandidate {
                source: walk,
                target: sleep,
                relation: RelationType::Improves,
                confidence,
            }],
        }
    }

    #[test]
    fn replaying_a_memory_does_not_add_evidence() {
        let s = store();
        let first = s.apply("m1", &extraction(0.8), 2.0).unwrap();
        let again = s.apply("m1", &extraction(0.8), 2.0).unwrap();
        assert_eq!(first.new_evidence, 1);
        assert_eq!(again.new_evidence, 0);

        let (_, rels) = s.load().unwrap();
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].evidence_count, 1);
        assert!((rels[0].strength - evidence_strength(0.8, 1, 2.0)).abs() < 1e-9);
    }

    #[test]
    fn more_memories_strengthen_the_edge() {
        let s = store();
        s.apply("m1", &extraction(0.8), 2.0).unwrap();
        let weak = s.load().unwrap().1[0].strength;
        s.apply("m2", &extraction(0.8), 2.0).unwrap();
        s.apply("m3", &extraction(0.8), 2.0).unwrap();
        let (_, rels) = s.load().unwrap();
        assert_eq!(rels[0].evidence_count, 3);
        assert!(rels[0].strength > weak);
        assert_eq!(rels[0].memory_ids, ["m1", "m2", "m3"]);
    }

    #[test]
    fn forgetting_the_only_memory_drops_the_edge() {
        let s = store();
        s.apply("m1", &extraction(0.8), 2.0).unwrap();
        s.apply("m2", &extraction(0.6), 2.0).unwrap();
        s.forget_memory("m1", 2.0).unwrap();
        let (_, rels) = s.load().unwrap();
        assert_eq!(rels[0].evidence_count, 1);
        assert!((rels[0].strength - evidence_strength(0.6, 1, 2.0)).abs() < 1e-9);

        s.forget_memory("m2", 2.0).unwrap();
        assert!(s.load().unwrap().1.is_empty());
    }

    #[test]
    fn forgetting_the_last_memory_drops_its_entities() {
        let s = store();
        s.apply("m1", &extraction(0.8), 2.0).unwrap();
        let lone = Extraction {
            entities: vec![EntityRef::new(EntityType::Habit, "walk").unwrap()],
            relationships: Vec::new(),
        };
        s.apply("m2", &lone, 2.0).unwrap();

        s.forget_memory("m1", 2.0).unwrap();
        let (entities, rels) = s.load().unwrap();
        assert!(rels.is_empty());
        // "walk" is still backed by m2; "sleep" had only m1
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].label, "walk");
        assert!(s.find_entity("sleep").unwrap().is_empty());

        s.forget_memory("m2", 2.0).unwrap();
        assert!(s.load().unwrap().0.is_empty());
    }

    #[test]
    fn find_by_label() {
        let s = store();
        s.apply("m1", &extraction(0.8), 2.0).unwrap();
        let found = s.find_entity("  Walk ").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].entity_type, EntityType::Habit);
        assert_eq!(found[0].memory_ids, ["m1"]);
        assert!(matches!(s.entity("ent_missing"), Err(EngineError::NotFound(_))));
    }
}

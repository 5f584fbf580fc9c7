//! In-memory arena over the knowledge graph and the reasoning queries on it.
//!
//! Entities sit in a `Vec`; edges refer to them by index. Cycles are ordinary data
//! here and traversals carry a visited set, so no walk revisits an entity.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use super::types::{KnowledgeEntity, KnowledgeRelationship, RelationType};
use crate::error::{EngineError, EngineResult};

/// Hard ceiling on traversal depth regardless of configuration.
pub const MAX_DEPTH: usize = 3;

#[derive(Debug, Clone, Serialize)]
pub struct EntitySummary {
    pub id: String,
    pub entity_type: super::types::EntityType,
    pub label: String,
}

impl From<&KnowledgeEntity> for EntitySummary {
    fn from(e: &KnowledgeEntity) -> Self {
        Self {
            id: e.id.clone(),
            entity_type: e.entity_type,
            label: e.label.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Edge {
    pub relation: RelationType,
    pub target: EntitySummary,
    pub strength: f64,
    pub evidence_count: u32,
}

/// An entity reachable from the queried one, with its strongest path.
#[derive(Debug, Clone, Serialize)]
pub struct Impact {
    pub entity: EntitySummary,
    pub depth: usize,
    /// Product of edge strengths along the path.
    pub strength: f64,
    /// Relations along the path, in order.
    pub path: Vec<RelationType>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuggestedAction {
    pub action: String,
    pub relation: RelationType,
    pub strength: f64,
    pub evidence_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Reasoning {
    pub entity: EntitySummary,
    /// Direct outgoing relationships, strongest first.
    pub relationships: Vec<Edge>,
    /// Everything reachable within the depth bound, strongest first.
    pub impacts: Vec<Impact>,
    pub suggested_actions: Vec<SuggestedAction>,
}

pub struct KnowledgeGraph {
    entities: Vec<KnowledgeEntity>,
    edges: Vec<KnowledgeRelationship>,
    by_id: HashMap<String, usize>,
    outgoing: Vec<Vec<usize>>,
    incoming: Vec<Vec<usize>>,
    /// Entity index of each edge's endpoints.
    ends: Vec<(usize, usize)>,
}

fn by_strength(a: f64, b: f64, a_id: &str, b_id: &str) -> std::cmp::Ordering {
    b.total_cmp(&a).then_with(|| a_id.cmp(b_id))
}

impl KnowledgeGraph {
    /// Build the arena. Edges whose endpoints are missing are dropped.
    pub fn new(entities: Vec<KnowledgeEntity>, relationships: Vec<KnowledgeRelationship>) -> Self {
        let by_id: HashMap<String, usize> = entities
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.clone(), i))
            .collect();
        let mut outgoing = vec![Vec::new(); entities.len()];
        let mut incoming = vec![Vec::new(); entities.len()];
        let mut edges = Vec::with_capacity(relationships.len());
        let mut ends = Vec::with_capacity(relationships.len());
        for rel in relationships {
            let (Some(&s), Some(&t)) = (by_id.get(&rel.source_id), by_id.get(&rel.target_id)) else {
                continue;
            };
            outgoing[s].push(edges.len());
            incoming[t].push(edges.len());
            ends.push((s, t));
            edges.push(rel);
        }
        Self {
            entities,
            edges,
            by_id,
            outgoing,
            incoming,
            ends,
        }
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn entity(&self, id: &str) -> Option<&KnowledgeEntity> {
        self.by_id.get(id).map(|&i| &self.entities[i])
    }

    fn index_of(&self, id: &str) -> EngineResult<usize> {
        self.by_id
            .get(id)
            .copied()
            .ok_or_else(|| EngineError::NotFound(format!("entity {id}")))
    }

    /// Every entity reachable from `start` in at most `max_depth` hops (clamped to
    /// [`MAX_DEPTH`]), keeping the strongest path to each. Depth-first with a
    /// per-path visited set.
    pub fn traverse(&self, start: &str, max_depth: usize) -> EngineResult<Vec<Impact>> {
        let origin = self.index_of(start)?;
        let max_depth = max_depth.clamp(1, MAX_DEPTH);
        let mut best: HashMap<usize, Impact> = HashMap::new();

        struct Frame {
            node: usize,
            strength: f64,
            path: Vec<RelationType>,
            visited: HashSet<usize>,
        }
        let mut stack = vec![Frame {
            node: origin,
            strength: 1.0,
            path: Vec::new(),
            visited: HashSet::from([origin]),
        }];

        while let Some(frame) = stack.pop() {
            if frame.path.len() >= max_depth {
                continue;
            }
            for &e in &self.outgoing[frame.node] {
                let (_, next) = self.ends[e];
                if frame.visited.contains(&next) {
                    continue;
                }
                let edge = &self.edges[e];
                let strength = frame.strength * edge.strength;
                let mut path = frame.path.clone();
                path.push(edge.relation);

                let better = best
                    .get(&next)
                    .map_or(true, |b| strength > b.strength || (strength == b.strength && path.len() < b.depth));
                if better {
                    best.insert(
                        next,
                        Impact {
                            entity: (&self.entities[next]).into(),
                            depth: path.len(),
                            strength,
                            path: path.clone(),
                        },
                    );
                }
                let mut visited = frame.visited.clone();
                visited.insert(next);
                stack.push(Frame {
                    node: next,
                    strength,
                    path,
                    visited,
                });
            }
        }

        let mut impacts: Vec<Impact> = best.into_values().collect();
        impacts.sort_by(|a, b| {
            by_strength(a.strength, b.strength, &a.entity.id, &b.entity.id)
        });
        Ok(impacts)
    }

    /// Direct relationships, multi-hop impacts and suggested actions for an entity.
    pub fn reason(&self, entity_id: &str, max_depth: usize, max_suggestions: usize) -> EngineResult<Reasoning> {
        let idx = self.index_of(entity_id)?;
        let entity = &self.entities[idx];

        let mut direct: Vec<&KnowledgeRelationship> =
            self.outgoing[idx].iter().map(|&e| &self.edges[e]).collect();
        direct.sort_by(|a, b| by_strength(a.strength, b.strength, &a.id, &b.id));
        let relationships = direct
            .into_iter()
            .filter_map(|rel| {
                let target = self.entity(&rel.target_id)?;
                Some(Edge {
                    relation: rel.relation,
                    target: target.into(),
                    strength: rel.strength,
                    evidence_count: rel.evidence_count,
                })
            })
            .collect();

        // Actionable edges touching the entity from either side.
        let mut actionable: Vec<usize> = self.outgoing[idx]
            .iter()
            .chain(&self.incoming[idx])
            .copied()
            .filter(|&e| self.edges[e].relation.is_actionable())
            .collect();
        actionable.sort_by(|&a, &b| {
            by_strength(self.edges[a].strength, self.edges[b].strength, &self.edges[a].id, &self.edges[b].id)
        });
        actionable.dedup();
        let suggested_actions = actionable
            .into_iter()
            .take(max_suggestions)
            .map(|e| {
                let rel = &self.edges[e];
                let (s, t) = self.ends[e];
                let (source, target) = (&self.entities[s].label, &self.entities[t].label);
                let action = if s == idx {
                    format!("keep up {source}: it {} {target}", rel.relation.as_str())
                } else {
                    format!("try {source}: it {} {target}", rel.relation.as_str())
                };
                SuggestedAction {
                    action,
                    relation: rel.relation,
                    strength: rel.strength,
                    evidence_count: rel.evidence_count,
                }
            })
            .collect();

        Ok(Reasoning {
            entity: entity.into(),
            relationships,
            impacts: self.traverse(entity_id, max_depth)?,
            suggested_actions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::types::EntityType;

    fn entity(id: &str) -> KnowledgeEntity {
        KnowledgeEntity {
            id: id.into(),
            entity_type: EntityType::Concept,
            label: id.into(),
            memory_ids: vec![],
        }
    }

    fn rel(source: &str, target: &str, relation: RelationType, strength: f64) -> KnowledgeRelationship {
        KnowledgeRelationship {
            id: format!("{source}-{target}"),
            source_id: source.into(),
            target_id: target.into(),
            relation,
            strength,
            evidence_count: 1,
            memory_ids: vec![],
        }
    }

    fn graph(rels: Vec<KnowledgeRelationship>) -> KnowledgeGraph {
        let mut ids: Vec<String> = rels
            .iter()
            .flat_map(|r| [r.source_id.clone(), r.target_id.clone()])
            .collect();
        ids.sort();
        ids.dedup();
        KnowledgeGraph::new(ids.iter().map(|i| entity(i)).collect(), rels)
    }

    #[test]
    fn cycles_terminate() {
        let g = graph(vec![
            rel("a", "b", RelationType::Causes, 0.9),
            rel("b", "c", RelationType::Causes, 0.9),
            rel("c", "a", RelationType::Causes, 0.9),
        ]);
        let impacts = g.traverse("a", 3).unwrap();
        let ids: Vec<&str> = impacts.iter().map(|i| i.entity.id.as_str()).collect();
        assert_eq!(ids, ["b", "c"]);
    }

    #[test]
    fn depth_is_clamped_to_three() {
        let g = graph(vec![
            rel("a", "b", RelationType::Causes, 1.0),
            rel("b", "c", RelationType::Causes, 1.0),
            rel("c", "d", RelationType::Causes, 1.0),
            rel("d", "e", RelationType::Causes, 1.0),
        ]);
        let impacts = g.traverse("a", 10).unwrap();
        assert_eq!(impacts.len(), 3);
        assert!(impacts.iter().all(|i| i.depth <= MAX_DEPTH));
        assert!(g.traverse("a", 1).unwrap().len() == 1);
    }

    #[test]
    fn strongest_path_wins() {
        let g = graph(vec![
            rel("a", "d", RelationType::Causes, 0.2),
            rel("a", "b", RelationType::Causes, 0.9),
            rel("b", "d", RelationType::Causes, 0.9),
        ]);
        let impacts = g.traverse("a", 3).unwrap();
        let d = impacts.iter().find(|i| i.entity.id == "d").unwrap();
        assert_eq!(d.depth, 2);
        assert!((d.strength - 0.81).abs() < 1e-9);
    }

    #[test]
    fn reason_ranks_and_suggests() {
        let g = graph(vec![
            rel("walk", "sleep", RelationType::Improves, 0.6),
            rel("walk", "stress", RelationType::Prevents, 0.7),
            rel("walk", "park", RelationType::OccursAt, 0.9),
            rel("stretch", "walk", RelationType::Improves, 0.3),
        ]);
        let r = g.reason("walk", 3, 2).unwrap();
        let targets: Vec<&str> = r.relationships.iter().map(|e| e.target.id.as_str()).collect();
        assert_eq!(targets, ["park", "stress", "sleep"]);
        assert_eq!(r.suggested_actions.len(), 2);
        assert_eq!(r.suggested_actions[0].relation, RelationType::Prevents);
        assert_eq!(r.suggested_actions[1].relation, RelationType::Improves);
        assert!((r.suggested_actions[1].strength - 0.6).abs() < 1e-9);
    }

    #[test]
    fn unknown_entity_is_not_found() {
        let g = graph(vec![]);
        assert!(matches!(g.reason("nope", 3, 3), Err(EngineError::NotFound(_))));
    }
}

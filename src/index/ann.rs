//! Navigable small-world graph for approximate nearest-neighbour search.
//!
//! Single layer, fully deterministic: node 0 is the entry point, insertion links a
//! new node to the best `max_degree` candidates found by a beam search of width
//! `ef_construction`, and over-full neighbour lists are pruned back to the
//! `max_degree` closest. Search is the same beam search with width `ef_search`.
//! Small graphs are scanned exactly instead.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};

use serde::{Deserialize, Serialize};

use crate::memory::partition::PartitionKey;
use crate::memory::{cosine_similarity, TopK};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AnnParams {
    pub max_degree: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub exact_search_below: usize,
}

impl AnnParams {
    pub fn from_config(config: &crate::config::IndexConfig) -> Self {
        Self {
            max_degree: config.max_degree.max(2),
            ef_construction: config.ef_construction.max(1),
            ef_search: config.ef_search.max(1),
            exact_search_below: config.exact_search_below,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub partition: PartitionKey,
    pub vector: Vec<f32>,
    neighbors: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnGraph {
    params: AnnParams,
    nodes: Vec<Node>,
    #[serde(skip)]
    by_id: HashMap<String, usize>,
}

/// Candidate ordered by score, then by lower node index.
#[derive(Debug, Clone, Copy)]
struct Scored {
    score: f32,
    idx: usize,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.idx.cmp(&self.idx))
    }
}

impl AnnGraph {
    pub fn new(params: AnnParams) -> Self {
        Self {
            params,
            nodes: Vec::new(),
            by_id: HashMap::new(),
        }
    }

    /// Build from scratch, inserting in the given order.
    pub fn build(
        params: AnnParams,
        entries: impl IntoIterator<Item = (String, PartitionKey, Vec<f32>)>,
    ) -> Self {
        let mut graph = Self::new(params);
        for (id, partition, vector) in entries {
            graph.insert(id, partition, vector);
        }
        graph
    }

    /// Restore the id lookup after deserialization.
    pub fn reindex(&mut self) {
        self.by_id = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();
    }

    pub fn params(&self) -> &AnnParams {
        &self.params
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn vector(&self, id: &str) -> Option<&[f32]> {
        self.by_id.get(id).map(|&i| self.nodes[i].vector.as_slice())
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Add a node. Returns `false` if the id is already present.
    pub fn insert(&mut self, id: String, partition: PartitionKey, vector: Vec<f32>) -> bool {
        if self.by_id.contains_key(&id) {
            return false;
        }
        let idx = self.nodes.len();
        let neighbors: Vec<usize> = if self.nodes.is_empty() {
            Vec::new()
        } else {
            self.beam_search(&vector, self.params.ef_construction)
                .into_iter()
                .take(self.params.max_degree)
                .map(|s| s.idx)
                .collect()
        };

        self.by_id.insert(id.clone(), idx);
        self.nodes.push(Node {
            id,
            partition,
            vector,
            neighbors: neighbors.clone(),
        });
        for n in neighbors {
            self.nodes[n].neighbors.push(idx);
            if self.nodes[n].neighbors.len() > self.params.max_degree {
                self.prune(n);
            }
        }
        true
    }

    /// Keep only the `max_degree` closest neighbours of node `n`.
    fn prune(&mut self, n: usize) {
        let base = &self.nodes[n].vector;
        let mut scored: Vec<Scored> = self.nodes[n]
            .neighbors
            .iter()
            .map(|&m| Scored {
                score: cosine_similarity(base, &self.nodes[m].vector),
                idx: m,
            })
            .collect();
        scored.sort_by(|a, b| b.cmp(a));
        scored.truncate(self.params.max_degree);
        self.nodes[n].neighbors = scored.into_iter().map(|s| s.idx).collect();
    }

    /// Greedy best-first search from the entry node, keeping the best `ef` seen.
    /// Returns candidates best first.
    fn beam_search(&self, query: &[f32], ef: usize) -> Vec<Scored> {
        if self.nodes.is_empty() {
            return Vec::new();
        }
        let ef = ef.max(1);
        let mut visited = vec![false; self.nodes.len()];
        let mut frontier: BinaryHeap<Scored> = BinaryHeap::new();
        let mut best: BinaryHeap<Reverse<Scored>> = BinaryHeap::new();

        let entry = Scored {
            score: cosine_similarity(query, &self.nodes[0].vector),
            idx: 0,
        };
        visited[0] = true;
        frontier.push(entry);
        best.push(Reverse(entry));

        while let Some(current) = frontier.pop() {
            let worst = best.peek().map(|r| r.0.score).unwrap_or(f32::NEG_INFINITY);
            if best.len() >= ef && current.score < worst {
                break;
            }
            for &n in &self.nodes[current.idx].neighbors {
                if visited[n] {
                    continue;
                }
                visited[n] = true;
                let candidate = Scored {
                    score: cosine_similarity(query, &self.nodes[n].vector),
                    idx: n,
                };
                let worst = best.peek().map(|r| r.0.score).unwrap_or(f32::NEG_INFINITY);
                if best.len() < ef || candidate.score > worst {
                    frontier.push(candidate);
                    best.push(Reverse(candidate));
                    if best.len() > ef {
                        best.pop();
                    }
                }
            }
        }

        let mut out: Vec<Scored> = best.into_iter().map(|r| r.0).collect();
        out.sort_by(|a, b| b.cmp(a));
        out
    }

    /// Top `k` nodes accepted by `keep`, as `(id, cosine)` best first with ties
    /// broken by id. Exact below the configured size threshold.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        keep: impl Fn(&Node) -> bool,
    ) -> Vec<(String, f32)> {
        if k == 0 || self.nodes.is_empty() {
            return Vec::new();
        }
        let mut top = TopK::new(k);
        if self.nodes.len() < self.params.exact_search_below {
            for node in self.nodes.iter().filter(|n| keep(n)) {
                top.push(node.id.clone(), cosine_similarity(query, &node.vector));
            }
        } else {
            // Widen the beam so filtered-out nodes do not starve the result.
            let ef = self.params.ef_search.max(k.saturating_mul(2));
            for s in self.beam_search(query, ef) {
                let node = &self.nodes[s.idx];
                if keep(node) {
                    top.push(node.id.clone(), s.score);
                }
            }
        }
        top.into_sorted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::hashing::HashEmbedder;

    fn params(exact_below: usize) -> AnnParams {
        AnnParams {
            max_degree: 12,
            ef_construction: 64,
            ef_search: 48,
            exact_search_below: exact_below,
        }
    }

    fn key() -> PartitionKey {
        PartitionKey::from_stored("u/habit/2026-W42")
    }

    fn corpus(n: usize, dims: usize) -> Vec<(String, Vec<f32>)> {
        let e = HashEmbedder::new("hash-v1", dims);
        (0..n)
            .map(|i| {
                let text = format!("note {i} about topic {} and item {}", i % 17, i % 29);
                (format!("m{i:04}"), e.embed_one(&text))
            })
            .collect()
    }

    #[test]
    fn insert_is_idempotent() {
        let mut g = AnnGraph::new(params(0));
        assert!(g.insert("a".into(), key(), vec![1.0, 0.0]));
        assert!(!g.insert("a".into(), key(), vec![0.0, 1.0]));
        assert_eq!(g.len(), 1);
        assert_eq!(g.vector("a"), Some(&[1.0f32, 0.0][..]));
    }

    #[test]
    fn neighbour_lists_are_bounded() {
        let data = corpus(200, 32);
        let g = AnnGraph::build(params(0), data.into_iter().map(|(id, v)| (id, key(), v)));
        assert!(g.nodes.iter().all(|n| n.neighbors.len() <= 12));
    }

    #[test]
    fn exact_mode_matches_linear_scan() {
        let data = corpus(100, 32);
        let g = AnnGraph::build(
            params(1000),
            data.iter().map(|(id, v)| (id.clone(), key(), v.clone())),
        );
        let query = &data[42].1;
        let mut top = TopK::new(5);
        for (id, v) in &data {
            top.push(id.clone(), cosine_similarity(query, v));
        }
        assert_eq!(g.search(query, 5, |_| true), top.into_sorted());
    }

    #[test]
    fn graph_search_recalls_stored_vectors() {
        let data = corpus(400, 16);
        let g = AnnGraph::build(
            params(0),
            data.iter().map(|(id, v)| (id.clone(), key(), v.clone())),
        );
        let hits = data
            .iter()
            .step_by(8)
            .filter(|(id, v)| {
                let top = g.search(v, 1, |_| true);
                // identical texts collide; accept any exact-score tie
                top.first()
                    .map(|(hit, score)| hit == id || (*score - 1.0).abs() < 1e-6)
                    .unwrap_or(false)
            })
            .count();
        assert!(hits * 10 >= 50 * 9, "recall too low: {hits}/50");
    }

    #[test]
    fn search_is_deterministic() {
        let data = corpus(300, 16);
        let build = || {
            AnnGraph::build(
                params(0),
                data.iter().map(|(id, v)| (id.clone(), key(), v.clone())),
            )
        };
        let (a, b) = (build(), build());
        assert_eq!(a.search(&data[7].1, 10, |_| true), b.search(&data[7].1, 10, |_| true));
    }

    #[test]
    fn filter_excludes_nodes() {
        let mut g = AnnGraph::new(params(1000));
        g.insert("a".into(), key(), vec![1.0, 0.0]);
        g.insert("b".into(), key(), vec![0.9, 0.1]);
        let hits = g.search(&[1.0, 0.0], 5, |n| n.id != "a");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "b");
    }

    #[test]
    fn serde_round_trip_needs_reindex() {
        let mut g = AnnGraph::new(params(0));
        g.insert("a".into(), key(), vec![1.0, 0.0]);
        let json = serde_json::to_string(&g).unwrap();
        let mut restored: AnnGraph = serde_json::from_str(&json).unwrap();
        assert!(!restored.contains("a"));
        restored.reindex();
        assert!(restored.contains("a"));
    }
}

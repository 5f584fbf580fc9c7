//! One physical index unit.
//!
//! A shard serves one or more partitions. Readers clone the `Arc<AnnGraph>` out of
//! the lock and search it without holding anything; writers build a complete new
//! graph and swap the pointer, so a reader sees either the old or the new graph.
//! Fresh vectors sit in the pending buffer, in submission order, until the next
//! `apply_pending` folds them in.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};

use super::ann::{AnnGraph, AnnParams};
use crate::memory::partition::PartitionKey;
use crate::memory::store::StoredVector;
use crate::memory::{cosine_similarity, IdChecksum, TopK};

pub type ShardId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingEntry {
    pub id: String,
    pub partition: PartitionKey,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardStats {
    pub shard_id: ShardId,
    pub partitions: Vec<PartitionKey>,
    pub nodes: usize,
    pub pending: usize,
    pub tombstones: usize,
    pub stale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_consolidated: Option<DateTime<Utc>>,
}

pub struct Shard {
    id: ShardId,
    params: AnnParams,
    partitions: RwLock<BTreeSet<PartitionKey>>,
    graph: RwLock<Arc<AnnGraph>>,
    pending: Mutex<Vec<PendingEntry>>,
    tombstones: RwLock<HashSet<String>>,
    /// Held by whoever is producing the next graph.
    writer: Mutex<()>,
    stale: AtomicBool,
    /// Set once the shard has been merged away. Writers that raced the merge
    /// must repeat their write on the new route.
    retired: AtomicBool,
    last_consolidated: Mutex<Option<DateTime<Utc>>>,
}

impl Shard {
    pub fn new(id: impl Into<ShardId>, params: AnnParams) -> Self {
        Self::with_graph(id, params, AnnGraph::new(params), BTreeSet::new(), None)
    }

    pub fn with_graph(
        id: impl Into<ShardId>,
        params: AnnParams,
        graph: AnnGraph,
        partitions: BTreeSet<PartitionKey>,
        last_consolidated: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: id.into(),
            params,
            partitions: RwLock::new(partitions),
            graph: RwLock::new(Arc::new(graph)),
            pending: Mutex::new(Vec::new()),
            tombstones: RwLock::new(HashSet::new()),
            writer: Mutex::new(()),
            stale: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            last_consolidated: Mutex::new(last_consolidated),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn partitions(&self) -> Vec<PartitionKey> {
        self.partitions.read().iter().cloned().collect()
    }

    pub fn add_partition(&self, key: PartitionKey) {
        self.partitions.write().insert(key);
    }

    /// The current graph. Cheap: clones the pointer only.
    pub fn graph(&self) -> Arc<AnnGraph> {
        self.graph.read().clone()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Block graph writers on this shard until the guard drops.
    pub fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock()
    }

    /// Stop serving and hand back whatever was buffered: pending entries and
    /// tombstones.
    pub fn retire(&self) -> (Vec<PendingEntry>, Vec<String>) {
        self.retired.store(true, Ordering::SeqCst);
        let pending = std::mem::take(&mut *self.pending.lock());
        let tombstones = std::mem::take(&mut *self.tombstones.write());
        (pending, tombstones.into_iter().collect())
    }

    pub fn last_consolidated(&self) -> Option<DateTime<Utc>> {
        *self.last_consolidated.lock()
    }

    /// Whether `id` is live in the graph or waiting in the pending buffer.
    pub fn contains(&self, id: &str) -> bool {
        if self.tombstones.read().contains(id) {
            return false;
        }
        self.graph().contains(id) || self.pending.lock().iter().any(|e| e.id == id)
    }

    /// Make a vector searchable immediately. It joins the graph on the next
    /// [`apply_pending`](Self::apply_pending). A tombstoned id stays hidden.
    pub fn push_pending(&self, entry: PendingEntry) {
        if self.tombstones.read().contains(&entry.id) {
            return;
        }
        self.partitions.write().insert(entry.partition.clone());
        self.pending.lock().push(entry);
    }

    /// Hide a record from every future search.
    pub fn remove(&self, id: &str) {
        self.tombstones.write().insert(id.to_string());
        self.pending.lock().retain(|e| e.id != id);
    }

    /// Fold the pending buffer into a new graph and swap it in. Returns how many
    /// entries were applied. Safe to call repeatedly.
    pub fn apply_pending(&self) -> usize {
        let _writer = self.writer.lock();
        let batch: Vec<PendingEntry> = self.pending.lock().clone();
        if batch.is_empty() {
            return 0;
        }

        let current = self.graph();
        // A vector for an id already in the graph (model upgrade) needs a full rebuild.
        let replaced: HashMap<&str, &PendingEntry> = batch
            .iter()
            .filter(|e| current.vector(&e.id).is_some_and(|v| v != e.vector.as_slice()))
            .map(|e| (e.id.as_str(), e))
            .collect();

        let next = if replaced.is_empty() {
            let mut next = (*current).clone();
            for e in &batch {
                next.insert(e.id.clone(), e.partition.clone(), e.vector.clone());
            }
            next
        } else {
            let existing = current.nodes().map(|n| match replaced.get(n.id.as_str()) {
                Some(e) => (e.id.clone(), e.partition.clone(), e.vector.clone()),
                None => (n.id.clone(), n.partition.clone(), n.vector.clone()),
            });
            let fresh = batch
                .iter()
                .filter(|e| !current.contains(&e.id))
                .map(|e| (e.id.clone(), e.partition.clone(), e.vector.clone()));
            AnnGraph::build(self.params, existing.chain(fresh).collect::<Vec<_>>())
        };

        let next = Arc::new(next);
        *self.graph.write() = next.clone();
        // Entries pushed meanwhile stay unless the new graph already holds them as-is.
        self.pending
            .lock()
            .retain(|e| next.vector(&e.id) != Some(e.vector.as_slice()));
        tracing::debug!(shard = %self.id, applied = batch.len(), "pending entries indexed");
        batch.len()
    }

    /// Replace the graph with one built from `vectors` (read from the store) and
    /// drop tombstones it no longer contains.
    pub fn rebuild(&self, vectors: Vec<StoredVector>, partitions: BTreeSet<PartitionKey>) {
        let _writer = self.writer.lock();
        let graph = AnnGraph::build(
            self.params,
            vectors.into_iter().map(|v| (v.id, v.partition_key, v.vector)),
        );
        let node_count = graph.len();
        let graph = Arc::new(graph);
        *self.graph.write() = graph.clone();
        self.pending.lock().retain(|e| !graph.contains(&e.id));
        self.tombstones.write().clear();
        *self.partitions.write() = partitions;
        *self.last_consolidated.lock() = Some(Utc::now());
        self.stale.store(false, Ordering::SeqCst);
        tracing::info!(shard = %self.id, nodes = node_count, "shard rebuilt");
    }

    /// Best `k` ids among those whose partition passes `keep`, from the graph and
    /// the pending buffer. An id present in both takes the graph's score.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        keep: &dyn Fn(&PartitionKey) -> bool,
    ) -> Vec<(String, f32)> {
        let graph = self.graph();
        let tombstones = self.tombstones.read().clone();
        let visible = |id: &str, p: &PartitionKey| !tombstones.contains(id) && keep(p);

        let from_graph = graph.search(query, k, |n| visible(&n.id, &n.partition));
        let mut seen: HashSet<String> = from_graph.iter().map(|(id, _)| id.clone()).collect();

        let mut top = TopK::new(k);
        for (id, score) in from_graph {
            top.push(id, score);
        }
        for e in self.pending.lock().iter() {
            if graph.contains(&e.id) || !visible(&e.id, &e.partition) {
                continue;
            }
            if seen.insert(e.id.clone()) {
                top.push(e.id.clone(), cosine_similarity(query, &e.vector));
            }
        }
        top.into_sorted()
    }

    /// Fingerprint of the live ids: graph plus pending, minus tombstones.
    pub fn checksum(&self) -> IdChecksum {
        let graph = self.graph();
        let tombstones = self.tombstones.read();
        let mut ids: BTreeSet<&str> = graph
            .nodes()
            .map(|n| n.id.as_str())
            .filter(|id| !tombstones.contains(*id))
            .collect();
        let pending = self.pending.lock();
        ids.extend(
            pending
                .iter()
                .map(|e| e.id.as_str())
                .filter(|id| !tombstones.contains(*id)),
        );
        IdChecksum::from_ids(ids)
    }

    /// Share of graph nodes that are tombstoned.
    pub fn tombstone_ratio(&self) -> f64 {
        let nodes = self.graph().len();
        if nodes == 0 {
            return 0.0;
        }
        self.tombstones.read().len() as f64 / nodes as f64
    }

    /// Live nodes, counting pending entries.
    pub fn live_count(&self) -> usize {
        let graph = self.graph();
        let tombstones = self.tombstones.read().len();
        (graph.len() + self.pending_len()).saturating_sub(tombstones)
    }

    pub fn stats(&self) -> ShardStats {
        ShardStats {
            shard_id: self.id.clone(),
            partitions: self.partitions(),
            nodes: self.graph().len(),
            pending: self.pending_len(),
            tombstones: self.tombstones.read().len(),
            stale: self.is_stale(),
            last_consolidated: self.last_consolidated(),
        }
    }

    pub(crate) fn pending_snapshot(&self) -> Vec<PendingEntry> {
        self.pending.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> AnnParams {
        AnnParams {
            max_degree: 8,
            ef_construction: 32,
            ef_search: 16,
            exact_search_below: 0,
        }
    }

    fn key() -> PartitionKey {
        PartitionKey::from_stored("u/habit/2026-W42")
    }

    fn entry(id: &str, v: Vec<f32>) -> PendingEntry {
        PendingEntry {
            id: id.into(),
            partition: key(),
            vector: v,
        }
    }

    #[test]
    fn pending_is_visible_before_apply() {
        let shard = Shard::new("s", params());
        shard.push_pending(entry("a", vec![1.0, 0.0]));
        let hits = shard.search(&[1.0, 0.0], 1, &|_| true);
        assert_eq!(hits[0].0, "a");
        assert_eq!(shard.graph().len(), 0);
    }

    #[test]
    fn apply_pending_swaps_graph_and_is_idempotent() {
        let shard = Shard::new("s", params());
        shard.push_pending(entry("a", vec![1.0, 0.0]));
        shard.push_pending(entry("b", vec![0.0, 1.0]));
        let before = shard.graph();
        assert_eq!(shard.apply_pending(), 2);
        assert_eq!(shard.apply_pending(), 0);
        // an old reader still holds the old, complete graph
        assert_eq!(before.len(), 0);
        assert_eq!(shard.graph().len(), 2);
        assert_eq!(shard.pending_len(), 0);
        assert_eq!(shard.search(&[0.0, 1.0], 1, &|_| true)[0].0, "b");
    }

    #[test]
    fn replay_of_same_entry_does_not_duplicate() {
        let shard = Shard::new("s", params());
        shard.push_pending(entry("a", vec![1.0, 0.0]));
        shard.apply_pending();
        shard.push_pending(entry("a", vec![1.0, 0.0]));
        shard.apply_pending();
        assert_eq!(shard.graph().len(), 1);
        assert_eq!(shard.checksum(), IdChecksum::from_ids(["a"]));
    }

    #[test]
    fn new_vector_for_existing_id_replaces_it() {
        let shard = Shard::new("s", params());
        shard.push_pending(entry("a", vec![1.0, 0.0]));
        shard.apply_pending();
        shard.push_pending(entry("a", vec![0.0, 1.0]));
        shard.apply_pending();
        assert_eq!(shard.graph().vector("a"), Some(&[0.0f32, 1.0][..]));
    }

    #[test]
    fn tombstones_hide_records() {
        let shard = Shard::new("s", params());
        shard.push_pending(entry("a", vec![1.0, 0.0]));
        shard.push_pending(entry("b", vec![0.9, 0.1]));
        shard.apply_pending();
        shard.remove("a");
        let hits = shard.search(&[1.0, 0.0], 5, &|_| true);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "b");
        assert!((shard.tombstone_ratio() - 0.5).abs() < 1e-9);
        assert_eq!(shard.checksum(), IdChecksum::from_ids(["b"]));
    }

    #[test]
    fn late_push_cannot_revive_a_tombstone() {
        let shard = Shard::new("s", params());
        shard.push_pending(entry("a", vec![1.0, 0.0]));
        shard.apply_pending();
        shard.remove("a");
        // an embed that was in flight when the record was deleted
        shard.push_pending(entry("a", vec![1.0, 0.0]));
        assert!(!shard.contains("a"));
        assert!(shard.search(&[1.0, 0.0], 5, &|_| true).is_empty());
    }

    #[test]
    fn retire_hands_back_buffered_state() {
        let shard = Shard::new("s", params());
        shard.push_pending(entry("a", vec![1.0, 0.0]));
        shard.push_pending(entry("b", vec![0.0, 1.0]));
        shard.apply_pending();
        shard.push_pending(entry("c", vec![0.5, 0.5]));
        shard.remove("b");
        let (pending, tombstones) = shard.retire();
        assert!(shard.is_retired());
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "c");
        assert_eq!(tombstones, vec!["b".to_string()]);
        assert_eq!(shard.pending_len(), 0);
    }

    #[test]
    fn rebuild_clears_tombstones_and_stale_flag() {
        let shard = Shard::new("s", params());
        shard.push_pending(entry("a", vec![1.0, 0.0]));
        shard.apply_pending();
        shard.remove("a");
        shard.mark_stale();
        shard.rebuild(
            vec![StoredVector {
                id: "b".into(),
                partition_key: key(),
                vector: vec![0.0, 1.0],
            }],
            BTreeSet::from([key()]),
        );
        assert!(!shard.is_stale());
        assert_eq!(shard.stats().tombstones, 0);
        assert_eq!(shard.checksum(), IdChecksum::from_ids(["b"]));
        assert!(shard.last_consolidated().is_some());
    }
}

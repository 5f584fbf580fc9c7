//! Partitioned similarity index.
//!
//! Every partition key routes to one [`Shard`]; a fresh partition gets a shard of
//! its own and consolidation may later fold aged partitions into a per-lineage
//! archive shard. Routing is persisted in the `partitions` table, shard contents in
//! JSON snapshots, and both are derived data: [`PartitionedIndex::rebuild_all`]
//! regenerates everything from the record table.

pub mod ann;
pub mod consolidation;
pub mod shard;
pub mod snapshot;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rusqlite::{params, Connection};
use serde::Serialize;

use self::ann::AnnParams;
use self::consolidation::{Action, ShardView};
use self::shard::{PendingEntry, Shard, ShardId, ShardStats};
use self::snapshot::ShardSnapshot;
use crate::config::IndexConfig;
use crate::db;
use crate::error::{EngineError, EngineResult};
use crate::memory::partition::PartitionKey;
use crate::memory::store::MemoryStore;
use crate::memory::types::MemoryFilter;

/// Result of a fan-out search.
#[derive(Debug, Default)]
pub struct SearchOutcome {
    /// `(id, cosine)` best first.
    pub hits: Vec<(String, f32)>,
    /// The deadline cut the fan-out short.
    pub degraded: bool,
    /// Matching partitions whose shard is marked stale; cover them by a scan.
    pub fallback: Vec<PartitionKey>,
    /// Matching partitions left unsearched because the deadline passed.
    pub skipped: Vec<PartitionKey>,
    pub shards_searched: usize,
}

#[derive(Debug, Serialize)]
pub struct IndexHealth {
    pub shard_count: usize,
    pub partition_count: usize,
    pub total_nodes: usize,
    pub total_pending: usize,
    pub stale_shards: usize,
    pub shards: Vec<ShardStats>,
}

#[derive(Debug, Serialize)]
pub struct PartitionStat {
    pub partition_key: PartitionKey,
    pub shard_id: Option<ShardId>,
    pub count: u64,
    pub vector_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_consolidated: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize)]
pub struct ConsolidationReport {
    pub actions: Vec<Action>,
    pub verified: usize,
    pub inconsistent: Vec<ShardId>,
}

pub struct PartitionedIndex {
    config: IndexConfig,
    params: AnnParams,
    store: MemoryStore,
    snapshot_dir: Option<PathBuf>,
    routes: RwLock<HashMap<PartitionKey, ShardId>>,
    shards: RwLock<BTreeMap<ShardId, Arc<Shard>>>,
}

impl PartitionedIndex {
    pub fn new(store: MemoryStore, config: &IndexConfig, snapshot_dir: Option<PathBuf>) -> Self {
        Self {
            params: AnnParams::from_config(config),
            config: config.clone(),
            store,
            snapshot_dir,
            routes: RwLock::new(HashMap::new()),
            shards: RwLock::new(BTreeMap::new()),
        }
    }

    /// Load routing and shard snapshots, rebuilding any shard whose snapshot is
    /// missing or disagrees with the record table.
    pub fn open(
        store: MemoryStore,
        config: &IndexConfig,
        snapshot_dir: Option<PathBuf>,
    ) -> EngineResult<Self> {
        let index = Self::new(store, config, snapshot_dir);
        index.load()?;
        Ok(index)
    }

    fn load(&self) -> EngineResult<()> {
        let mut routes: HashMap<PartitionKey, ShardId> = {
            let conn = db::lock(self.store.conn())?;
            load_routes(&conn)?.into_iter().collect()
        };
        // Partitions created before they were ever routed get their own shard.
        let mut new_routes = Vec::new();
        for count in self.store.partition_counts()? {
            if !routes.contains_key(&count.partition_key) {
                let shard_id = count.partition_key.as_str().to_string();
                new_routes.push((count.partition_key.clone(), shard_id.clone()));
                routes.insert(count.partition_key, shard_id);
            }
        }
        if !new_routes.is_empty() {
            let conn = db::lock(self.store.conn())?;
            for (key, shard_id) in &new_routes {
                upsert_route(&conn, key, shard_id)?;
            }
        }

        let mut by_shard: BTreeMap<ShardId, BTreeSet<PartitionKey>> = BTreeMap::new();
        for (key, shard_id) in &routes {
            by_shard
                .entry(shard_id.clone())
                .or_default()
                .insert(key.clone());
        }

        let mut snapshots: HashMap<ShardId, ShardSnapshot> = HashMap::new();
        if let Some(dir) = &self.snapshot_dir {
            match snapshot::load_all(dir) {
                Ok(list) => {
                    for s in list {
                        snapshots.insert(s.shard_id.clone(), s);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to read index snapshots"),
            }
        }

        let (mut restored, mut rebuilt) = (0usize, 0usize);
        let mut shards = BTreeMap::new();
        for (shard_id, partitions) in by_shard {
            let keys: Vec<PartitionKey> = partitions.iter().cloned().collect();
            let expected = self.store.partition_checksum(&keys)?;
            let shard = match snapshots.remove(&shard_id) {
                Some(snap) if snap.partitions == partitions && snap.checksum == expected => {
                    restored += 1;
                    snap.restore()
                }
                _ => {
                    let shard = Shard::new(shard_id.clone(), self.params);
                    shard.rebuild(self.store.list_partition(&keys)?, partitions);
                    rebuilt += 1;
                    shard
                }
            };
            shards.insert(shard_id, Arc::new(shard));
        }
        if let Some(dir) = &self.snapshot_dir {
            for orphan in snapshots.keys() {
                snapshot::remove(dir, orphan);
            }
        }

        *self.routes.write() = routes;
        *self.shards.write() = shards;
        tracing::info!(restored, rebuilt, "index loaded");
        Ok(())
    }

    pub fn shard(&self, shard_id: &str) -> Option<Arc<Shard>> {
        self.shards.read().get(shard_id).cloned()
    }

    /// Shards whose last verification failed, in id order.
    pub fn stale_shard_ids(&self) -> Vec<ShardId> {
        let mut ids: Vec<ShardId> = self
            .shards
            .read()
            .values()
            .filter(|s| s.is_stale())
            .map(|s| s.id().to_string())
            .collect();
        ids.sort();
        ids
    }

    pub fn shard_for(&self, partition: &PartitionKey) -> Option<Arc<Shard>> {
        let shard_id = self.routes.read().get(partition).cloned()?;
        self.shard(&shard_id)
    }

    /// Shard serving `partition`, creating and persisting the route on first use.
    fn route(&self, partition: &PartitionKey) -> EngineResult<Arc<Shard>> {
        if let Some(shard) = self.shard_for(partition) {
            return Ok(shard);
        }
        let shard_id = partition.as_str().to_string();
        {
            let conn = db::lock(self.store.conn())?;
            upsert_route(&conn, partition, &shard_id)?;
        }
        let mut routes = self.routes.write();
        let mut shards = self.shards.write();
        let shard_id = routes
            .entry(partition.clone())
            .or_insert(shard_id)
            .clone();
        let shard = shards
            .entry(shard_id.clone())
            .or_insert_with(|| Arc::new(Shard::new(shard_id, self.params)))
            .clone();
        shard.add_partition(partition.clone());
        Ok(shard)
    }

    /// Make a vector searchable now; the graph picks it up on the next
    /// [`apply_pending`](Self::apply_pending). Returns the serving shard's id.
    pub fn insert(
        &self,
        partition: &PartitionKey,
        id: &str,
        vector: Vec<f32>,
    ) -> EngineResult<ShardId> {
        let entry = PendingEntry {
            id: id.to_string(),
            partition: partition.clone(),
            vector,
        };
        loop {
            let shard = self.route(partition)?;
            shard.push_pending(entry.clone());
            // A merge retired the shard under us; the route now points elsewhere.
            if !shard.is_retired() {
                return Ok(shard.id().to_string());
            }
        }
    }

    pub fn contains(&self, partition: &PartitionKey, id: &str) -> bool {
        self.shard_for(partition).is_some_and(|s| s.contains(id))
    }

    pub fn remove(&self, partition: &PartitionKey, id: &str) {
        while let Some(shard) = self.shard_for(partition) {
            shard.remove(id);
            if !shard.is_retired() {
                break;
            }
        }
    }

    /// Fold the pending buffer of the shard serving `partition` into its graph.
    pub fn apply_pending(&self, partition: &PartitionKey) -> usize {
        self.shard_for(partition)
            .map(|s| s.apply_pending())
            .unwrap_or(0)
    }

    /// Fan out to every shard serving a partition that matches `filter`, merging the
    /// per-shard top-k. Shards are visited in id order; once `deadline` passes the
    /// rest are skipped and the outcome is marked degraded.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: &MemoryFilter,
        deadline: Option<Instant>,
    ) -> SearchOutcome {
        let mut targets: BTreeMap<ShardId, BTreeSet<PartitionKey>> = BTreeMap::new();
        for (key, shard_id) in self.routes.read().iter() {
            if filter.matches_partition(key) {
                targets
                    .entry(shard_id.clone())
                    .or_default()
                    .insert(key.clone());
            }
        }

        let mut outcome = SearchOutcome::default();
        let mut merged: HashMap<String, f32> = HashMap::new();
        for (shard_id, partitions) in targets {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                outcome.degraded = true;
                outcome.skipped.extend(partitions);
                continue;
            }
            let Some(shard) = self.shard(&shard_id) else {
                outcome.fallback.extend(partitions);
                continue;
            };
            if shard.is_stale() {
                outcome.fallback.extend(partitions);
                continue;
            }
            let keep = |p: &PartitionKey| partitions.contains(p);
            for (id, score) in shard.search(query, k, &keep) {
                merged.entry(id).or_insert(score);
            }
            outcome.shards_searched += 1;
        }

        let mut top = crate::memory::TopK::new(k);
        for (id, score) in merged {
            top.push(id, score);
        }
        outcome.hits = top.into_sorted();
        if outcome.degraded {
            tracing::debug!(skipped = outcome.skipped.len(), "index search hit its deadline");
        }
        outcome
    }

    /// Compare a shard against the record table. A mismatch marks the shard stale
    /// and returns [`EngineError::Consistency`].
    pub fn verify(&self, shard_id: &str) -> EngineResult<()> {
        let shard = self
            .shard(shard_id)
            .ok_or_else(|| EngineError::NotFound(format!("shard {shard_id}")))?;
        let expected = self.store.partition_checksum(&shard.partitions())?;
        let actual = shard.checksum();
        if expected != actual {
            shard.mark_stale();
            tracing::warn!(
                shard = %shard_id,
                expected = expected.count,
                actual = actual.count,
                "index shard out of sync with store"
            );
            return Err(EngineError::Consistency {
                shard: shard_id.to_string(),
                details: format!(
                    "store has {} records, shard has {}",
                    expected.count, actual.count
                ),
            });
        }
        Ok(())
    }

    /// Rebuild one shard from the record table. Returns its node count.
    pub fn rebuild_shard(&self, shard_id: &str) -> EngineResult<usize> {
        let shard = self
            .shard(shard_id)
            .ok_or_else(|| EngineError::NotFound(format!("shard {shard_id}")))?;
        let partitions: BTreeSet<PartitionKey> = self
            .routes
            .read()
            .iter()
            .filter(|(_, s)| s.as_str() == shard_id)
            .map(|(k, _)| k.clone())
            .collect();
        let keys: Vec<PartitionKey> = partitions.iter().cloned().collect();
        shard.rebuild(self.store.list_partition(&keys)?, partitions);
        self.record_consolidated(&shard)?;
        self.save_snapshot(&shard);
        Ok(shard.graph().len())
    }

    /// Rebuild every shard. Returns the number rebuilt.
    pub fn rebuild_all(&self) -> EngineResult<usize> {
        let ids: Vec<ShardId> = self.shards.read().keys().cloned().collect();
        for id in &ids {
            self.rebuild_shard(id)?;
        }
        tracing::info!(shards = ids.len(), "index rebuilt from store");
        Ok(ids.len())
    }

    /// Run the consolidation policy, then verify every shard and rebuild the ones
    /// that disagree with the record table.
    pub fn consolidate(&self, now: DateTime<Utc>) -> EngineResult<ConsolidationReport> {
        let views: Vec<ShardView> = self
            .shards
            .read()
            .values()
            .map(|s| ShardView::of(s))
            .collect();
        let actions = consolidation::plan(&views, &self.config.consolidation, now);
        for action in &actions {
            match action {
                Action::Rebuild { shard, reason } => {
                    tracing::info!(shard = %shard, reason = %reason, "consolidation rebuild");
                    self.rebuild_shard(shard)?;
                }
                Action::Merge { sources, into } => self.merge(sources, into)?,
            }
        }

        let mut report = ConsolidationReport {
            actions,
            ..ConsolidationReport::default()
        };
        let ids: Vec<ShardId> = self.shards.read().keys().cloned().collect();
        for id in ids {
            match self.verify(&id) {
                Ok(()) => report.verified += 1,
                Err(EngineError::Consistency { .. }) => {
                    self.rebuild_shard(&id)?;
                    report.inconsistent.push(id);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    /// Fold `sources` into the archive shard `into` and reroute their partitions.
    fn merge(&self, sources: &[ShardId], into: &str) -> EngineResult<()> {
        let retiring: Vec<Arc<Shard>> = sources
            .iter()
            .filter(|id| id.as_str() != into)
            .filter_map(|id| self.shard(id))
            .collect();
        let _writers: Vec<_> = retiring.iter().map(|s| s.lock_writer()).collect();

        let mut partitions: BTreeSet<PartitionKey> = BTreeSet::new();
        {
            let routes = self.routes.read();
            for (key, shard_id) in routes.iter() {
                if shard_id == into || sources.contains(shard_id) {
                    partitions.insert(key.clone());
                }
            }
        }
        let keys: Vec<PartitionKey> = partitions.iter().cloned().collect();
        let vectors = self.store.list_partition(&keys)?;

        let archive = self
            .shard(into)
            .unwrap_or_else(|| Arc::new(Shard::new(into, self.params)));
        archive.rebuild(vectors, partitions);

        {
            let conn = db::lock(self.store.conn())?;
            for key in &keys {
                upsert_route(&conn, key, into)?;
            }
        }
        {
            let mut routes = self.routes.write();
            let mut shards = self.shards.write();
            for key in &keys {
                routes.insert(key.clone(), into.to_string());
            }
            shards.insert(into.to_string(), archive.clone());
            for source in sources.iter().filter(|id| id.as_str() != into) {
                shards.remove(source);
            }
            // Writes that reached a source shard after the store was read.
            for shard in &retiring {
                let (pending, tombstones) = shard.retire();
                for id in &tombstones {
                    archive.remove(id);
                }
                for entry in pending {
                    archive.push_pending(entry);
                }
            }
        }
        if let Some(dir) = &self.snapshot_dir {
            for source in sources {
                snapshot::remove(dir, source);
            }
        }
        self.record_consolidated(&archive)?;
        self.save_snapshot(&archive);
        tracing::info!(into = %into, merged = sources.len(), nodes = archive.graph().len(), "shards merged");
        Ok(())
    }

    fn record_consolidated(&self, shard: &Shard) -> EngineResult<()> {
        let at = shard.last_consolidated().unwrap_or_else(Utc::now);
        let conn = db::lock(self.store.conn())?;
        conn.execute(
            "UPDATE partitions SET last_consolidated = ?1 WHERE shard_id = ?2",
            params![db::timestamp(at), shard.id()],
        )?;
        Ok(())
    }

    fn save_snapshot(&self, shard: &Shard) {
        let Some(dir) = &self.snapshot_dir else {
            return;
        };
        if let Err(e) = snapshot::save(dir, &ShardSnapshot::capture(shard)) {
            tracing::warn!(shard = %shard.id(), error = %e, "failed to write shard snapshot");
        }
    }

    /// Write every shard to disk (shutdown). Returns the number written.
    pub fn save_snapshots(&self) -> usize {
        if self.snapshot_dir.is_none() {
            return 0;
        }
        let shards: Vec<Arc<Shard>> = self.shards.read().values().cloned().collect();
        for shard in &shards {
            self.save_snapshot(shard);
        }
        shards.len()
    }

    pub fn health(&self) -> IndexHealth {
        let shards: Vec<ShardStats> = self.shards.read().values().map(|s| s.stats()).collect();
        IndexHealth {
            shard_count: shards.len(),
            partition_count: self.routes.read().len(),
            total_nodes: shards.iter().map(|s| s.nodes).sum(),
            total_pending: shards.iter().map(|s| s.pending).sum(),
            stale_shards: shards.iter().filter(|s| s.stale).count(),
            shards,
        }
    }

    /// Per-partition record count, vector bytes and last consolidation time.
    pub fn partition_stats(&self) -> EngineResult<Vec<PartitionStat>> {
        let routes = self.routes.read().clone();
        let counts = self.store.partition_counts()?;
        Ok(counts
            .into_iter()
            .map(|c| {
                let shard_id = routes.get(&c.partition_key).cloned();
                let last_consolidated = shard_id
                    .as_deref()
                    .and_then(|id| self.shard(id))
                    .and_then(|s| s.last_consolidated());
                PartitionStat {
                    partition_key: c.partition_key,
                    shard_id,
                    count: c.count,
                    vector_bytes: c.vector_bytes,
                    last_consolidated,
                }
            })
            .collect())
    }
}

fn load_routes(conn: &Connection) -> rusqlite::Result<Vec<(PartitionKey, ShardId)>> {
    let mut stmt = conn.prepare("SELECT partition_key, shard_id FROM partitions")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                PartitionKey::from_stored(row.get::<_, String>(0)?),
                row.get::<_, String>(1)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn upsert_route(conn: &Connection, key: &PartitionKey, shard_id: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO partitions (partition_key, shard_id) VALUES (?1, ?2) \
         ON CONFLICT(partition_key) DO UPDATE SET shard_id = excluded.shard_id",
        params![key.as_str(), shard_id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::store::StoreOptions;
    use crate::memory::types::{NewMemory, Source};
    use chrono::{Duration, TimeZone};

    fn setup() -> (MemoryStore, IndexConfig) {
        let conn = db::shared(db::open_memory_database().unwrap());
        (MemoryStore::new(conn, StoreOptions::default()), IndexConfig::default())
    }

    fn axis(i: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; 8];
        v[i % 8] = 1.0;
        v[(i + 1) % 8] = 0.1 * (i / 8) as f32;
        v
    }

    /// Create an embedded record and feed it to the index the way the pipeline does.
    fn ingest(store: &MemoryStore, index: &PartitionedIndex, new: NewMemory) -> (String, PartitionKey) {
        let record = store.create(new).unwrap();
        let vector = record.embedding.clone().unwrap();
        index.insert(&record.partition_key, &record.id, vector).unwrap();
        (record.id, record.partition_key)
    }

    #[test]
    fn insert_is_searchable_before_apply() {
        let (store, config) = setup();
        let index = PartitionedIndex::new(store.clone(), &config, None);
        let (id, key) = ingest(&store, &index, NewMemory::new("a", Source::Habit).with_embedding(axis(2), "m"));

        let outcome = index.search(&axis(2), 1, &MemoryFilter::default(), None);
        assert_eq!(outcome.hits[0].0, id);
        assert_eq!(index.apply_pending(&key), 1);
        let outcome = index.search(&axis(2), 1, &MemoryFilter::default(), None);
        assert_eq!(outcome.hits[0].0, id);
        assert!(index.verify(key.as_str()).is_ok());
    }

    #[test]
    fn search_respects_source_filter() {
        let (store, config) = setup();
        let index = PartitionedIndex::new(store.clone(), &config, None);
        let (habit, _) = ingest(&store, &index, NewMemory::new("a", Source::Habit).with_embedding(axis(0), "m"));
        let (_med, _) = ingest(&store, &index, NewMemory::new("b", Source::Medication).with_embedding(axis(0), "m"));

        let filter = MemoryFilter {
            sources: vec![Source::Habit],
            ..MemoryFilter::default()
        };
        let outcome = index.search(&axis(0), 5, &filter, None);
        assert_eq!(outcome.hits.len(), 1);
        assert_eq!(outcome.hits[0].0, habit);
    }

    #[test]
    fn expired_deadline_degrades() {
        let (store, config) = setup();
        let index = PartitionedIndex::new(store.clone(), &config, None);
        ingest(&store, &index, NewMemory::new("a", Source::Habit).with_embedding(axis(0), "m"));
        let outcome = index.search(&axis(0), 5, &MemoryFilter::default(), Some(Instant::now()));
        assert!(outcome.degraded);
        assert!(outcome.hits.is_empty());
        assert_eq!(outcome.skipped.len(), 1);
    }

    #[test]
    fn checksum_mismatch_marks_stale_and_rebuild_repairs() {
        let (store, config) = setup();
        let index = PartitionedIndex::new(store.clone(), &config, None);
        let (_a, key) = ingest(&store, &index, NewMemory::new("a", Source::Chat).with_embedding(axis(1), "m"));
        // written to the store but never handed to the index
        let missed = store
            .create(NewMemory::new("b", Source::Chat).with_embedding(axis(5), "m"))
            .unwrap();
        assert_eq!(missed.partition_key, key);

        let err = index.verify(key.as_str()).unwrap_err();
        assert!(matches!(err, EngineError::Consistency { .. }));
        let outcome = index.search(&axis(5), 1, &MemoryFilter::default(), None);
        assert_eq!(outcome.fallback, vec![key.clone()]);

        index.rebuild_shard(key.as_str()).unwrap();
        assert!(index.verify(key.as_str()).is_ok());
        let outcome = index.search(&axis(5), 1, &MemoryFilter::default(), None);
        assert_eq!(outcome.hits[0].0, missed.id);
    }

    #[test]
    fn consolidation_merges_aged_partitions() {
        let (store, mut config) = setup();
        config.consolidation.small_shard_size = 10;
        config.consolidation.merge_after_days = 30;
        let index = PartitionedIndex::new(store.clone(), &config, None);
        let old = Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap();
        let mut ids = Vec::new();
        for week in 0..3 {
            let (id, _) = ingest(
                &store,
                &index,
                NewMemory::new(format!("w{week}"), Source::Habit)
                    .created_at(old + Duration::weeks(week))
                    .with_embedding(axis(week as usize), "m"),
            );
            ids.push(id);
        }
        assert_eq!(index.health().shard_count, 3);

        let now = Utc.with_ymd_and_hms(2026, 10, 16, 0, 0, 0).unwrap();
        let report = index.consolidate(now).unwrap();
        assert_eq!(report.actions.len(), 1);
        assert!(report.inconsistent.is_empty());

        let health = index.health();
        assert_eq!(health.shard_count, 1);
        assert_eq!(health.shards[0].shard_id, "default/habit/archive");
        assert_eq!(health.total_nodes, 3);
        let outcome = index.search(&axis(1), 1, &MemoryFilter::default(), None);
        assert_eq!(outcome.hits[0].0, ids[1]);
    }

    #[test]
    fn merge_carries_writes_the_store_did_not_have_yet() {
        let (store, mut config) = setup();
        config.consolidation.small_shard_size = 10;
        config.consolidation.merge_after_days = 30;
        let index = PartitionedIndex::new(store.clone(), &config, None);
        let old = Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap();
        let (_, key) = ingest(
            &store,
            &index,
            NewMemory::new("w0", Source::Habit)
                .created_at(old)
                .with_embedding(axis(0), "m"),
        );
        ingest(
            &store,
            &index,
            NewMemory::new("w1", Source::Habit)
                .created_at(old + Duration::weeks(1))
                .with_embedding(axis(1), "m"),
        );
        // indexed, but its vector is not in the store when the merge reads it
        let late = store
            .create(NewMemory::new("late", Source::Habit).created_at(old))
            .unwrap();
        index.insert(&key, &late.id, axis(6)).unwrap();
        let source = index.shard_for(&key).unwrap();

        index
            .consolidate(Utc.with_ymd_and_hms(2026, 10, 16, 0, 0, 0).unwrap())
            .unwrap();
        assert!(source.is_retired());
        assert_eq!(source.pending_len(), 0);

        let archive = index.shard_for(&key).unwrap();
        assert_eq!(archive.id(), "default/habit/archive");
        assert!(archive.contains(&late.id));
        // later writes follow the new route
        assert_eq!(index.insert(&key, "fresh", axis(7)).unwrap(), archive.id());
        index.remove(&key, "fresh");
        assert!(!archive.contains("fresh"));
    }

    #[test]
    fn reopen_restores_from_snapshots() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (store, config) = setup();
        let dir = Some(tmp.path().to_path_buf());
        let key = {
            let index = PartitionedIndex::new(store.clone(), &config, dir.clone());
            let (_, key) = ingest(&store, &index, NewMemory::new("a", Source::Voice).with_embedding(axis(3), "m"));
            index.apply_pending(&key);
            assert_eq!(index.save_snapshots(), 1);
            key
        };

        let reopened = PartitionedIndex::open(store.clone(), &config, dir).unwrap();
        assert!(reopened.verify(key.as_str()).is_ok());
        assert_eq!(reopened.health().total_nodes, 1);
    }

    #[test]
    fn open_without_snapshots_rebuilds_from_store() {
        let (store, config) = setup();
        store
            .create(NewMemory::new("a", Source::Finance).with_embedding(axis(4), "m"))
            .unwrap();
        let index = PartitionedIndex::open(store.clone(), &config, None).unwrap();
        let health = index.health();
        assert_eq!(health.shard_count, 1);
        assert_eq!(health.total_nodes, 1);
        assert_eq!(index.partition_stats().unwrap()[0].count, 1);
    }
}

//! Engine facade.
//!
//! [`Engine`] wires the store, embedding pipeline, scheduler, partitioned index,
//! retriever and knowledge graph together, owns the background loops, and is the
//! single entry point for the HTTP server and the CLI. It is also the scheduler's
//! [`TaskHandler`]: every task kind is dispatched here.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::config::MemoriaConfig;
use crate::db::{self, migrations, SharedConn};
use crate::embedding::cache::CacheStats;
use crate::embedding::{create_provider, EmbeddingPipeline, EmbeddingProvider};
use crate::error::{EngineError, EngineResult};
use crate::graph::extract::{Extractor, RuleExtractor};
use crate::graph::reason::Reasoning;
use crate::graph::store::{GraphStats, GraphStore};
use crate::graph::types::KnowledgeEntity;
use crate::graph::{BuildReport, KnowledgeBase};
use crate::index::{ConsolidationReport, IndexHealth, PartitionStat, PartitionedIndex};
use crate::memory::partition::PartitionKey;
use crate::memory::store::{MemoryStore, StoreOptions, StoreStats};
use crate::memory::types::{MemoryRecord, NewMemory};
use crate::retrieval::{Limits, RetrieveRequest, RetrieveResponse, Retriever};
use crate::scheduler::pressure::{ResourceMonitor, SystemMonitor};
use crate::scheduler::task::PRIORITY_URGENT;
use crate::scheduler::{Scheduler, SchedulerStats, Task, TaskHandler, TaskKind, TaskStatus};

/// Target meaning "everything" for consolidate and build_graph tasks.
pub const ALL_TARGETS: &str = "*";

const RECONCILE_BATCH: usize = 500;

#[derive(Debug, Serialize)]
pub struct IngestReceipt {
    pub id: String,
    pub partition_key: PartitionKey,
    /// Task that will embed and index the record. `None` only if the queue filled
    /// up between the capacity check and the submit; the reconcile sweep covers it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EngineStats {
    pub store: StoreStats,
    pub index: IndexHealth,
    pub scheduler: SchedulerStats,
    pub embedding_cache: CacheStats,
    pub graph: GraphStats,
    pub embedding_model: String,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    config: MemoriaConfig,
    store: MemoryStore,
    pipeline: Arc<EmbeddingPipeline>,
    scheduler: Scheduler,
    index: Arc<PartitionedIndex>,
    retriever: Retriever,
    graph: KnowledgeBase,
    background: Mutex<Vec<JoinHandle<()>>>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

/// Run blocking store/index work off the async runtime.
async fn blocking<T, F>(f: F) -> EngineResult<T>
where
    F: FnOnce() -> EngineResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

impl Engine {
    /// Open the database named in `config` with the configured provider and the
    /// host resource monitor.
    pub fn open(config: MemoriaConfig) -> anyhow::Result<Self> {
        let conn = db::open_database(config.resolved_db_path())?;
        let provider = create_provider(&config.embedding)?;
        Self::from_parts(
            config,
            db::shared(conn),
            provider,
            Arc::new(SystemMonitor::new()),
        )
    }

    /// Assemble an engine from explicit parts: recover the task log and load or
    /// rebuild the index.
    pub fn from_parts(
        config: MemoriaConfig,
        conn: SharedConn,
        provider: Arc<dyn EmbeddingProvider>,
        monitor: Arc<dyn ResourceMonitor>,
    ) -> anyhow::Result<Self> {
        {
            let guard = db::lock(&conn)?;
            let model = provider.model_version();
            match migrations::get_embedding_model(&guard)? {
                Some(stored) if stored != model => {
                    tracing::warn!(
                        stored = %stored,
                        configured = %model,
                        "embedding model changed; records will be re-embedded"
                    );
                    migrations::set_embedding_model(&guard, model)?;
                }
                Some(_) => {}
                None => migrations::set_embedding_model(&guard, model)?,
            }
        }

        let store = MemoryStore::new(conn.clone(), StoreOptions::from_config(&config));
        let pipeline = Arc::new(EmbeddingPipeline::new(provider, &config.embedding));
        let scheduler = Scheduler::new(
            conn.clone(),
            config.scheduler.clone(),
            config.worker_count(),
            monitor,
        );
        let replayed = scheduler.recover().context("failed to replay task log")?;
        let index = Arc::new(
            PartitionedIndex::open(store.clone(), &config.index, config.resolved_index_dir())
                .context("failed to load index")?,
        );
        let retriever = Retriever::new(store.clone(), index.clone(), config.retrieval.clone());
        let extractor: Arc<dyn Extractor> = Arc::new(RuleExtractor);
        let graph = KnowledgeBase::new(GraphStore::new(conn), extractor, config.graph.clone());

        tracing::info!(
            model = %pipeline.model_version(),
            replayed,
            shards = index.health().shard_count,
            "engine ready"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                pipeline,
                scheduler,
                index,
                retriever,
                graph,
                background: Mutex::new(Vec::new()),
                drain: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &MemoriaConfig {
        &self.inner.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn index(&self) -> &Arc<PartitionedIndex> {
        &self.inner.index
    }

    pub fn store(&self) -> &MemoryStore {
        &self.inner.store
    }

    fn handler(&self) -> Arc<dyn TaskHandler> {
        Arc::new(self.clone())
    }

    /// Start the task workers only.
    pub fn start_workers(&self) {
        let mut drain = self.inner.drain.lock();
        if drain.is_none() {
            *drain = Some(self.inner.scheduler.start(self.handler()));
        }
    }

    /// Start the task workers and the periodic maintenance loops.
    pub fn start(&self) {
        self.start_workers();
        if let Err(e) = self.reconcile() {
            tracing::warn!(error = %e, "initial reconcile sweep failed");
        }

        let consolidate_every = self.inner.config.index.consolidation.interval_secs;
        let graph_every = self.inner.config.graph.rebuild_interval_secs;
        let mut loops = self.inner.background.lock();

        if consolidate_every > 0 {
            let engine = self.clone();
            loops.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(consolidate_every));
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    engine.submit_quietly(TaskKind::Consolidate, ALL_TARGETS);
                    if let Err(e) = engine.reconcile() {
                        tracing::warn!(error = %e, "reconcile sweep failed");
                    }
                    if let Err(e) = engine.inner.scheduler.purge_finished() {
                        tracing::warn!(error = %e, "task log purge failed");
                    }
                }
            }));
            tracing::info!(every_secs = consolidate_every, "periodic consolidation enabled");
        }
        if graph_every > 0 {
            let engine = self.clone();
            loops.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(graph_every));
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    engine.submit_quietly(TaskKind::BuildGraph, ALL_TARGETS);
                }
            }));
            tracing::info!(every_secs = graph_every, "periodic graph rebuild enabled");
        }
    }

    /// Queue an urgent rebuild for every shard marked stale. Returns the task ids.
    pub fn schedule_repairs(&self) -> Vec<String> {
        self.inner
            .index
            .stale_shard_ids()
            .into_iter()
            .filter_map(|shard| self.submit_with(TaskKind::Consolidate, &shard, Some(PRIORITY_URGENT)))
            .collect()
    }

    fn submit_quietly(&self, kind: TaskKind, target: &str) -> Option<String> {
        self.submit_with(kind, target, None)
    }

    fn submit_with(&self, kind: TaskKind, target: &str, priority: Option<u8>) -> Option<String> {
        match self.inner.scheduler.submit(kind, target, priority) {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(kind = %kind, target = %target, error = %e, "could not submit task");
                None
            }
        }
    }

    /// Queue embed tasks for active records lacking a vector from the current model.
    /// Returns how many were submitted.
    pub fn reconcile(&self) -> EngineResult<usize> {
        let model = self.inner.pipeline.model_version().to_string();
        let ids = self.inner.store.list_unembedded(&model, RECONCILE_BATCH)?;
        let mut submitted = 0;
        for id in &ids {
            match self.inner.scheduler.submit(TaskKind::Embed, id, None) {
                Ok(_) => submitted += 1,
                Err(EngineError::QueueFull { .. }) => break,
                Err(e) => return Err(e),
            }
        }
        if submitted > 0 {
            tracing::info!(submitted, "reconcile sweep queued embeddings");
        }
        Ok(submitted)
    }

    /// Validate and store a record, then queue its embedding. Returns as soon as the
    /// record is durable.
    pub async fn ingest(&self, new: NewMemory) -> EngineResult<IngestReceipt> {
        self.inner.scheduler.check_capacity()?;
        let store = self.inner.store.clone();
        let record = blocking(move || store.create(new)).await?;

        let task_id = match &record.embedding {
            // Precomputed vector: visible right away, only the graph insert is queued.
            Some(vector) => {
                self.inner
                    .index
                    .insert(&record.partition_key, &record.id, vector.clone())?;
                self.submit_quietly(TaskKind::Index, &record.id)
            }
            None => self.submit_quietly(TaskKind::Embed, &record.id),
        };
        self.submit_quietly(TaskKind::BuildGraph, &record.id);

        tracing::info!(id = %record.id, source = %record.source, "memory ingested");
        Ok(IngestReceipt {
            id: record.id,
            partition_key: record.partition_key,
            task_id,
        })
    }

    pub async fn get(&self, id: &str) -> EngineResult<MemoryRecord> {
        let store = self.inner.store.clone();
        let id = id.to_string();
        blocking(move || store.get(&id)).await
    }

    /// Tombstone a record and withdraw it from the index and the graph.
    pub async fn soft_delete(&self, id: &str) -> EngineResult<MemoryRecord> {
        let inner = self.inner.clone();
        let id = id.to_string();
        blocking(move || {
            let record = inner.store.soft_delete(&id)?;
            inner.index.remove(&record.partition_key, &record.id);
            inner.graph.forget_memory(&record.id)?;
            Ok(record)
        })
        .await
    }

    pub async fn update_importance(&self, id: &str, score: f64) -> EngineResult<MemoryRecord> {
        let store = self.inner.store.clone();
        let id = id.to_string();
        blocking(move || {
            store.update_importance(&id, score)?;
            store.get(&id)
        })
        .await
    }

    /// Embed the query and run the retrieval pipeline within the request deadline.
    /// Running out of time yields a degraded, possibly empty, response.
    pub async fn retrieve(&self, request: RetrieveRequest) -> EngineResult<RetrieveResponse> {
        if request.query.trim().is_empty() {
            return Err(EngineError::Validation("query must not be empty".into()));
        }
        let started = Instant::now();
        let limits = Limits::resolve(&request, self.inner.retriever.config(), started);
        let remaining = limits.deadline.saturating_duration_since(Instant::now());

        let query = match tokio::time::timeout(remaining, self.inner.pipeline.embed(&request.query)).await {
            Ok(vector) => vector?,
            Err(_) => {
                tracing::warn!(deadline_ms = remaining.as_millis() as u64, "query embedding missed the deadline");
                return Ok(RetrieveResponse::empty(true));
            }
        };

        let retriever = self.inner.retriever.clone();
        let filter = request.filter();
        let response =
            blocking(move || retriever.retrieve_vector(&query, &filter, limits, Utc::now())).await?;
        self.schedule_repairs();
        tracing::debug!(
            results = response.results.len(),
            candidates = response.total_candidates,
            degraded = response.degraded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "retrieve"
        );
        Ok(response)
    }

    pub async fn reason(&self, entity_id: &str) -> EngineResult<Reasoning> {
        let graph = self.inner.graph.clone();
        let id = entity_id.to_string();
        blocking(move || graph.reason(&id)).await
    }

    pub async fn find_entity(&self, label: &str) -> EngineResult<Vec<KnowledgeEntity>> {
        let graph = self.inner.graph.clone();
        let label = label.to_string();
        blocking(move || graph.find_entity(&label)).await
    }

    /// Run extraction over every active record now, outside the scheduler.
    pub async fn build_graph(&self) -> EngineResult<BuildReport> {
        let inner = self.inner.clone();
        blocking(move || build_all(&inner)).await
    }

    pub fn submit(&self, kind: TaskKind, target: &str) -> EngineResult<String> {
        self.inner.scheduler.submit(kind, target, None)
    }

    pub fn task_status(&self, id: &str) -> EngineResult<Task> {
        self.inner.scheduler.status(id)
    }

    pub fn cancel_task(&self, id: &str) -> EngineResult<Task> {
        self.inner.scheduler.cancel(id)
    }

    pub fn list_tasks(&self, status: TaskStatus, limit: usize) -> EngineResult<Vec<Task>> {
        self.inner.scheduler.list(status, limit)
    }

    pub fn index_health(&self) -> IndexHealth {
        self.inner.index.health()
    }

    /// Rebuild every shard from the record table. Returns the number rebuilt.
    pub async fn rebuild_index(&self) -> EngineResult<usize> {
        let index = self.inner.index.clone();
        blocking(move || index.rebuild_all()).await
    }

    pub async fn consolidate(&self) -> EngineResult<ConsolidationReport> {
        let index = self.inner.index.clone();
        blocking(move || index.consolidate(Utc::now())).await
    }

    pub async fn partition_stats(&self) -> EngineResult<Vec<PartitionStat>> {
        let index = self.inner.index.clone();
        blocking(move || index.partition_stats()).await
    }

    pub async fn stats(&self) -> EngineResult<EngineStats> {
        let inner = self.inner.clone();
        blocking(move || {
            Ok(EngineStats {
                store: inner.store.stats()?,
                index: inner.index.health(),
                scheduler: inner.scheduler.stats()?,
                embedding_cache: inner.pipeline.cache_stats(),
                graph: inner.graph.stats()?,
                embedding_model: inner.pipeline.model_version().to_string(),
            })
        })
        .await
    }

    /// Wait until the task queue is empty and nothing is running.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        self.inner.scheduler.wait_idle(timeout).await
    }

    /// Stop background work, let in-flight tasks finish, persist shard snapshots and
    /// drop the embedding cache.
    pub async fn shutdown(&self) {
        for handle in self.inner.background.lock().drain(..) {
            handle.abort();
        }
        self.inner.scheduler.shutdown();
        let drain = self.inner.drain.lock().take();
        if let Some(handle) = drain {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "scheduler loop ended abnormally");
            }
        }
        let index = self.inner.index.clone();
        match tokio::task::spawn_blocking(move || index.save_snapshots()).await {
            Ok(saved) => tracing::info!(saved, "index snapshots written"),
            Err(e) => tracing::warn!(error = %e, "failed to write index snapshots"),
        }
        self.inner.pipeline.clear_cache();
        tracing::info!("engine stopped");
    }
}

fn build_all(inner: &Inner) -> EngineResult<BuildReport> {
    let records = inner.store.list_active(None, i64::MAX as usize)?;
    inner.graph.build_graph(&records)
}

#[async_trait]
impl TaskHandler for Engine {
    async fn handle_batch(&self, kind: TaskKind, targets: &[String]) -> Vec<EngineResult<()>> {
        match kind {
            TaskKind::Embed => self.embed_records(targets).await,
            _ => {
                let mut results = Vec::with_capacity(targets.len());
                for target in targets {
                    results.push(self.handle(kind, target).await);
                }
                results
            }
        }
    }

    async fn handle(&self, kind: TaskKind, target: &str) -> EngineResult<()> {
        match kind {
            TaskKind::Embed => self.handle_embed(target).await,
            TaskKind::Index => self.handle_index(target).await,
            TaskKind::Consolidate => {
                let index = self.inner.index.clone();
                let target = target.to_string();
                blocking(move || {
                    if target == ALL_TARGETS {
                        let report = index.consolidate(Utc::now())?;
                        if !report.actions.is_empty() || !report.inconsistent.is_empty() {
                            tracing::info!(
                                actions = report.actions.len(),
                                repaired = report.inconsistent.len(),
                                "consolidation finished"
                            );
                        }
                    } else {
                        index.rebuild_shard(&target)?;
                    }
                    Ok(())
                })
                .await
            }
            TaskKind::BuildGraph => {
                let inner = self.inner.clone();
                let target = target.to_string();
                blocking(move || {
                    if target == ALL_TARGETS {
                        build_all(&inner)?;
                    } else {
                        match inner.store.get(&target) {
                            Ok(record) => {
                                inner.graph.build_graph(std::slice::from_ref(&record))?;
                            }
                            Err(EngineError::NotFound(_)) => {}
                            Err(e) => return Err(e),
                        }
                    }
                    Ok(())
                })
                .await
            }
        }
    }
}

/// One record in an embed batch. `slot` is its position among the task targets.
struct EmbedJob {
    slot: usize,
    record: MemoryRecord,
    vector: Option<Vec<f32>>,
    fresh: bool,
}

/// Give each task of a failed batch its own copy of the error, keeping whether it
/// is worth retrying.
fn batch_error(e: &EngineError) -> EngineError {
    if e.is_retryable() {
        EngineError::Transient(e.to_string())
    } else {
        EngineError::Internal(e.to_string())
    }
}

impl Engine {
    /// Embed a record, store the vector, make it searchable and queue the graph
    /// insert. Safe to repeat.
    async fn handle_embed(&self, id: &str) -> EngineResult<()> {
        self.embed_records(&[id.to_string()])
            .await
            .pop()
            .unwrap_or(Ok(()))
    }

    /// Embed many records with one provider round trip. Returns one result per id.
    async fn embed_records(&self, ids: &[String]) -> Vec<EngineResult<()>> {
        let mut results: Vec<EngineResult<()>> = ids.iter().map(|_| Ok(())).collect();
        let store = self.inner.store.clone();
        let lookup = ids.to_vec();
        let mut records = match blocking(move || store.get_many(&lookup)).await {
            Ok(records) => records,
            Err(e) => return ids.iter().map(|_| Err(batch_error(&e))).collect(),
        };

        let model = self.inner.pipeline.model_version().to_string();
        let mut jobs: Vec<EmbedJob> = Vec::new();
        for (slot, id) in ids.iter().enumerate() {
            let Some(record) = records.remove(id) else {
                tracing::warn!(id = %id, "embed task for unknown memory");
                continue;
            };
            if record.is_deleted() {
                continue;
            }
            let vector = match (&record.embedding, record.embedding_model.as_deref()) {
                (Some(v), Some(m)) if m == model => Some(v.clone()),
                _ => None,
            };
            jobs.push(EmbedJob {
                slot,
                record,
                vector,
                fresh: false,
            });
        }

        let texts: Vec<String> = jobs
            .iter()
            .filter(|j| j.vector.is_none())
            .map(|j| j.record.text.clone())
            .collect();
        if !texts.is_empty() {
            match self.inner.pipeline.embed_batch(&texts).await {
                Ok(vectors) => {
                    let mut vectors = vectors.into_iter();
                    for job in jobs.iter_mut().filter(|j| j.vector.is_none()) {
                        job.vector = vectors.next();
                        job.fresh = true;
                    }
                }
                Err(e) => {
                    tracing::warn!(size = texts.len(), error = %e, "batch embedding failed");
                    for job in jobs.iter().filter(|j| j.vector.is_none()) {
                        results[job.slot] = Err(batch_error(&e));
                    }
                    jobs.retain(|j| j.vector.is_some());
                }
            }
        }
        if jobs.is_empty() {
            return results;
        }

        // Store the new vectors, then re-read: a delete may have landed meanwhile.
        let store = self.inner.store.clone();
        let stored = blocking(move || {
            let mut outcomes = Vec::with_capacity(jobs.len());
            for job in &jobs {
                let outcome = match (&job.vector, job.fresh) {
                    (Some(v), true) => store.attach_embedding(&job.record.id, v, &model).map(|_| ()),
                    _ => Ok(()),
                };
                outcomes.push(outcome);
            }
            let ids: Vec<String> = jobs.iter().map(|j| j.record.id.clone()).collect();
            let live = store.get_many(&ids)?;
            Ok((jobs, outcomes, live))
        })
        .await;
        let (jobs, outcomes, live) = match stored {
            Ok(stored) => stored,
            Err(e) => {
                for result in results.iter_mut().filter(|r| r.is_ok()) {
                    *result = Err(batch_error(&e));
                }
                return results;
            }
        };

        for (job, outcome) in jobs.into_iter().zip(outcomes) {
            if let Err(e) = outcome {
                results[job.slot] = Err(e);
                continue;
            }
            let deleted = live.get(&job.record.id).map_or(true, |r| r.is_deleted());
            let Some(vector) = job.vector else {
                continue;
            };
            if deleted {
                continue;
            }
            if let Err(e) = self
                .inner
                .index
                .insert(&job.record.partition_key, &job.record.id, vector)
            {
                results[job.slot] = Err(e);
                continue;
            }
            // The vector is stored and searchable; a full queue only delays the fold,
            // which the next consolidation or reconcile pass picks up.
            self.submit_quietly(TaskKind::Index, &job.record.id);
        }
        if ids.len() > 1 {
            tracing::debug!(size = ids.len(), embedded = texts.len(), "embed batch finished");
        }
        results
    }

    /// Fold the record's partition pending buffer into its graph.
    async fn handle_index(&self, id: &str) -> EngineResult<()> {
        let inner = self.inner.clone();
        let id = id.to_string();
        blocking(move || {
            let record = match inner.store.get(&id) {
                Ok(record) => record,
                Err(EngineError::NotFound(_)) => return Ok(()),
                Err(e) => return Err(e),
            };
            if record.is_deleted() {
                inner.index.remove(&record.partition_key, &record.id);
                return Ok(());
            }
            // After a restart without snapshots the pending entry may be gone.
            if !inner.index.contains(&record.partition_key, &record.id) {
                match record.embedding {
                    Some(vector) => {
                        inner.index.insert(&record.partition_key, &record.id, vector)?;
                    }
                    None => return Ok(()),
                }
            }
            let applied = inner.index.apply_pending(&record.partition_key);
            tracing::debug!(id = %record.id, applied, "index task applied");
            Ok(())
        })
        .await
    }
}

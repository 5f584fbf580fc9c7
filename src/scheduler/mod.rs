//! Priority task scheduler with a durable log, bounded retries and adaptive batching.
//!
//! Tasks are persisted to the `tasks` table before they are queued. A single drain
//! loop pops batches sized by [`pressure::BatchSizer`] and hands each task to a
//! worker gated by a semaphore. Failures classified retryable are re-queued with
//! exponential backoff up to `max_attempts`; anything else fails immediately. After
//! a crash, [`Scheduler::recover`] re-queues every task that was queued or running.

pub mod log;
pub mod pressure;
pub mod queue;
pub mod task;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;

use crate::config::SchedulerConfig;
use crate::db::SharedConn;
use crate::error::{EngineError, EngineResult};

use self::log::TaskLog;
use self::pressure::{BatchSizer, ResourceMonitor};
use self::queue::{QueuedTask, TaskQueue};
pub use self::task::{Task, TaskKind, TaskStatus};

/// Executes tasks. Must be idempotent by target: a task may run more than once.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, kind: TaskKind, target: &str) -> EngineResult<()>;

    /// Run several tasks of one kind together. Returns one result per target, in
    /// order. Only called for kinds where [`TaskKind::is_batched`] holds.
    async fn handle_batch(&self, kind: TaskKind, targets: &[String]) -> Vec<EngineResult<()>> {
        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            results.push(self.handle(kind, target).await);
        }
        results
    }
}

#[derive(Debug, Serialize)]
pub struct SchedulerStats {
    pub queued: usize,
    pub in_flight: usize,
    pub workers: usize,
    pub last_batch_size: usize,
    pub by_status: BTreeMap<String, u64>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    config: SchedulerConfig,
    workers: usize,
    log: TaskLog,
    queue: Mutex<TaskQueue>,
    sizer: Mutex<BatchSizer>,
    monitor: Arc<dyn ResourceMonitor>,
    permits: Arc<Semaphore>,
    in_flight: AtomicUsize,
    last_batch: AtomicUsize,
    wake: Notify,
    shutdown: watch::Sender<bool>,
}

/// Decrements the in-flight count when a worker finishes, even by panic.
struct InFlight(Arc<Inner>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.0.wake.notify_one();
    }
}

/// Delay before the attempt following attempt number `attempt` (1-based).
pub fn backoff_delay(config: &SchedulerConfig, attempt: u32) -> Duration {
    let factor = u64::from(config.backoff_factor.max(1));
    let multiplier = factor.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(config.backoff_base_ms.saturating_mul(multiplier))
}

impl Scheduler {
    pub fn new(
        conn: SharedConn,
        config: SchedulerConfig,
        workers: usize,
        monitor: Arc<dyn ResourceMonitor>,
    ) -> Self {
        let workers = workers.max(1);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                sizer: Mutex::new(BatchSizer::new(&config)),
                config,
                workers,
                log: TaskLog::new(conn),
                queue: Mutex::new(TaskQueue::new()),
                monitor,
                permits: Arc::new(Semaphore::new(workers)),
                in_flight: AtomicUsize::new(0),
                last_batch: AtomicUsize::new(0),
                wake: Notify::new(),
                shutdown,
            }),
        }
    }

    pub fn log(&self) -> &TaskLog {
        &self.inner.log
    }

    /// Re-queue every task the log shows as queued or running.
    ///
    /// A task that was running on its final attempt is marked failed instead, so no
    /// task ever exceeds `max_attempts`.
    pub fn recover(&self) -> EngineResult<usize> {
        let tasks = self.inner.log.list_unfinished()?;
        let max_attempts = self.inner.config.max_attempts;
        let mut queue = self.inner.queue.lock();
        let mut replayed = 0;

        for task in tasks {
            if queue.contains(&task.id) {
                continue;
            }
            if task.attempts >= max_attempts {
                self.inner.log.update(
                    &task.id,
                    TaskStatus::Failed,
                    None,
                    Some("interrupted during final attempt"),
                )?;
                tracing::error!(task_id = %task.id, kind = %task.kind, "task exhausted by restart");
                continue;
            }
            if task.status == TaskStatus::Running {
                self.inner
                    .log
                    .update(&task.id, TaskStatus::Queued, None, None)?;
            }
            queue.push(task.id, task.kind, task.target, task.priority, task.attempts);
            replayed += 1;
        }
        drop(queue);

        if replayed > 0 {
            tracing::info!(replayed, "replayed unfinished tasks from log");
            self.inner.wake.notify_one();
        }
        Ok(replayed)
    }

    /// Persist and queue a task. Returns the id of the task that will do the work.
    ///
    /// A queued task with the same kind and target is reused rather than duplicated.
    /// Fails with [`EngineError::QueueFull`] at the high-water mark.
    pub fn submit(
        &self,
        kind: TaskKind,
        target: &str,
        priority: Option<u8>,
    ) -> EngineResult<String> {
        let mut queue = self.inner.queue.lock();
        if let Some(existing) = queue.find(kind, target) {
            return Ok(existing.to_string());
        }
        let depth = queue.len();
        if depth >= self.inner.config.high_water_mark {
            return Err(EngineError::QueueFull {
                depth,
                high_water: self.inner.config.high_water_mark,
            });
        }

        let task = Task::new(kind, target, priority.unwrap_or_else(|| kind.default_priority()));
        self.inner.log.insert(&task)?;
        queue.push(task.id.clone(), kind, task.target, task.priority, 0);
        drop(queue);

        tracing::debug!(task_id = %task.id, kind = %kind, target = %target, "task submitted");
        self.inner.wake.notify_one();
        Ok(task.id)
    }

    /// Fail with [`EngineError::QueueFull`] if a new task would be rejected now.
    pub fn check_capacity(&self) -> EngineResult<()> {
        let depth = self.queue_depth();
        if depth >= self.inner.config.high_water_mark {
            return Err(EngineError::QueueFull {
                depth,
                high_water: self.inner.config.high_water_mark,
            });
        }
        Ok(())
    }

    pub fn status(&self, id: &str) -> EngineResult<Task> {
        self.inner
            .log
            .get(id)?
            .ok_or_else(|| EngineError::NotFound(format!("task {id}")))
    }

    /// Cancel a queued task. Running and finished tasks are left alone; the returned
    /// task shows which case applied.
    pub fn cancel(&self, id: &str) -> EngineResult<Task> {
        let removed = self.inner.queue.lock().cancel(id);
        if removed {
            self.inner
                .log
                .update(id, TaskStatus::Cancelled, None, None)?;
            tracing::debug!(task_id = %id, "task cancelled");
        }
        let task = self.status(id)?;
        if !removed && task.status.is_terminal() {
            tracing::debug!(task_id = %id, status = %task.status, "task already finished");
        }
        Ok(task)
    }

    /// Most recently updated tasks with `status`.
    pub fn list(&self, status: TaskStatus, limit: usize) -> EngineResult<Vec<Task>> {
        self.inner.log.list_by_status(status, limit)
    }

    /// Drop done and cancelled rows older than `task_retention_hours`. Failed rows
    /// stay for inspection. Returns rows removed.
    pub fn purge_finished(&self) -> EngineResult<usize> {
        let hours = self.inner.config.task_retention_hours;
        if hours == 0 {
            return Ok(0);
        }
        let hours = i64::try_from(hours).unwrap_or(i64::MAX / 3600);
        let cutoff = chrono::Utc::now() - chrono::Duration::hours(hours);
        let purged = self.inner.log.purge_finished(cutoff)?;
        if purged > 0 {
            tracing::info!(purged, "finished tasks purged from log");
        }
        Ok(purged)
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn stats(&self) -> EngineResult<SchedulerStats> {
        Ok(SchedulerStats {
            queued: self.queue_depth(),
            in_flight: self.inner.in_flight.load(Ordering::SeqCst),
            workers: self.inner.workers,
            last_batch_size: self.last_batch_size(),
            by_status: self.inner.log.counts()?,
        })
    }

    /// Batch size chosen by the most recent drain cycle.
    pub fn last_batch_size(&self) -> usize {
        self.inner.last_batch.load(Ordering::SeqCst)
    }

    /// Run one drain cycle: sample pressure, size the batch, pop that many ready
    /// tasks and dispatch them to workers. Returns how many were dispatched.
    pub async fn drain_once(&self, handler: &Arc<dyn TaskHandler>) -> usize {
        let pressure = self.inner.monitor.sample();
        let batch_size = self.inner.sizer.lock().next(pressure);
        self.inner.last_batch.store(batch_size, Ordering::SeqCst);

        let batch = {
            let mut queue = self.inner.queue.lock();
            let batch = queue.pop_ready(batch_size, Instant::now());
            self.inner.in_flight.fetch_add(batch.len(), Ordering::SeqCst);
            batch
        };
        let dispatched = batch.len();
        if dispatched > 0 {
            tracing::debug!(dispatched, batch_size, pressure, "drain cycle");
        }

        // Batched kinds go to one worker together, at the position of their first
        // task; the rest get one worker per task.
        let mut units: Vec<Vec<QueuedTask>> = Vec::new();
        let mut group_at: HashMap<TaskKind, usize> = HashMap::new();
        for task in batch {
            if task.kind.is_batched() {
                if let Some(&at) = group_at.get(&task.kind) {
                    units[at].push(task);
                    continue;
                }
                group_at.insert(task.kind, units.len());
            }
            units.push(vec![task]);
        }

        for unit in units {
            let guards: Vec<InFlight> = unit.iter().map(|_| InFlight(self.inner.clone())).collect();
            let permit = match self.inner.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    // Semaphore closed: put the tasks back rather than lose them.
                    let mut queue = self.inner.queue.lock();
                    for task in unit {
                        queue.push_delayed(task, Instant::now());
                    }
                    continue;
                }
            };
            let inner = self.inner.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let _guards = guards;
                if unit.len() == 1 {
                    if let Some(task) = unit.into_iter().next() {
                        run_task(&inner, handler.as_ref(), task).await;
                    }
                } else {
                    run_batch(&inner, handler.as_ref(), unit).await;
                }
            });
        }
        dispatched
    }

    /// Spawn the drain loop. It runs until [`shutdown`](Self::shutdown) and then
    /// waits for in-flight tasks to finish.
    pub fn start(&self, handler: Arc<dyn TaskHandler>) -> JoinHandle<()> {
        let scheduler = self.clone();
        let mut shutdown_rx = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            let poll = Duration::from_millis(scheduler.inner.config.poll_interval_ms.max(1));
            tracing::info!(workers = scheduler.inner.workers, "scheduler started");

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                if scheduler.drain_once(&handler).await > 0 {
                    continue;
                }
                let wait = scheduler
                    .inner
                    .queue
                    .lock()
                    .next_ready_at()
                    .map(|at| at.saturating_duration_since(Instant::now()).min(poll))
                    .unwrap_or(poll);
                tokio::select! {
                    _ = scheduler.inner.wake.notified() => {}
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }

            let workers = u32::try_from(scheduler.inner.workers).unwrap_or(u32::MAX);
            let _ = scheduler.inner.permits.acquire_many(workers).await;
            tracing::info!("scheduler stopped");
        })
    }

    /// Wait until nothing is queued or running. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let idle = self.inner.queue.lock().is_empty()
                && self.inner.in_flight.load(Ordering::SeqCst) == 0;
            if idle {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        self.inner.wake.notify_one();
    }
}

/// Record the start of an attempt. Returns the attempt number.
fn begin(inner: &Inner, task: &QueuedTask) -> u32 {
    let attempt = task.attempts + 1;
    if let Err(e) = inner
        .log
        .update(&task.id, TaskStatus::Running, Some(attempt), None)
    {
        tracing::error!(task_id = %task.id, error = %e, "failed to record task start");
    }
    tracing::debug!(task_id = %task.id, kind = %task.kind, target = %task.target, attempt, "task started");
    attempt
}

async fn run_task(inner: &Arc<Inner>, handler: &dyn TaskHandler, task: QueuedTask) {
    let attempt = begin(inner, &task);
    let result = handler.handle(task.kind, &task.target).await;
    finish(inner, task, attempt, result);
}

async fn run_batch(inner: &Arc<Inner>, handler: &dyn TaskHandler, tasks: Vec<QueuedTask>) {
    let attempts: Vec<u32> = tasks.iter().map(|t| begin(inner, t)).collect();
    let kind = tasks[0].kind;
    let targets: Vec<String> = tasks.iter().map(|t| t.target.clone()).collect();
    tracing::debug!(kind = %kind, size = tasks.len(), "batch started");

    let mut results = handler.handle_batch(kind, &targets).await.into_iter();
    for (task, attempt) in tasks.into_iter().zip(attempts) {
        let result = results.next().unwrap_or_else(|| {
            Err(EngineError::Internal("batch handler returned too few results".into()))
        });
        finish(inner, task, attempt, result);
    }
}

/// Apply the retry policy to an attempt's result and record the outcome.
fn finish(inner: &Inner, task: QueuedTask, attempt: u32, result: EngineResult<()>) {
    let outcome = match result {
        Ok(()) => {
            tracing::debug!(task_id = %task.id, kind = %task.kind, "task done");
            inner.log.update(&task.id, TaskStatus::Done, None, None)
        }
        Err(e) if e.is_retryable() && attempt < inner.config.max_attempts => {
            let delay = backoff_delay(&inner.config, attempt);
            tracing::warn!(
                task_id = %task.id,
                kind = %task.kind,
                attempt,
                max_attempts = inner.config.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %e,
                "task failed, retrying"
            );
            let message = e.to_string();
            let logged = inner
                .log
                .update(&task.id, TaskStatus::Queued, Some(attempt), Some(&message));
            let mut retry = task.clone();
            retry.attempts = attempt;
            inner
                .queue
                .lock()
                .push_delayed(retry, Instant::now() + delay);
            logged
        }
        Err(e) => {
            tracing::error!(
                task_id = %task.id,
                kind = %task.kind,
                target = %task.target,
                attempts = attempt,
                error = %e,
                "task failed"
            );
            let message = e.to_string();
            inner
                .log
                .update(&task.id, TaskStatus::Failed, Some(attempt), Some(&message))
        }
    };

    if let Err(e) = outcome {
        tracing::error!(task_id = %task.id, error = %e, "failed to record task outcome");
    }
}

#[cfg(test)]
mod tests {
    use super::pressure::FixedMonitor;
    use super::*;
    use crate::db;
    use std::sync::atomic::AtomicU32;

    struct Recording {
        seen: Mutex<Vec<(TaskKind, String)>>,
    }

    #[async_trait]
    impl TaskHandler for Recording {
        async fn handle(&self, kind: TaskKind, target: &str) -> EngineResult<()> {
            self.seen.lock().push((kind, target.to_string()));
            Ok(())
        }
    }

    struct AlwaysTransient {
        calls: AtomicU32,
    }

    #[async_trait]
    impl TaskHandler for AlwaysTransient {
        async fn handle(&self, _kind: TaskKind, _target: &str) -> EngineResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::Transient("model offline".into()))
        }
    }

    struct Batching {
        batches: Mutex<Vec<(TaskKind, usize)>>,
    }

    #[async_trait]
    impl TaskHandler for Batching {
        async fn handle(&self, kind: TaskKind, _target: &str) -> EngineResult<()> {
            self.batches.lock().push((kind, 1));
            Ok(())
        }

        async fn handle_batch(&self, kind: TaskKind, targets: &[String]) -> Vec<EngineResult<()>> {
            self.batches.lock().push((kind, targets.len()));
            targets
                .iter()
                .map(|t| {
                    if t == "bad" {
                        Err(EngineError::Internal("unreadable record".into()))
                    } else {
                        Ok(())
                    }
                })
                .collect()
        }
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            backoff_base_ms: 5,
            backoff_factor: 2,
            poll_interval_ms: 5,
            ..SchedulerConfig::default()
        }
    }

    fn scheduler(config: SchedulerConfig) -> Scheduler {
        let conn = db::shared(db::open_memory_database().unwrap());
        let workers = config.workers.max(1);
        Scheduler::new(conn, config, workers, Arc::new(FixedMonitor::new(0.0)))
    }

    #[test]
    fn backoff_is_exponential() {
        let config = SchedulerConfig::default();
        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(&config, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(&config, 3), Duration::from_secs(16));
    }

    #[test]
    fn duplicate_target_reuses_task() {
        let s = scheduler(fast_config());
        let a = s.submit(TaskKind::Embed, "m1", None).unwrap();
        let b = s.submit(TaskKind::Embed, "m1", None).unwrap();
        let c = s.submit(TaskKind::Index, "m1", None).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(s.queue_depth(), 2);
    }

    #[test]
    fn high_water_mark_rejects() {
        let s = scheduler(SchedulerConfig {
            high_water_mark: 2,
            ..fast_config()
        });
        s.submit(TaskKind::Embed, "m1", None).unwrap();
        s.submit(TaskKind::Embed, "m2", None).unwrap();
        let err = s.submit(TaskKind::Embed, "m3", None).unwrap_err();
        assert!(matches!(err, EngineError::QueueFull { depth: 2, .. }));
    }

    #[test]
    fn cancel_queued_task() {
        let s = scheduler(fast_config());
        let id = s.submit(TaskKind::Consolidate, "*", None).unwrap();
        assert_eq!(s.cancel(&id).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(s.queue_depth(), 0);
        assert!(matches!(s.cancel("nope"), Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn drains_by_priority() {
        let s = scheduler(SchedulerConfig {
            workers: 1,
            ..fast_config()
        });
        s.submit(TaskKind::BuildGraph, "*", None).unwrap();
        s.submit(TaskKind::Embed, "m1", None).unwrap();
        s.submit(TaskKind::Consolidate, "shard", Some(0)).unwrap();

        let recording = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
        });
        let handler: Arc<dyn TaskHandler> = recording.clone();
        let loop_handle = s.start(handler);
        assert!(s.wait_idle(Duration::from_secs(5)).await);
        s.shutdown();
        loop_handle.await.unwrap();

        let seen = recording.seen.lock().clone();
        let kinds: Vec<TaskKind> = seen.iter().map(|(k, _)| *k).collect();
        assert_eq!(
            kinds,
            vec![TaskKind::Consolidate, TaskKind::Embed, TaskKind::BuildGraph]
        );
    }

    #[tokio::test]
    async fn ready_embeds_are_handled_as_one_batch() {
        let s = scheduler(SchedulerConfig {
            min_batch: 8,
            ..fast_config()
        });
        let mut ids = Vec::new();
        for target in ["m1", "m2", "bad", "m4"] {
            ids.push(s.submit(TaskKind::Embed, target, None).unwrap());
        }
        s.submit(TaskKind::Consolidate, "*", None).unwrap();

        let batching = Arc::new(Batching {
            batches: Mutex::new(Vec::new()),
        });
        let handler: Arc<dyn TaskHandler> = batching.clone();
        assert_eq!(s.drain_once(&handler).await, 5);
        assert!(s.wait_idle(Duration::from_secs(5)).await);

        let mut batches = batching.batches.lock().clone();
        batches.sort_by_key(|(kind, _)| kind.as_str());
        assert_eq!(batches, vec![(TaskKind::Consolidate, 1), (TaskKind::Embed, 4)]);
        // per-task outcomes survive the grouping
        assert_eq!(s.status(&ids[0]).unwrap().status, TaskStatus::Done);
        assert_eq!(s.status(&ids[2]).unwrap().status, TaskStatus::Failed);
    }

    #[test]
    fn purge_keeps_recent_and_failed_tasks() {
        let s = scheduler(SchedulerConfig {
            task_retention_hours: 1,
            ..fast_config()
        });
        let done = s.submit(TaskKind::Embed, "m1", None).unwrap();
        let failed = s.submit(TaskKind::Embed, "m2", None).unwrap();
        let fresh = s.submit(TaskKind::Embed, "m3", None).unwrap();
        s.log().update(&done, TaskStatus::Done, None, None).unwrap();
        s.log().update(&failed, TaskStatus::Failed, None, None).unwrap();
        s.log().update(&fresh, TaskStatus::Done, None, None).unwrap();
        {
            let conn = db::lock(&s.log().conn).unwrap();
            conn.execute(
                "UPDATE tasks SET updated_at = '2020-01-01T00:00:00Z' WHERE id IN (?1, ?2)",
                rusqlite::params![done, failed],
            )
            .unwrap();
        }

        assert_eq!(s.purge_finished().unwrap(), 1);
        assert!(matches!(s.status(&done), Err(EngineError::NotFound(_))));
        assert_eq!(s.status(&failed).unwrap().status, TaskStatus::Failed);
        assert_eq!(s.list(TaskStatus::Done, 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn transient_failure_stops_after_max_attempts() {
        let s = scheduler(fast_config());
        let id = s.submit(TaskKind::Embed, "m1", None).unwrap();
        let failing = Arc::new(AlwaysTransient {
            calls: AtomicU32::new(0),
        });
        let handler: Arc<dyn TaskHandler> = failing.clone();
        let loop_handle = s.start(handler);
        assert!(s.wait_idle(Duration::from_secs(5)).await);
        s.shutdown();
        loop_handle.await.unwrap();

        let task = s.status(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 3);
        assert_eq!(failing.calls.load(Ordering::SeqCst), 3);
        assert!(task.last_error.unwrap().contains("model offline"));
    }
}

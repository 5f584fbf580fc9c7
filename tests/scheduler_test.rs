mod helpers;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use memoria::config::SchedulerConfig;
use memoria::error::{EngineError, EngineResult};
use memoria::scheduler::pressure::FixedMonitor;
use memoria::scheduler::{Scheduler, TaskHandler, TaskKind, TaskStatus};

use helpers::{test_conn, IDLE};

struct FlakyModel {
    calls: AtomicU32,
    fail_first: u32,
}

#[async_trait]
impl TaskHandler for FlakyModel {
    async fn handle(&self, _kind: TaskKind, _target: &str) -> EngineResult<()> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.fail_first {
            Err(EngineError::Transient(format!("model offline (call {n})")))
        } else {
            Ok(())
        }
    }
}

struct Noop;

#[async_trait]
impl TaskHandler for Noop {
    async fn handle(&self, _kind: TaskKind, _target: &str) -> EngineResult<()> {
        Ok(())
    }
}

fn fast() -> SchedulerConfig {
    SchedulerConfig {
        backoff_base_ms: 5,
        backoff_factor: 2,
        poll_interval_ms: 5,
        ..SchedulerConfig::default()
    }
}

#[tokio::test]
async fn transient_failures_retry_then_succeed() {
    let s = Scheduler::new(test_conn(), fast(), 2, Arc::new(FixedMonitor::new(0.0)));
    let flaky = Arc::new(FlakyModel {
        calls: AtomicU32::new(0),
        fail_first: 2,
    });
    let handler: Arc<dyn TaskHandler> = flaky.clone();
    let drain = s.start(handler);

    let id = s.submit(TaskKind::Embed, "m1", None).unwrap();
    assert!(s.wait_idle(IDLE).await);
    let task = s.status(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Done);
    assert_eq!(task.attempts, 3);
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);

    s.shutdown();
    drain.await.unwrap();
}

#[tokio::test]
async fn attempts_are_bounded() {
    let s = Scheduler::new(test_conn(), fast(), 2, Arc::new(FixedMonitor::new(0.0)));
    let flaky = Arc::new(FlakyModel {
        calls: AtomicU32::new(0),
        fail_first: u32::MAX,
    });
    let handler: Arc<dyn TaskHandler> = flaky.clone();
    let drain = s.start(handler);

    let id = s.submit(TaskKind::Embed, "m1", None).unwrap();
    assert!(s.wait_idle(IDLE).await);
    let task = s.status(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 3);
    assert!(task.last_error.unwrap().contains("model offline"));
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);

    s.shutdown();
    drain.await.unwrap();
}

#[tokio::test]
async fn batches_shrink_under_pressure() {
    let config = SchedulerConfig {
        min_batch: 2,
        max_batch: 32,
        ..fast()
    };
    let monitor = Arc::new(FixedMonitor::new(0.95));
    let s = Scheduler::new(test_conn(), config, 4, monitor.clone());
    let handler: Arc<dyn TaskHandler> = Arc::new(Noop);

    for i in 0..100 {
        s.submit(TaskKind::Index, &format!("m{i}"), None).unwrap();
    }
    assert_eq!(s.drain_once(&handler).await, 2);
    assert_eq!(s.last_batch_size(), 2);

    monitor.set(0.1);
    let mut sizes = Vec::new();
    for _ in 0..5 {
        s.drain_once(&handler).await;
        sizes.push(s.last_batch_size());
    }
    assert_eq!(sizes, [4, 8, 16, 32, 32]);

    monitor.set(0.9);
    s.drain_once(&handler).await;
    assert_eq!(s.last_batch_size(), 2);

    while s.queue_depth() > 0 {
        s.drain_once(&handler).await;
    }
    assert!(s.wait_idle(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn interrupted_tasks_are_replayed() {
    let conn = test_conn();
    let first = Scheduler::new(conn.clone(), fast(), 1, Arc::new(FixedMonitor::new(0.0)));
    let id = first.submit(TaskKind::Embed, "m1", None).unwrap();
    drop(first);

    let second = Scheduler::new(conn, fast(), 1, Arc::new(FixedMonitor::new(0.0)));
    assert_eq!(second.recover().unwrap(), 1);
    assert_eq!(second.queue_depth(), 1);

    let handler: Arc<dyn TaskHandler> = Arc::new(Noop);
    let drain = second.start(handler);
    assert!(second.wait_idle(IDLE).await);
    assert_eq!(second.status(&id).unwrap().status, TaskStatus::Done);
    second.shutdown();
    drain.await.unwrap();
}

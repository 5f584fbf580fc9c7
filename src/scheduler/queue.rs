//! In-memory ready queue: priority first (0 highest), FIFO within a tier, with a
//! side list of tasks waiting out a retry backoff.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

use super::task::TaskKind;

#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub id: String,
    pub kind: TaskKind,
    pub target: String,
    pub priority: u8,
    /// Attempts already spent on this task.
    pub attempts: u32,
    seq: u64,
}

#[derive(Default)]
pub struct TaskQueue {
    heap: BinaryHeap<Reverse<(u8, u64)>>,
    /// Live entries by sequence number. Cancelled entries leave a stale heap slot.
    live: HashMap<u64, QueuedTask>,
    by_id: HashMap<String, u64>,
    by_target: HashMap<(TaskKind, String), String>,
    delayed: Vec<(Instant, u64)>,
    next_seq: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued tasks, including those waiting out a backoff.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Id of the queued task already covering `(kind, target)`, if any.
    pub fn find(&self, kind: TaskKind, target: &str) -> Option<&str> {
        self.by_target
            .get(&(kind, target.to_string()))
            .map(String::as_str)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn push(
        &mut self,
        id: String,
        kind: TaskKind,
        target: String,
        priority: u8,
        attempts: u32,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.insert(
            QueuedTask {
                id,
                kind,
                target,
                priority,
                attempts,
                seq,
            },
            None,
        );
    }

    /// Re-queue a task that must not run before `ready_at`. It keeps its original
    /// place within its tier once the delay passes.
    pub fn push_delayed(&mut self, task: QueuedTask, ready_at: Instant) {
        self.insert(task, Some(ready_at));
    }

    fn insert(&mut self, task: QueuedTask, ready_at: Option<Instant>) {
        let seq = task.seq;
        self.by_id.insert(task.id.clone(), seq);
        self.by_target
            .insert((task.kind, task.target.clone()), task.id.clone());
        match ready_at {
            Some(at) => self.delayed.push((at, seq)),
            None => self.heap.push(Reverse((task.priority, seq))),
        }
        self.live.insert(seq, task);
    }

    /// Pop up to `max` runnable tasks in priority order.
    pub fn pop_ready(&mut self, max: usize, now: Instant) -> Vec<QueuedTask> {
        let mut still_waiting = Vec::with_capacity(self.delayed.len());
        for (at, seq) in self.delayed.drain(..) {
            if at <= now {
                if let Some(task) = self.live.get(&seq) {
                    self.heap.push(Reverse((task.priority, seq)));
                }
            } else {
                still_waiting.push((at, seq));
            }
        }
        self.delayed = still_waiting;

        let mut out = Vec::new();
        while out.len() < max {
            let Some(Reverse((_, seq))) = self.heap.pop() else {
                break;
            };
            if let Some(task) = self.remove_seq(seq) {
                out.push(task);
            }
        }
        out
    }

    /// Remove a queued task. Returns whether it was present.
    pub fn cancel(&mut self, id: &str) -> bool {
        match self.by_id.get(id).copied() {
            Some(seq) => {
                self.remove_seq(seq);
                self.delayed.retain(|(_, s)| *s != seq);
                true
            }
            None => false,
        }
    }

    fn remove_seq(&mut self, seq: u64) -> Option<QueuedTask> {
        let task = self.live.remove(&seq)?;
        self.by_id.remove(&task.id);
        let key = (task.kind, task.target.clone());
        if self.by_target.get(&key) == Some(&task.id) {
            self.by_target.remove(&key);
        }
        Some(task)
    }

    /// Earliest instant a delayed task becomes runnable.
    pub fn next_ready_at(&self) -> Option<Instant> {
        self.delayed.iter().map(|(at, _)| *at).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ids(tasks: Vec<QueuedTask>) -> Vec<String> {
        tasks.into_iter().map(|t| t.id).collect()
    }

    #[test]
    fn priority_then_fifo() {
        let mut q = TaskQueue::new();
        q.push("low".into(), TaskKind::BuildGraph, "*".into(), 3, 0);
        q.push("a".into(), TaskKind::Embed, "m1".into(), 1, 0);
        q.push("urgent".into(), TaskKind::Consolidate, "s".into(), 0, 0);
        q.push("b".into(), TaskKind::Embed, "m2".into(), 1, 0);

        let popped = ids(q.pop_ready(10, Instant::now()));
        assert_eq!(popped, vec!["urgent", "a", "b", "low"]);
        assert!(q.is_empty());
    }

    #[test]
    fn pop_respects_batch_size() {
        let mut q = TaskQueue::new();
        for i in 0..5 {
            q.push(format!("t{i}"), TaskKind::Embed, format!("m{i}"), 1, 0);
        }
        assert_eq!(q.pop_ready(2, Instant::now()).len(), 2);
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn cancel_removes_task_and_target() {
        let mut q = TaskQueue::new();
        q.push("a".into(), TaskKind::Embed, "m1".into(), 1, 0);
        assert_eq!(q.find(TaskKind::Embed, "m1"), Some("a"));
        assert!(q.cancel("a"));
        assert!(!q.cancel("a"));
        assert!(q.find(TaskKind::Embed, "m1").is_none());
        assert!(q.pop_ready(10, Instant::now()).is_empty());
    }

    #[test]
    fn delayed_tasks_wait() {
        let mut q = TaskQueue::new();
        q.push("a".into(), TaskKind::Embed, "m1".into(), 1, 0);
        let task = q.pop_ready(1, Instant::now()).remove(0);

        let now = Instant::now();
        q.push_delayed(task, now + Duration::from_secs(5));
        assert_eq!(q.len(), 1);
        assert!(q.pop_ready(10, now).is_empty());
        assert_eq!(ids(q.pop_ready(10, now + Duration::from_secs(6))), vec!["a"]);
    }
}

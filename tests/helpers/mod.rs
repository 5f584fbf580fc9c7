#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use memoria::config::MemoriaConfig;
use memoria::db::{self, SharedConn};
use memoria::embedding::hashing::HashEmbedder;
use memoria::scheduler::pressure::FixedMonitor;
use memoria::Engine;

pub const DIMS: usize = 64;
pub const MODEL: &str = "hash-v1";
pub const IDLE: Duration = Duration::from_secs(10);

/// Defaults tuned for tests: no snapshots, two workers, fast polling and backoff.
pub fn test_config() -> MemoriaConfig {
    let mut config = MemoriaConfig::default();
    config.storage.index_dir = String::new();
    config.embedding.dimensions = DIMS;
    config.scheduler.workers = 2;
    config.scheduler.poll_interval_ms = 5;
    config.scheduler.backoff_base_ms = 5;
    config.scheduler.backoff_factor = 2;
    config
}

/// Fresh in-memory database with schema and migrations applied.
pub fn test_conn() -> SharedConn {
    db::shared(db::open_memory_database().unwrap())
}

pub fn engine_with(config: MemoriaConfig, conn: SharedConn) -> Engine {
    Engine::from_parts(
        config,
        conn,
        Arc::new(HashEmbedder::new(MODEL, DIMS)),
        Arc::new(FixedMonitor::new(0.0)),
    )
    .unwrap()
}

/// In-memory engine with workers running.
pub fn test_engine() -> Engine {
    let engine = engine_with(test_config(), test_conn());
    engine.start_workers();
    engine
}

/// Unit vector along `axis`.
pub fn axis(axis: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    v[axis % DIMS] = 1.0;
    v
}

/// Deterministic pseudo-random unit vector.
pub fn seeded_vector(seed: u64) -> Vec<f32> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    let mut v: Vec<f32> = (0..DIMS)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((state >> 33) as f32 / (1u64 << 31) as f32) - 0.5
        })
        .collect();
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    for x in &mut v {
        *x /= norm;
    }
    v
}

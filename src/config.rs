use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::memory::partition::TimeBucket;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct MemoriaConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub scheduler: SchedulerConfig,
    pub index: IndexConfig,
    pub retrieval: RetrievalConfig,
    pub graph: GraphConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub log_level: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    /// Directory for per-shard index snapshots. Empty disables snapshots.
    pub index_dir: String,
    pub default_user: String,
    pub max_text_len: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `hash` (local, deterministic) or `http` (OpenAI-compatible endpoint).
    pub provider: String,
    pub model: String,
    pub endpoint: String,
    /// Name of the environment variable holding the API key for `http`.
    pub api_key_env: String,
    pub dimensions: usize,
    pub batch_size: usize,
    pub timeout_secs: u64,
    pub cache_capacity: usize,
    pub cache_ttl_secs: u64,
    pub cache_shards: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker permits. `0` means one per available core.
    pub workers: usize,
    pub min_batch: usize,
    pub max_batch: usize,
    pub high_water_mark: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_factor: u32,
    pub poll_interval_ms: u64,
    /// Utilization at or above which batches shrink to `min_batch`.
    pub high_pressure: f64,
    /// Utilization at or below which batches grow toward `max_batch`.
    pub low_pressure: f64,
    /// Done and cancelled rows older than this are purged from the task log.
    /// `0` keeps them forever.
    pub task_retention_hours: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IndexConfig {
    pub time_bucket: TimeBucket,
    pub max_degree: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    /// Shards with fewer nodes than this are scanned exactly.
    pub exact_search_below: usize,
    pub consolidation: ConsolidationConfig,
}

/// Tunable consolidation policy. Both size and age participate; neither has a
/// canonical threshold, so every knob is configurable.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ConsolidationConfig {
    pub small_shard_size: usize,
    pub merge_after_days: i64,
    pub max_pending: usize,
    pub max_tombstone_ratio: f64,
    pub interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub similarity_weight: f64,
    pub recency_weight: f64,
    pub importance_weight: f64,
    pub recency_half_life_hours: f64,
    pub default_k: usize,
    pub default_token_budget: usize,
    pub deadline_ms: u64,
    pub candidate_multiplier: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GraphConfig {
    pub max_depth: usize,
    pub strength_prior: f64,
    pub max_suggestions: usize,
    pub rebuild_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            host: "127.0.0.1".into(),
            port: 7420,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let dir = default_memoria_dir();
        Self {
            db_path: dir.join("memory.db").to_string_lossy().into_owned(),
            index_dir: dir.join("index").to_string_lossy().into_owned(),
            default_user: "default".into(),
            max_text_len: 8192,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hash".into(),
            model: "hash-v1".into(),
            endpoint: "http://127.0.0.1:11434/v1".into(),
            api_key_env: "MEMORIA_EMBEDDING_KEY".into(),
            dimensions: 384,
            batch_size: 32,
            timeout_secs: 10,
            cache_capacity: 10_000,
            cache_ttl_secs: 3600,
            cache_shards: 16,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            min_batch: 1,
            max_batch: 32,
            high_water_mark: 10_000,
            max_attempts: 3,
            backoff_base_ms: 1000,
            backoff_factor: 4,
            poll_interval_ms: 250,
            high_pressure: 0.8,
            low_pressure: 0.3,
            task_retention_hours: 168,
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            time_bucket: TimeBucket::Week,
            max_degree: 16,
            ef_construction: 64,
            ef_search: 48,
            exact_search_below: 256,
            consolidation: ConsolidationConfig::default(),
        }
    }
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            small_shard_size: 32,
            merge_after_days: 90,
            max_pending: 512,
            max_tombstone_ratio: 0.2,
            interval_secs: 600,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            similarity_weight: 0.6,
            recency_weight: 0.2,
            importance_weight: 0.2,
            recency_half_life_hours: 168.0,
            default_k: 8,
            default_token_budget: 2000,
            deadline_ms: 250,
            candidate_multiplier: 3,
        }
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            strength_prior: 2.0,
            max_suggestions: 3,
            rebuild_interval_secs: 900,
        }
    }
}

/// Returns `~/.memoria/`, or `./.memoria` when no home directory is available.
pub fn default_memoria_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".memoria")
}

/// Returns the default config file path: `~/.memoria/config.toml`
pub fn default_config_path() -> PathBuf {
    default_memoria_dir().join("config.toml")
}

impl MemoriaConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            MemoriaConfig::default()
        };

        config.apply_env_overrides();
        config.graph.max_depth = config.graph.max_depth.clamp(1, 3);
        Ok(config)
    }

    /// Apply environment variable overrides
    /// (MEMORIA_DB, MEMORIA_USER, MEMORIA_LOG_LEVEL, MEMORIA_EMBEDDING_URL).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MEMORIA_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("MEMORIA_USER") {
            self.storage.default_user = val;
        }
        if let Ok(val) = std::env::var("MEMORIA_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("MEMORIA_EMBEDDING_URL") {
            self.embedding.endpoint = val;
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }

    /// Resolve the snapshot directory, or `None` when snapshots are disabled.
    pub fn resolved_index_dir(&self) -> Option<PathBuf> {
        if self.storage.index_dir.is_empty() {
            None
        } else {
            Some(expand_tilde(&self.storage.index_dir))
        }
    }

    /// Worker count with `0` resolved to the available parallelism.
    pub fn worker_count(&self) -> usize {
        if self.scheduler.workers > 0 {
            self.scheduler.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        }
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

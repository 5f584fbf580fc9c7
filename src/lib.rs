//! Personal memory and reasoning engine.
//!
//! Memoria stores short personal records (medications, habits, finances, voice
//! notes, camera captions, chat, documents), embeds them in the background, and
//! serves ranked, token-budgeted retrieval plus simple reasoning over a knowledge
//! graph derived from the records.
//!
//! # Architecture
//!
//! - **Storage**: SQLite record table, the single source of truth. Everything else
//!   can be regenerated from it.
//! - **Embeddings**: pluggable providers (local feature hashing, or any
//!   OpenAI-compatible endpoint) behind a sharded LRU cache with TTL.
//! - **Scheduler**: durable, prioritized task log with bounded retries and batch
//!   sizes that follow CPU and memory pressure.
//! - **Index**: one approximate nearest neighbour graph per `user/source/time`
//!   partition, updated copy-on-write, consolidated and verified against the store.
//! - **Retrieval**: similarity, recency and importance blended into one score and
//!   packed under a token budget within a deadline.
//! - **Knowledge graph**: entities and evidence-weighted relationships extracted
//!   from records, traversed to a bounded depth.
//!
//! # Modules
//!
//! - [`config`]: TOML configuration with environment overrides
//! - [`db`]: SQLite setup, schema, migrations and health checks
//! - [`memory`]: record types, partition keys and the record store
//! - [`embedding`]: providers, cache and the embedding pipeline
//! - [`scheduler`]: background task scheduling
//! - [`index`]: the partitioned similarity index
//! - [`retrieval`]: ranking and token-budget packing
//! - [`graph`]: extraction, graph storage and reasoning
//! - [`engine`]: the facade tying it all together
//! - [`server`]: HTTP API

pub mod cli;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod graph;
pub mod index;
pub mod memory;
pub mod retrieval;
pub mod scheduler;
pub mod server;

pub use engine::Engine;
pub use error::{EngineError, EngineResult};

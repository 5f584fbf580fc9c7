//! CLI `doctor` command: database diagnostics plus an index consistency pass.

use anyhow::{Context, Result};

use super::format_bytes;
use crate::config::MemoriaConfig;
use crate::db;
use crate::Engine;

pub async fn doctor(config: &MemoriaConfig) -> Result<()> {
    let db_path = config.resolved_db_path();

    if !db_path.exists() {
        println!("Database: not found at {}", db_path.display());
        println!("Run `memoria serve` or `memoria ingest` to initialize.");
        return Ok(());
    }

    let file_size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);
    let report = {
        let conn = db::open_database(&db_path).context("failed to open database (may be corrupt)")?;
        db::check_database_health(&conn).context("failed to run health check")?
    };

    println!("Memoria Health Report");
    println!("=====================");
    println!();
    println!("Database:          {}", db_path.display());
    println!("File size:         {}", format_bytes(file_size));
    println!("Schema version:    {}", report.schema_version);
    println!();
    println!("Embedding model:");
    println!("  Stored:          {}", report.embedding_model.as_deref().unwrap_or("(not set)"));
    println!("  Configured:      {}", config.embedding.model);
    if let Some(ref stored) = report.embedding_model {
        if stored != &config.embedding.model {
            println!("  WARNING: model mismatch. Records are re-embedded on the next start.");
        } else {
            println!("  Status:          OK (match)");
        }
    }
    println!();
    println!("Row counts:");
    println!("  Memories:        {}", report.memory_count);
    println!("  Tombstoned:      {}", report.tombstoned_count);
    println!("  Unembedded:      {}", report.unembedded_count);
    println!("  Entities:        {}", report.entity_count);
    println!("  Relationships:   {}", report.relationship_count);
    println!("  Pending tasks:   {}", report.pending_tasks);
    println!("  Failed tasks:    {}", report.failed_tasks);
    println!();
    if report.integrity_ok {
        println!("Integrity check:   PASSED");
    } else {
        println!("Integrity check:   FAILED ({})", report.integrity_details);
        println!();
        println!("Recovery steps:");
        println!("  1. Restore from a backup: cp backup.db {}", db_path.display());
        println!("  2. Then run `memoria rebuild` to regenerate the index.");
        return Ok(());
    }

    let engine = Engine::open(config.clone())?;
    let consolidation = engine.consolidate().await?;
    let health = engine.index_health();
    println!();
    println!("Index:");
    println!("  Shards:          {}", health.shard_count);
    println!("  Partitions:      {}", health.partition_count);
    println!("  Nodes:           {}", health.total_nodes);
    println!("  Pending:         {}", health.total_pending);
    println!("  Verified:        {}", consolidation.verified);
    if consolidation.inconsistent.is_empty() {
        println!("  Consistency:     OK");
    } else {
        println!(
            "  Consistency:     repaired {} shard(s): {}",
            consolidation.inconsistent.len(),
            consolidation.inconsistent.join(", ")
        );
    }
    engine.shutdown().await;
    Ok(())
}

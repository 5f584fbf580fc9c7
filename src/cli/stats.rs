use anyhow::Result;

use super::format_bytes;
use crate::config::MemoriaConfig;
use crate::Engine;

/// Display memory, index and scheduler statistics.
pub async fn stats(config: &MemoriaConfig, json: bool) -> Result<()> {
    let engine = Engine::open(config.clone())?;
    let stats = engine.stats().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        engine.shutdown().await;
        return Ok(());
    }

    println!("Memory Statistics");
    println!("{}", "=".repeat(40));
    println!("  Total memories:      {}", stats.store.total);
    println!("  Active:              {}", stats.store.active);
    println!("  Tombstoned:          {}", stats.store.tombstoned);
    println!("  Awaiting embedding:  {}", stats.store.unembedded);
    println!();

    println!("By Source:");
    for (source, count) in &stats.store.by_source {
        println!("  {:<12} {}", source, count);
    }
    println!();

    println!("Index:");
    println!("  Shards:              {}", stats.index.shard_count);
    println!("  Nodes:               {}", stats.index.total_nodes);
    println!("  Pending:             {}", stats.index.total_pending);
    println!("  Stale shards:        {}", stats.index.stale_shards);
    println!();

    let partitions = engine.partition_stats().await?;
    if !partitions.is_empty() {
        println!("Partitions:");
        for p in &partitions {
            println!(
                "  {:<36} {:>6} records  {:>9}",
                p.partition_key.as_str(),
                p.count,
                format_bytes(p.vector_bytes)
            );
        }
        println!();
    }

    println!("Tasks:");
    for (status, count) in &stats.scheduler.by_status {
        println!("  {:<12} {}", status, count);
    }
    println!();
    println!("Knowledge graph:       {} entities, {} relationships", stats.graph.entities, stats.graph.relationships);
    println!("Embedding model:       {}", stats.embedding_model);

    if let Some(ref oldest) = stats.store.oldest {
        println!("Oldest memory:         {oldest}");
    }
    if let Some(ref newest) = stats.store.newest {
        println!("Newest memory:         {newest}");
    }

    engine.shutdown().await;
    Ok(())
}

use anyhow::Result;

use crate::config::MemoriaConfig;
use crate::Engine;

/// Rebuild every index shard from the record table, then optionally run the
/// consolidation policy and re-extract the knowledge graph.
pub async fn rebuild(config: &MemoriaConfig, consolidate: bool, graph: bool) -> Result<()> {
    let engine = Engine::open(config.clone())?;

    let rebuilt = engine.rebuild_index().await?;
    println!("Rebuilt {rebuilt} shard(s).");

    if consolidate {
        let report = engine.consolidate().await?;
        println!(
            "Consolidation: {} action(s), {} shard(s) verified, {} repaired.",
            report.actions.len(),
            report.verified,
            report.inconsistent.len()
        );
    }
    if graph {
        let report = engine.build_graph().await?;
        println!(
            "Knowledge graph: {} memories contributed, {} new evidence.",
            report.memories, report.new_evidence
        );
    }

    engine.shutdown().await;
    Ok(())
}

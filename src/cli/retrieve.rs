use anyhow::Result;

use super::open_drained;
use crate::config::MemoriaConfig;
use crate::retrieval::RetrieveRequest;

/// Run a ranked retrieval from the terminal.
pub async fn retrieve(config: &MemoriaConfig, request: RetrieveRequest, json: bool) -> Result<()> {
    let engine = open_drained(config).await?;
    let response = engine.retrieve(request).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else if response.results.is_empty() {
        println!("No results found.");
    } else {
        println!(
            "Found {} result(s) from {} candidate(s) (token estimate: ~{}){}\n",
            response.results.len(),
            response.total_candidates,
            response.token_estimate,
            if response.degraded { " [degraded]" } else { "" }
        );
        for (i, r) in response.results.iter().enumerate() {
            println!(
                "{}. [{}] score={:.3} sim={:.3} importance={:.2}  {}",
                i + 1,
                r.source,
                r.score,
                r.similarity,
                r.importance,
                r.created_at.format("%Y-%m-%d %H:%M")
            );
            println!("   {}", r.text);
            println!("   id: {}", r.id);
            println!();
        }
    }
    engine.shutdown().await;
    Ok(())
}

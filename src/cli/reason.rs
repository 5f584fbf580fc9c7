use anyhow::{bail, Result};

use super::open_drained;
use crate::config::MemoriaConfig;

/// Explain an entity given its id (`ent_…`) or its label.
pub async fn reason(config: &MemoriaConfig, entity: &str, json: bool) -> Result<()> {
    let engine = open_drained(config).await?;

    let id = if entity.starts_with("ent_") {
        entity.to_string()
    } else {
        let matches = engine.find_entity(entity).await?;
        match matches.as_slice() {
            [] => bail!("no entity labelled {entity:?}"),
            [only] => only.id.clone(),
            [first, rest @ ..] => {
                eprintln!(
                    "{} entities share that label; using {} ({}). Others: {}",
                    matches.len(),
                    first.id,
                    first.entity_type,
                    rest.iter().map(|e| e.id.as_str()).collect::<Vec<_>>().join(", ")
                );
                first.id.clone()
            }
        }
    };

    let reasoning = engine.reason(&id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&reasoning)?);
        engine.shutdown().await;
        return Ok(());
    }

    println!("{} ({})", reasoning.entity.label, reasoning.entity.entity_type);
    println!();
    if reasoning.relationships.is_empty() {
        println!("No direct relationships.");
    } else {
        println!("Relationships:");
        for edge in &reasoning.relationships {
            println!(
                "  {} {}  strength={:.2} evidence={}",
                edge.relation, edge.target.label, edge.strength, edge.evidence_count
            );
        }
    }
    if !reasoning.impacts.is_empty() {
        println!();
        println!("Reachable:");
        for impact in &reasoning.impacts {
            let path: Vec<&str> = impact.path.iter().map(|r| r.as_str()).collect();
            println!(
                "  {} (depth {}, strength {:.2}) via {}",
                impact.entity.label,
                impact.depth,
                impact.strength,
                path.join(" -> ")
            );
        }
    }
    if !reasoning.suggested_actions.is_empty() {
        println!();
        println!("Suggestions:");
        for action in &reasoning.suggested_actions {
            println!("  - {}", action.action);
        }
    }

    engine.shutdown().await;
    Ok(())
}

use anyhow::{Context, Result};

use super::drain;
use crate::config::MemoriaConfig;
use crate::memory::types::{NewMemory, Source};
use crate::Engine;

pub struct IngestArgs {
    pub text: String,
    pub source: Source,
    pub user: Option<String>,
    pub importance: Option<f64>,
    /// `key=value` pairs.
    pub metadata: Vec<String>,
    pub wait: bool,
}

/// Store one memory and, unless told otherwise, wait for it to be embedded and
/// indexed before exiting.
pub async fn ingest(config: &MemoriaConfig, args: IngestArgs) -> Result<()> {
    let mut new = NewMemory::new(args.text, args.source);
    if let Some(user) = args.user {
        new = new.with_user(user);
    }
    if let Some(importance) = args.importance {
        new = new.with_importance(importance);
    }
    for pair in &args.metadata {
        let (key, value) = parse_pair(pair)?;
        new = new.with_metadata(key, value);
    }

    let engine = Engine::open(config.clone())?;
    let receipt = engine.ingest(new).await.context("ingest rejected")?;
    println!("Stored {} in {}", receipt.id, receipt.partition_key);

    if args.wait {
        engine.start_workers();
        drain(&engine).await;
        if let Some(task_id) = receipt.task_id {
            let task = engine.task_status(&task_id)?;
            println!("Embedding task {}: {}", task.id, task.status);
        }
    }
    engine.shutdown().await;
    Ok(())
}

fn parse_pair(pair: &str) -> Result<(&str, &str)> {
    let (key, value) = pair
        .split_once('=')
        .with_context(|| format!("metadata must be key=value, got {pair:?}"))?;
    anyhow::ensure!(!key.trim().is_empty(), "metadata key must not be empty");
    Ok((key.trim(), value.trim()))
}

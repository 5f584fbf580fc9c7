use anyhow::Result;

use crate::config::MemoriaConfig;
use crate::scheduler::{Task, TaskStatus};
use crate::Engine;

pub async fn status(config: &MemoriaConfig, id: &str) -> Result<()> {
    let engine = Engine::open(config.clone())?;
    let task = engine.task_status(id)?;
    print_task(&task);
    engine.shutdown().await;
    Ok(())
}

pub async fn cancel(config: &MemoriaConfig, id: &str) -> Result<()> {
    let engine = Engine::open(config.clone())?;
    let task = engine.cancel_task(id)?;
    print_task(&task);
    engine.shutdown().await;
    Ok(())
}

pub async fn list(config: &MemoriaConfig, status: TaskStatus, limit: usize) -> Result<()> {
    let engine = Engine::open(config.clone())?;
    let tasks = engine.list_tasks(status, limit)?;
    if tasks.is_empty() {
        println!("No {status} tasks.");
    }
    for task in &tasks {
        println!(
            "{}  {:<11} {:<40} attempts {}  {}",
            task.id,
            task.kind.as_str(),
            task.target,
            task.attempts,
            task.last_error.as_deref().unwrap_or("")
        );
    }
    engine.shutdown().await;
    Ok(())
}

pub async fn purge(config: &MemoriaConfig) -> Result<()> {
    let engine = Engine::open(config.clone())?;
    let purged = engine.scheduler().purge_finished()?;
    println!("Purged {purged} finished tasks.");
    engine.shutdown().await;
    Ok(())
}

fn print_task(task: &Task) {
    println!("Task {}", task.id);
    println!("  Kind:        {}", task.kind);
    println!("  Target:      {}", task.target);
    println!("  Status:      {}", task.status);
    println!("  Attempts:    {}", task.attempts);
    println!("  Priority:    {}", task.priority);
    if let Some(ref err) = task.last_error {
        println!("  Last error:  {err}");
    }
    println!("  Updated:     {}", task.updated_at);
}

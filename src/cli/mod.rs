//! Terminal commands. Each opens its own [`Engine`] against the configured
//! database, does one thing and shuts the engine down again.

pub mod doctor;
pub mod ingest;
pub mod reason;
pub mod rebuild;
pub mod retrieve;
pub mod stats;
pub mod task;

use std::time::Duration;

use anyhow::Result;

use crate::config::MemoriaConfig;
use crate::Engine;

/// How long a one-shot command waits for queued work before giving up.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(120);

/// Open the engine and work off whatever the task log still holds, so the command
/// sees an up to date index.
pub(crate) async fn open_drained(config: &MemoriaConfig) -> Result<Engine> {
    let engine = Engine::open(config.clone())?;
    engine.start_workers();
    engine.reconcile()?;
    drain(&engine).await;
    Ok(engine)
}

pub(crate) async fn drain(engine: &Engine) {
    if !engine.wait_idle(DRAIN_TIMEOUT).await {
        eprintln!(
            "warning: {} task(s) still queued after {}s; they resume on the next start",
            engine.scheduler().queue_depth(),
            DRAIN_TIMEOUT.as_secs()
        );
    }
}

pub(crate) fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }
}

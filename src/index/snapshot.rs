//! On-disk shard artifacts.
//!
//! Each shard is written as one JSON file under the index directory. Artifacts are
//! a cache: a missing, unreadable or out-of-date file is simply rebuilt from the
//! record table.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::ann::AnnGraph;
use super::shard::{PendingEntry, Shard, ShardId};
use crate::memory::partition::PartitionKey;
use crate::memory::IdChecksum;

#[derive(Serialize, Deserialize)]
pub struct ShardSnapshot {
    pub shard_id: ShardId,
    pub partitions: BTreeSet<PartitionKey>,
    pub last_consolidated: Option<DateTime<Utc>>,
    pub checksum: IdChecksum,
    pub graph: AnnGraph,
    pub pending: Vec<PendingEntry>,
}

impl ShardSnapshot {
    pub fn capture(shard: &Shard) -> Self {
        Self {
            shard_id: shard.id().to_string(),
            partitions: shard.partitions().into_iter().collect(),
            last_consolidated: shard.last_consolidated(),
            checksum: shard.checksum(),
            graph: (*shard.graph()).clone(),
            pending: shard.pending_snapshot(),
        }
    }

    /// Turn a loaded artifact back into a live shard.
    pub fn restore(self) -> Shard {
        let mut graph = self.graph;
        graph.reindex();
        let shard = Shard::with_graph(
            self.shard_id,
            *graph.params(),
            graph,
            self.partitions,
            self.last_consolidated,
        );
        for entry in self.pending {
            shard.push_pending(entry);
        }
        shard
    }
}

/// File name for a shard: readable prefix plus a hash so distinct ids never collide.
pub fn snapshot_path(dir: &Path, shard_id: &str) -> PathBuf {
    let readable: String = shard_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    let digest = Sha256::digest(shard_id.as_bytes());
    let suffix: String = digest[..4].iter().map(|b| format!("{b:02x}")).collect();
    dir.join(format!("{readable}-{suffix}.json"))
}

/// Write atomically: temp file then rename.
pub fn save(dir: &Path, snapshot: &ShardSnapshot) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create index directory {}", dir.display()))?;
    let path = snapshot_path(dir, &snapshot.shard_id);
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_vec(snapshot).context("failed to serialize shard")?;
    std::fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, &path)
        .with_context(|| format!("failed to move snapshot into {}", path.display()))?;
    Ok(path)
}

/// Every readable artifact in `dir`. Unreadable files are logged and skipped.
pub fn load_all(dir: &Path) -> Result<Vec<ShardSnapshot>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read index directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    for path in paths {
        let parsed = std::fs::read(&path)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| serde_json::from_slice::<ShardSnapshot>(&bytes).map_err(Into::into));
        match parsed {
            Ok(snapshot) => out.push(snapshot),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "discarding unreadable shard snapshot");
            }
        }
    }
    Ok(out)
}

pub fn remove(dir: &Path, shard_id: &str) {
    let path = snapshot_path(dir, shard_id);
    if path.exists() {
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove shard snapshot");
        }
    }
}

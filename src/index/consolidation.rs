//! Consolidation policy.
//!
//! Deciding what to do is kept apart from doing it: [`plan`] looks at a summary of
//! every shard and returns the actions to take. Both the size and the age of a shard
//! participate, each behind its own knob in [`ConsolidationConfig`].

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::shard::{Shard, ShardId};
use crate::config::ConsolidationConfig;
use crate::memory::partition::PartitionKey;

const ARCHIVE_SUFFIX: &str = "archive";

/// Shard id that aged partitions of one `(user, source)` lineage are merged into.
pub fn archive_shard_id(lineage: &str) -> ShardId {
    format!("{lineage}/{ARCHIVE_SUFFIX}")
}

pub fn is_archive(shard_id: &str) -> bool {
    shard_id.ends_with(&format!("/{ARCHIVE_SUFFIX}"))
}

/// What the policy needs to know about one shard.
#[derive(Debug, Clone)]
pub struct ShardView {
    pub id: ShardId,
    pub live: usize,
    pub pending: usize,
    pub tombstone_ratio: f64,
    pub partitions: Vec<PartitionKey>,
}

impl ShardView {
    pub fn of(shard: &Shard) -> Self {
        Self {
            id: shard.id().to_string(),
            live: shard.live_count(),
            pending: shard.pending_len(),
            tombstone_ratio: shard.tombstone_ratio(),
            partitions: shard.partitions(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Rebuild { shard: ShardId, reason: String },
    Merge { sources: Vec<ShardId>, into: ShardId },
}

fn single_lineage(partitions: &[PartitionKey]) -> Option<String> {
    let first = partitions.first()?.lineage();
    partitions
        .iter()
        .all(|p| p.lineage() == first)
        .then_some(first)
}

fn is_aged(partitions: &[PartitionKey], cutoff: DateTime<Utc>) -> bool {
    !partitions.is_empty()
        && partitions.iter().all(|p| {
            p.bucket_bounds()
                .map(|(_, end)| end <= cutoff)
                .unwrap_or(false)
        })
}

/// Decide which shards to rebuild and which to merge.
///
/// A shard is merged when it holds fewer than `small_shard_size` live records and
/// every bucket it covers ended more than `merge_after_days` ago; merges are per
/// `(user, source)` lineage and only happen when at least two shards would be
/// combined (counting an existing archive). Any other shard is rebuilt when its
/// pending buffer exceeds `max_pending` or its tombstone share exceeds
/// `max_tombstone_ratio`.
pub fn plan(views: &[ShardView], policy: &ConsolidationConfig, now: DateTime<Utc>) -> Vec<Action> {
    let cutoff = now - Duration::days(policy.merge_after_days.max(0));
    let mut merge_groups: BTreeMap<String, Vec<ShardId>> = BTreeMap::new();
    let mut merging: Vec<&str> = Vec::new();

    for view in views {
        if is_archive(&view.id) || view.live >= policy.small_shard_size {
            continue;
        }
        if !is_aged(&view.partitions, cutoff) {
            continue;
        }
        if let Some(lineage) = single_lineage(&view.partitions) {
            merge_groups.entry(lineage).or_default().push(view.id.clone());
        }
    }

    let mut actions = Vec::new();
    for (lineage, mut sources) in merge_groups {
        let into = archive_shard_id(&lineage);
        let archive_exists = views.iter().any(|v| v.id == into);
        if sources.len() + usize::from(archive_exists) < 2 {
            continue;
        }
        sources.sort();
        merging.extend(views.iter().filter(|v| sources.contains(&v.id)).map(|v| v.id.as_str()));
        actions.push(Action::Merge { sources, into });
    }

    for view in views {
        if merging.contains(&view.id.as_str()) {
            continue;
        }
        let reason = if view.pending > policy.max_pending {
            Some(format!("{} pending entries", view.pending))
        } else if view.tombstone_ratio > policy.max_tombstone_ratio {
            Some(format!("tombstone ratio {:.2}", view.tombstone_ratio))
        } else {
            None
        };
        if let Some(reason) = reason {
            actions.push(Action::Rebuild {
                shard: view.id.clone(),
                reason,
            });
        }
    }
    actions
}

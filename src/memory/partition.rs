//! Deterministic partition assignment.
//!
//! A partition key is `{user}/{source}/{bucket}`. It is computed once when a record
//! is created and stored alongside it, so re-deriving it later (for example with a
//! different bucket setting) never moves an existing record.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};

use super::types::Source;

/// Width of the time bucket used in partition keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeBucket {
    Day,
    Week,
    Month,
}

impl TimeBucket {
    /// Bucket label for an instant: `2026-10-16`, `2026-W42`, or `2026-10`.
    pub fn label(&self, at: DateTime<Utc>) -> String {
        match self {
            Self::Day => at.format("%Y-%m-%d").to_string(),
            Self::Week => {
                let week = at.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
            Self::Month => at.format("%Y-%m").to_string(),
        }
    }
}

/// The user as it appears in a key. '/' is the separator, so it is replaced.
pub fn user_segment(user: &str) -> String {
    user.trim().replace('/', "_")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(String);

impl PartitionKey {
    pub fn derive(user: &str, source: Source, at: DateTime<Utc>, bucket: TimeBucket) -> Self {
        Self(format!(
            "{}/{}/{}",
            user_segment(user),
            source.as_str(),
            bucket.label(at)
        ))
    }

    /// Wrap a key read back from storage.
    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn user(&self) -> &str {
        self.0.split('/').next().unwrap_or_default()
    }

    pub fn source(&self) -> Option<Source> {
        self.0.split('/').nth(1).and_then(|s| s.parse().ok())
    }

    pub fn bucket(&self) -> &str {
        self.0.split('/').nth(2).unwrap_or_default()
    }

    /// `{user}/{source}`, the grouping consolidation merges within.
    pub fn lineage(&self) -> String {
        match self.0.rsplit_once('/') {
            Some((head, _)) => head.to_string(),
            None => self.0.clone(),
        }
    }

    /// Half-open `[start, end)` interval covered by the bucket, if parseable.
    pub fn bucket_bounds(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let (start, end) = parse_bucket(self.bucket())?;
        let to_utc = |d: NaiveDate| d.and_hms_opt(0, 0, 0).map(|n| Utc.from_utc_datetime(&n));
        Some((to_utc(start)?, to_utc(end)?))
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn parse_bucket(label: &str) -> Option<(NaiveDate, NaiveDate)> {
    if let Some((year, week)) = label.split_once("-W") {
        let year: i32 = year.parse().ok()?;
        let week: u32 = week.parse().ok()?;
        let start = NaiveDate::from_isoywd_opt(year, week, Weekday::Mon)?;
        return Some((start, start + Duration::days(7)));
    }
    let parts: Vec<&str> = label.split('-').collect();
    match parts.as_slice() {
        [y, m, d] => {
            let start = NaiveDate::from_ymd_opt(y.parse().ok()?, m.parse().ok()?, d.parse().ok()?)?;
            Some((start, start + Duration::days(1)))
        }
        [y, m] => {
            let (year, month): (i32, u32) = (y.parse().ok()?, m.parse().ok()?);
            let start = NaiveDate::from_ymd_opt(year, month, 1)?;
            let end = if month == 12 {
                NaiveDate::from_ymd_opt(year + 1, 1, 1)?
            } else {
                NaiveDate::from_ymd_opt(year, month + 1, 1)?
            };
            Some((start, end))
        }
        _ => None,
    }
}

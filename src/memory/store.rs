//! Record table access.
//!
//! [`MemoryStore`] is the only writer of the `memories` table. After creation a
//! record changes in exactly three ways: its importance is recomputed, its embedding
//! is filled by the pipeline, or it is tombstoned. Nothing is physically removed.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::partition::{PartitionKey, TimeBucket};
use super::types::{MemoryFilter, MemoryRecord, Metadata, NewMemory, Source};
use super::{bytes_to_embedding, cosine_similarity, embedding_to_bytes, IdChecksum, TopK};
use crate::config::MemoriaConfig;
use crate::db::{self, SharedConn};
use crate::error::{EngineError, EngineResult};

/// Importance assigned when the ingest payload does not carry one.
pub const DEFAULT_IMPORTANCE: f64 = 0.5;

const SELECT_COLUMNS: &str = "id, text, source, user_id, partition_key, metadata, importance, \
     encrypted, embedding, embedding_model, created_at, deleted_at";

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub time_bucket: TimeBucket,
    pub max_text_len: usize,
    pub default_user: String,
}

impl StoreOptions {
    pub fn from_config(config: &MemoriaConfig) -> Self {
        Self {
            time_bucket: config.index.time_bucket,
            max_text_len: config.storage.max_text_len,
            default_user: config.storage.default_user.clone(),
        }
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::from_config(&MemoriaConfig::default())
    }
}

/// A vector read back for index builds.
#[derive(Debug, Clone)]
pub struct StoredVector {
    pub id: String,
    pub partition_key: PartitionKey,
    pub vector: Vec<f32>,
}

#[derive(Debug, Serialize)]
pub struct StoreStats {
    pub total: u64,
    pub active: u64,
    pub tombstoned: u64,
    pub unembedded: u64,
    pub by_source: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest: Option<DateTime<Utc>>,
}

/// Active records and vector bytes held by one partition.
#[derive(Debug, Clone, Serialize)]
pub struct PartitionCount {
    pub partition_key: PartitionKey,
    pub count: u64,
    pub vector_bytes: u64,
}

#[derive(Clone)]
pub struct MemoryStore {
    conn: SharedConn,
    options: StoreOptions,
}

impl MemoryStore {
    pub fn new(conn: SharedConn, options: StoreOptions) -> Self {
        Self { conn, options }
    }

    pub fn conn(&self) -> &SharedConn {
        &self.conn
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Validate and insert a new record. Returns the stored record.
    pub fn create(&self, new: NewMemory) -> EngineResult<MemoryRecord> {
        let text = new.text.trim();
        if text.is_empty() {
            return Err(EngineError::Validation("text must not be empty".into()));
        }
        if text.chars().count() > self.options.max_text_len {
            return Err(EngineError::Validation(format!(
                "text exceeds {} characters",
                self.options.max_text_len
            )));
        }
        let importance = new.importance.unwrap_or(DEFAULT_IMPORTANCE);
        validate_importance(importance)?;
        if let Some((vector, model)) = &new.embedding {
            if vector.is_empty() || model.is_empty() {
                return Err(EngineError::Validation(
                    "precomputed embedding needs a vector and a model".into(),
                ));
            }
        }

        let user = new
            .user
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .unwrap_or(&self.options.default_user)
            .to_string();
        let created_at = new.created_at.unwrap_or_else(Utc::now);
        let partition_key =
            PartitionKey::derive(&user, new.source, created_at, self.options.time_bucket);
        let (embedding, embedding_model) = match new.embedding {
            Some((v, m)) => (Some(v), Some(m)),
            None => (None, None),
        };

        let record = MemoryRecord {
            id: uuid::Uuid::now_v7().to_string(),
            text: text.to_string(),
            embedding,
            embedding_model,
            source: new.source,
            user,
            metadata: new.metadata,
            created_at,
            importance,
            encrypted: new.encrypted,
            partition_key,
            deleted_at: None,
        };

        let mut conn = db::lock(&self.conn)?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO memories (id, text, source, user_id, partition_key, metadata, importance, \
             encrypted, embedding, embedding_model, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.id,
                record.text,
                record.source.as_str(),
                record.user,
                record.partition_key.as_str(),
                serde_json::to_string(&record.metadata)?,
                record.importance,
                record.encrypted,
                record.embedding.as_deref().map(embedding_to_bytes),
                record.embedding_model,
                db::timestamp(record.created_at),
            ],
        )?;
        write_audit_log(
            &tx,
            "create",
            &record.id,
            Some(&serde_json::json!({
                "source": record.source.as_str(),
                "partition": record.partition_key.as_str(),
            })),
        )?;
        tx.commit()?;

        tracing::debug!(id = %record.id, partition = %record.partition_key, "memory created");
        Ok(record)
    }

    /// Fetch a record by id, tombstoned or not.
    pub fn get(&self, id: &str) -> EngineResult<MemoryRecord> {
        let conn = db::lock(&self.conn)?;
        conn.query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM memories WHERE id = ?1"),
            params![id],
            row_to_record,
        )
        .optional()?
        .ok_or_else(|| EngineError::NotFound(format!("memory {id}")))
    }

    /// Batch-fetch records by id. Missing ids are simply absent from the map.
    pub fn get_many(&self, ids: &[String]) -> EngineResult<HashMap<String, MemoryRecord>> {
        let mut map = HashMap::with_capacity(ids.len());
        if ids.is_empty() {
            return Ok(map);
        }
        let conn = db::lock(&self.conn)?;
        // SQLite caps bound parameters; stay well below the limit.
        for chunk in ids.chunks(500) {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM memories WHERE id IN ({})",
                placeholders(1, chunk.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(chunk.iter()), row_to_record)?
                .collect::<Result<Vec<_>, _>>()?;
            for record in rows {
                map.insert(record.id.clone(), record);
            }
        }
        Ok(map)
    }

    /// Tombstone a record. Idempotent; returns the record as it now stands.
    pub fn soft_delete(&self, id: &str) -> EngineResult<MemoryRecord> {
        let mut conn = db::lock(&self.conn)?;
        let tx = conn.transaction()?;
        let mut record = tx
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM memories WHERE id = ?1"),
                params![id],
                row_to_record,
            )
            .optional()?
            .ok_or_else(|| EngineError::NotFound(format!("memory {id}")))?;

        if record.deleted_at.is_none() {
            let now = Utc::now();
            tx.execute(
                "UPDATE memories SET deleted_at = ?1 WHERE id = ?2",
                params![db::timestamp(now), id],
            )?;
            write_audit_log(&tx, "delete", id, None)?;
            record.deleted_at = Some(now);
        }
        tx.commit()?;
        Ok(record)
    }

    /// Replace the importance score of an active record.
    pub fn update_importance(&self, id: &str, score: f64) -> EngineResult<()> {
        validate_importance(score)?;
        let conn = db::lock(&self.conn)?;
        let rows = conn.execute(
            "UPDATE memories SET importance = ?1 WHERE id = ?2 AND deleted_at IS NULL",
            params![score, id],
        )?;
        if rows == 0 {
            return Err(EngineError::NotFound(format!("memory {id}")));
        }
        write_audit_log(
            &conn,
            "importance",
            id,
            Some(&serde_json::json!({ "importance": score })),
        )?;
        Ok(())
    }

    /// Fill in the vector produced by the embedding pipeline.
    ///
    /// Returns `false` without writing when the record already carries a vector from
    /// the same model or has been tombstoned, so replays are harmless.
    pub fn attach_embedding(&self, id: &str, vector: &[f32], model: &str) -> EngineResult<bool> {
        let mut conn = db::lock(&self.conn)?;
        let tx = conn.transaction()?;
        let current: Option<(Option<String>, bool, bool)> = tx
            .query_row(
                "SELECT embedding_model, embedding IS NOT NULL, deleted_at IS NOT NULL \
                 FROM memories WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((current_model, has_embedding, deleted)) = current else {
            return Err(EngineError::NotFound(format!("memory {id}")));
        };
        if deleted || (has_embedding && current_model.as_deref() == Some(model)) {
            return Ok(false);
        }

        tx.execute(
            "UPDATE memories SET embedding = ?1, embedding_model = ?2 WHERE id = ?3",
            params![embedding_to_bytes(vector), model, id],
        )?;
        write_audit_log(&tx, "embed", id, Some(&serde_json::json!({ "model": model })))?;
        tx.commit()?;
        Ok(true)
    }

    /// Exact linear scan over active, embedded records.
    ///
    /// Restricted by `filter` and, when given, by an explicit set of partitions.
    /// Returns `(id, cosine)` pairs, best first, ties broken by id.
    pub fn brute_force_search(
        &self,
        query: &[f32],
        k: usize,
        filter: &MemoryFilter,
        partitions: Option<&[PartitionKey]>,
    ) -> EngineResult<Vec<(String, f32)>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let mut sql = String::from(
            "SELECT id, embedding FROM memories WHERE deleted_at IS NULL AND embedding IS NOT NULL",
        );
        let mut values: Vec<String> = Vec::new();

        if let Some(user) = filter.user_name() {
            values.push(user.to_string());
            sql.push_str(&format!(" AND user_id = ?{}", values.len()));
        }
        if !filter.sources.is_empty() {
            let start = values.len() + 1;
            values.extend(filter.sources.iter().map(|s| s.as_str().to_string()));
            sql.push_str(&format!(
                " AND source IN ({})",
                placeholders(start, filter.sources.len())
            ));
        }
        if let Some(since) = filter.since {
            values.push(db::timestamp(since));
            sql.push_str(&format!(" AND created_at >= ?{}", values.len()));
        }
        if let Some(until) = filter.until {
            values.push(db::timestamp(until));
            sql.push_str(&format!(" AND created_at <= ?{}", values.len()));
        }
        if let Some(keys) = partitions {
            if keys.is_empty() {
                return Ok(Vec::new());
            }
            let start = values.len() + 1;
            values.extend(keys.iter().map(|k| k.as_str().to_string()));
            sql.push_str(&format!(
                " AND partition_key IN ({})",
                placeholders(start, keys.len())
            ));
        }

        let conn = db::lock(&self.conn)?;
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(values.iter()))?;
        let mut top = TopK::new(k);
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let bytes: Vec<u8> = row.get(1)?;
            let vector = bytes_to_embedding(&bytes);
            if vector.len() != query.len() {
                continue;
            }
            top.push(id, cosine_similarity(query, &vector));
        }
        Ok(top.into_sorted())
    }

    /// Active records whose vector is missing or was produced by another model.
    pub fn list_unembedded(&self, model: &str, limit: usize) -> EngineResult<Vec<String>> {
        let conn = db::lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT id FROM memories \
             WHERE deleted_at IS NULL AND (embedding IS NULL OR embedding_model IS NOT ?1) \
             ORDER BY created_at, rowid LIMIT ?2",
        )?;
        let ids = stmt
            .query_map(params![model, limit as i64], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    /// Active embedded vectors of the given partitions, in creation order.
    pub fn list_partition(&self, partitions: &[PartitionKey]) -> EngineResult<Vec<StoredVector>> {
        if partitions.is_empty() {
            return Ok(Vec::new());
        }
        let conn = db::lock(&self.conn)?;
        let mut out = Vec::new();
        for chunk in partitions.chunks(500) {
            let sql = format!(
                "SELECT id, partition_key, embedding FROM memories \
                 WHERE deleted_at IS NULL AND embedding IS NOT NULL AND partition_key IN ({}) \
                 ORDER BY created_at, rowid",
                placeholders(1, chunk.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(chunk.iter().map(|k| k.as_str())), |row| {
                    let bytes: Vec<u8> = row.get(2)?;
                    Ok(StoredVector {
                        id: row.get(0)?,
                        partition_key: PartitionKey::from_stored(row.get::<_, String>(1)?),
                        vector: bytes_to_embedding(&bytes),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            out.extend(rows);
        }
        Ok(out)
    }

    /// Fingerprint of the active embedded ids in the given partitions.
    pub fn partition_checksum(&self, partitions: &[PartitionKey]) -> EngineResult<IdChecksum> {
        let mut sum = IdChecksum::default();
        if partitions.is_empty() {
            return Ok(sum);
        }
        let conn = db::lock(&self.conn)?;
        for chunk in partitions.chunks(500) {
            let sql = format!(
                "SELECT id FROM memories \
                 WHERE deleted_at IS NULL AND embedding IS NOT NULL AND partition_key IN ({})",
                placeholders(1, chunk.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(chunk.iter().map(|k| k.as_str())))?;
            while let Some(row) = rows.next()? {
                let id: String = row.get(0)?;
                sum.add(&id);
            }
        }
        Ok(sum)
    }

    /// Every partition key with at least one active record.
    pub fn partition_counts(&self) -> EngineResult<Vec<PartitionCount>> {
        let conn = db::lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT partition_key, COUNT(*), COALESCE(SUM(LENGTH(embedding)), 0) FROM memories \
             WHERE deleted_at IS NULL GROUP BY partition_key ORDER BY partition_key",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(PartitionCount {
                    partition_key: PartitionKey::from_stored(row.get::<_, String>(0)?),
                    count: row.get::<_, i64>(1)? as u64,
                    vector_bytes: row.get::<_, i64>(2)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Active records created at or after `since`, oldest first.
    pub fn list_active(
        &self,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> EngineResult<Vec<MemoryRecord>> {
        let conn = db::lock(&self.conn)?;
        let since = since.map(db::timestamp).unwrap_or_default();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM memories \
             WHERE deleted_at IS NULL AND created_at >= ?1 \
             ORDER BY created_at, rowid LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![since, limit as i64], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn stats(&self) -> EngineResult<StoreStats> {
        let conn = db::lock(&self.conn)?;
        let count = |sql: &str| -> rusqlite::Result<u64> {
            conn.query_row(sql, [], |row| row.get::<_, i64>(0)).map(|n| n as u64)
        };
        let total = count("SELECT COUNT(*) FROM memories")?;
        let active = count("SELECT COUNT(*) FROM memories WHERE deleted_at IS NULL")?;
        let unembedded = count(
            "SELECT COUNT(*) FROM memories WHERE deleted_at IS NULL AND embedding IS NULL",
        )?;

        let mut by_source = BTreeMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT source, COUNT(*) FROM memories WHERE deleted_at IS NULL GROUP BY source",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?;
            for row in rows {
                let (source, n) = row?;
                by_source.insert(source, n);
            }
        }

        let (oldest, newest): (Option<String>, Option<String>) = conn.query_row(
            "SELECT MIN(created_at), MAX(created_at) FROM memories WHERE deleted_at IS NULL",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(StoreStats {
            total,
            active,
            tombstoned: total - active,
            unembedded,
            by_source,
            oldest: oldest.as_deref().map(db::parse_timestamp),
            newest: newest.as_deref().map(db::parse_timestamp),
        })
    }
}

fn validate_importance(score: f64) -> EngineResult<()> {
    if score.is_nan() || !(0.0..=1.0).contains(&score) {
        return Err(EngineError::Validation(format!(
            "importance must be within [0, 1], got {score}"
        )));
    }
    Ok(())
}

/// `?start, ?start+1, …` for `n` bound parameters.
fn placeholders(start: usize, n: usize) -> String {
    (start..start + n)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<MemoryRecord> {
    let source: String = row.get(2)?;
    let source = source.parse::<Source>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
    })?;
    let metadata: String = row.get(5)?;
    let metadata = serde_json::from_str::<Metadata>(&metadata).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let embedding: Option<Vec<u8>> = row.get(8)?;
    let created_at: String = row.get(10)?;
    let deleted_at: Option<String> = row.get(11)?;

    Ok(MemoryRecord {
        id: row.get(0)?,
        text: row.get(1)?,
        source,
        user: row.get(3)?,
        partition_key: PartitionKey::from_stored(row.get::<_, String>(4)?),
        metadata,
        importance: row.get(6)?,
        encrypted: row.get(7)?,
        embedding: embedding.as_deref().map(bytes_to_embedding),
        embedding_model: row.get(9)?,
        created_at: db::parse_timestamp(&created_at),
        deleted_at: deleted_at.as_deref().map(db::parse_timestamp),
    })
}

/// Write an entry to the memory_log audit table.
pub(crate) fn write_audit_log(
    conn: &Connection,
    operation: &str,
    memory_id: &str,
    details: Option<&serde_json::Value>,
) -> rusqlite::Result<()> {
    let details_json = details.map(|d| d.to_string());
    conn.execute(
        "INSERT INTO memory_log (operation, memory_id, details, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![operation, memory_id, details_json, db::now_timestamp()],
    )?;
    Ok(())
}

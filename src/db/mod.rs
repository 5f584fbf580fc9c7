pub mod migrations;
pub mod schema;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{EngineError, EngineResult};

/// The connection shared by the store, the task log, and the graph tables.
pub type SharedConn = Arc<Mutex<Connection>>;

/// Lock the shared connection, mapping a poisoned mutex to an internal error.
pub fn lock(conn: &SharedConn) -> EngineResult<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|e| EngineError::Internal(format!("db lock poisoned: {e}")))
}

/// Open (or create) the database at the given path with schema and migrations applied.
pub fn open_database(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
    }

    let conn = Connection::open(path)
        .with_context(|| format!("failed to open database at {}", path.display()))?;

    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(std::time::Duration::from_millis(5000))?;

    schema::init_schema(&conn).context("failed to initialize schema")?;
    migrations::run_migrations(&conn).context("failed to run migrations")?;

    tracing::info!(path = %path.display(), "database initialized");
    Ok(conn)
}

/// Open an in-memory database with schema and migrations applied.
pub fn open_memory_database() -> Result<Connection> {
    let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    schema::init_schema(&conn).context("failed to initialize schema")?;
    migrations::run_migrations(&conn).context("failed to run migrations")?;
    Ok(conn)
}

pub fn shared(conn: Connection) -> SharedConn {
    Arc::new(Mutex::new(conn))
}

/// Fixed-width RFC 3339 (`2026-10-16T08:00:00.000000Z`) so text comparison in SQL
/// orders the same as time.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn now_timestamp() -> String {
    timestamp(Utc::now())
}

/// Parse a stored timestamp. Malformed values fall back to the Unix epoch.
pub fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

/// Result of [`check_database_health`].
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub integrity_ok: bool,
    pub integrity_details: String,
    pub schema_version: u32,
    pub embedding_model: Option<String>,
    pub memory_count: u64,
    pub tombstoned_count: u64,
    pub unembedded_count: u64,
    pub pending_tasks: u64,
    pub failed_tasks: u64,
    pub entity_count: u64,
    pub relationship_count: u64,
}

/// Run `PRAGMA integrity_check` and gather row counts.
pub fn check_database_health(conn: &Connection) -> rusqlite::Result<HealthReport> {
    let integrity_details: String =
        conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
    let count = |sql: &str| -> rusqlite::Result<u64> {
        conn.query_row(sql, [], |row| row.get::<_, i64>(0))
            .map(|n| n as u64)
    };

    Ok(HealthReport {
        integrity_ok: integrity_details == "ok",
        integrity_details,
        schema_version: migrations::get_schema_version(conn)?,
        embedding_model: migrations::get_embedding_model(conn)?,
        memory_count: count("SELECT COUNT(*) FROM memories")?,
        tombstoned_count: count("SELECT COUNT(*) FROM memories WHERE deleted_at IS NOT NULL")?,
        unembedded_count: count(
            "SELECT COUNT(*) FROM memories WHERE deleted_at IS NULL AND embedding IS NULL",
        )?,
        pending_tasks: count("SELECT COUNT(*) FROM tasks WHERE status IN ('queued','running')")?,
        failed_tasks: count("SELECT COUNT(*) FROM tasks WHERE status = 'failed'")?,
        entity_count: count("SELECT COUNT(*) FROM knowledge_entities")?,
        relationship_count: count("SELECT COUNT(*) FROM knowledge_relationships")?,
    })
}

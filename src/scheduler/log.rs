//! Durable task log backed by the `tasks` table.
//!
//! Every task is written here before it enters the in-memory queue, and every
//! status transition is written before it takes effect, so a restarted process can
//! replay whatever was queued or running when it died.

use std::collections::BTreeMap;

use rusqlite::{params, OptionalExtension, Row};

use super::task::{Task, TaskKind, TaskStatus};
use crate::db::{self, SharedConn};
use crate::error::EngineResult;

const SELECT_COLUMNS: &str =
    "id, kind, target, priority, status, attempts, last_error, created_at, updated_at";

#[derive(Clone)]
pub struct TaskLog {
    pub(super) conn: SharedConn,
}

impl TaskLog {
    pub fn new(conn: SharedConn) -> Self {
        Self { conn }
    }

    pub fn insert(&self, task: &Task) -> EngineResult<()> {
        let conn = db::lock(&self.conn)?;
        conn.execute(
            "INSERT INTO tasks (id, kind, target, priority, status, attempts, last_error, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                task.id,
                task.kind.as_str(),
                task.target,
                task.priority,
                task.status.as_str(),
                task.attempts,
                task.last_error,
                db::timestamp(task.created_at),
                db::timestamp(task.updated_at),
            ],
        )?;
        Ok(())
    }

    /// Record a status transition. `attempts` and `error` are only written when given.
    pub fn update(
        &self,
        id: &str,
        status: TaskStatus,
        attempts: Option<u32>,
        error: Option<&str>,
    ) -> EngineResult<()> {
        let conn = db::lock(&self.conn)?;
        conn.execute(
            "UPDATE tasks SET status = ?1, attempts = COALESCE(?2, attempts), \
             last_error = COALESCE(?3, last_error), updated_at = ?4 WHERE id = ?5",
            params![status.as_str(), attempts, error, db::now_timestamp(), id],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> EngineResult<Option<Task>> {
        let conn = db::lock(&self.conn)?;
        let task = conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
                row_to_task,
            )
            .optional()?;
        Ok(task)
    }

    /// Tasks that were queued or running, in submission order.
    pub fn list_unfinished(&self) -> EngineResult<Vec<Task>> {
        let conn = db::lock(&self.conn)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM tasks WHERE status IN ('queued', 'running') \
             ORDER BY created_at, id"
        ))?;
        let tasks = stmt
            .query_map([], row_to_task)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    pub fn list_by_status(&self, status: TaskStatus, limit: usize) -> EngineResult<Vec<Task>> {
        let conn = db::lock(&self.conn)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM tasks WHERE status = ?1 \
             ORDER BY updated_at DESC LIMIT ?2"
        ))?;
        let tasks = stmt
            .query_map(params![status.as_str(), limit as i64], row_to_task)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    /// Row count per status.
    pub fn counts(&self) -> EngineResult<BTreeMap<String, u64>> {
        let conn = db::lock(&self.conn)?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let (status, n) = row?;
            counts.insert(status, n);
        }
        Ok(counts)
    }

    /// Drop finished rows last touched before `cutoff`. Returns rows removed.
    pub fn purge_finished(&self, cutoff: chrono::DateTime<chrono::Utc>) -> EngineResult<usize> {
        let conn = db::lock(&self.conn)?;
        let n = conn.execute(
            "DELETE FROM tasks WHERE status IN ('done', 'cancelled') AND updated_at < ?1",
            params![db::timestamp(cutoff)],
        )?;
        Ok(n)
    }
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let conversion = |idx: usize, e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    };
    let kind: String = row.get(1)?;
    let status: String = row.get(4)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;

    Ok(Task {
        id: row.get(0)?,
        kind: kind.parse::<TaskKind>().map_err(|e| conversion(1, e))?,
        target: row.get(2)?,
        priority: row.get(3)?,
        status: status.parse::<TaskStatus>().map_err(|e| conversion(4, e))?,
        attempts: row.get(5)?,
        last_error: row.get(6)?,
        created_at: db::parse_timestamp(&created_at),
        updated_at: db::parse_timestamp(&updated_at),
    })
}

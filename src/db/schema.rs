//! SQL DDL for all engine tables.
//!
//! The `memories` table is the single source of truth. `tasks` is the durable task
//! log the scheduler replays after a restart. `partitions` records shard routing and
//! consolidation bookkeeping. The `knowledge_*` tables hold the derived graph and can
//! be dropped and rebuilt at any time. All DDL uses `IF NOT EXISTS`.

use rusqlite::Connection;

const SCHEMA_SQL: &str = r#"
-- Record table
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    text TEXT NOT NULL,
    source TEXT NOT NULL CHECK(source IN ('medication','habit','finance','voice','camera','chat','document')),
    user_id TEXT NOT NULL,
    partition_key TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    importance REAL NOT NULL DEFAULT 0.5 CHECK(importance >= 0.0 AND importance <= 1.0),
    encrypted INTEGER NOT NULL DEFAULT 0,
    embedding BLOB,
    embedding_model TEXT,
    created_at TEXT NOT NULL,
    deleted_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_memories_partition ON memories(partition_key);
CREATE INDEX IF NOT EXISTS idx_memories_source ON memories(source);
CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at);
CREATE INDEX IF NOT EXISTS idx_memories_deleted ON memories(deleted_at);

-- Audit log
CREATE TABLE IF NOT EXISTS memory_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL CHECK(operation IN ('create','embed','importance','delete')),
    memory_id TEXT NOT NULL,
    details TEXT,
    created_at TEXT NOT NULL
);

-- Durable task log
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL CHECK(kind IN ('embed','index','consolidate','build_graph')),
    target TEXT NOT NULL,
    priority INTEGER NOT NULL CHECK(priority >= 0 AND priority <= 3),
    status TEXT NOT NULL CHECK(status IN ('queued','running','done','failed','cancelled')),
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

-- Shard routing and consolidation bookkeeping
CREATE TABLE IF NOT EXISTS partitions (
    partition_key TEXT PRIMARY KEY,
    shard_id TEXT NOT NULL,
    last_consolidated TEXT
);

-- Derived knowledge graph
CREATE TABLE IF NOT EXISTS knowledge_entities (
    id TEXT PRIMARY KEY,
    entity_type TEXT NOT NULL CHECK(entity_type IN ('person','habit','medication','location','activity','concept','time')),
    label TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(entity_type, label)
);

CREATE TABLE IF NOT EXISTS entity_memories (
    entity_id TEXT NOT NULL REFERENCES knowledge_entities(id) ON DELETE CASCADE,
    memory_id TEXT NOT NULL,
    PRIMARY KEY (entity_id, memory_id)
);

CREATE TABLE IF NOT EXISTS knowledge_relationships (
    id TEXT PRIMARY KEY,
    source_id TEXT NOT NULL REFERENCES knowledge_entities(id) ON DELETE CASCADE,
    target_id TEXT NOT NULL REFERENCES knowledge_entities(id) ON DELETE CASCADE,
    relation TEXT NOT NULL CHECK(relation IN ('causes','prevents','improves','worsens','related_to','occurs_at','belongs_to','similar_to')),
    strength REAL NOT NULL DEFAULT 0.0,
    evidence_count INTEGER NOT NULL DEFAULT 0,
    confidence_sum REAL NOT NULL DEFAULT 0.0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(source_id, target_id, relation)
);

CREATE INDEX IF NOT EXISTS idx_relationships_source ON knowledge_relationships(source_id);
CREATE INDEX IF NOT EXISTS idx_relationships_target ON knowledge_relationships(target_id);

CREATE TABLE IF NOT EXISTS relationship_evidence (
    relationship_id TEXT NOT NULL REFERENCES knowledge_relationships(id) ON DELETE CASCADE,
    memory_id TEXT NOT NULL,
    confidence REAL NOT NULL,
    PRIMARY KEY (relationship_id, memory_id)
);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_all_tables() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        for expected in [
            "memories",
            "memory_log",
            "tasks",
            "partitions",
            "knowledge_entities",
            "entity_memories",
            "knowledge_relationships",
            "relationship_evidence",
            "schema_meta",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[test]
    fn schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
    }

    #[test]
    fn importance_is_range_checked() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        let res = conn.execute(
            "INSERT INTO memories (id, text, source, user_id, partition_key, importance, created_at) \
             VALUES ('m', 't', 'habit', 'u', 'u/habit/2026-W01', 1.5, '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(res.is_err());
    }
}

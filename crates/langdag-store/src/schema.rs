use rusqlite::{params, Connection};
use tracing::debug;

use langdag_core::error::{LangdagError, Result};

/// Ordered schema migrations. Entry `i` brings the schema to version `i + 1`.
const MIGRATIONS: &[&str] = &[
    "CREATE TABLE nodes (
        id TEXT PRIMARY KEY,
        parent_id TEXT REFERENCES nodes(id) ON DELETE CASCADE,
        sequence INTEGER NOT NULL,
        node_type TEXT NOT NULL,
        content TEXT NOT NULL DEFAULT '',
        model TEXT,
        tokens_in INTEGER,
        tokens_out INTEGER,
        latency_ms INTEGER,
        status TEXT,
        title TEXT,
        system_prompt TEXT,
        created_at TEXT NOT NULL
    );

    CREATE INDEX idx_nodes_parent ON nodes(parent_id, sequence);
    CREATE INDEX idx_nodes_roots ON nodes(created_at) WHERE parent_id IS NULL;",
    "CREATE TABLE workflows (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        version INTEGER NOT NULL DEFAULT 1,
        description TEXT,
        definition TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );",
];

/// Bring the schema up to date. Safe to run on every open.
pub(crate) fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
         );",
    )
    .map_err(|e| LangdagError::Database(e.to_string()))?;

    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .map_err(|e| LangdagError::Database(e.to_string()))?;

    for (idx, sql) in MIGRATIONS.iter().enumerate() {
        let version = idx as i64 + 1;
        if version <= current {
            continue;
        }
        conn.execute_batch(sql)
            .map_err(|e| LangdagError::Database(format!("migration {version}: {e}")))?;
        conn.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            params![version, chrono::Utc::now().to_rfc3339()],
        )
        .map_err(|e| LangdagError::Database(e.to_string()))?;
        debug!(version, "Applied schema migration");
    }

    Ok(())
}

pub(crate) fn schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .map_err(|e| LangdagError::Database(e.to_string()))
}

pub(crate) fn latest_version() -> i64 {
    MIGRATIONS.len() as i64
}

//! SQL DDL for all hindsight tables.
//!
//! Defines the relational tables (`sdk_sessions`, `observations`, `session_summaries`,
//! `user_prompts`, `pending_messages`, `schema_meta`) and the derived vector tables
//! (`vector_documents` metadata plus the `vector_embeddings` vec0 table). All DDL uses
//! `IF NOT EXISTS` for idempotent initialization.

use rusqlite::Connection;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS sdk_sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content_session_id TEXT NOT NULL UNIQUE,
    memory_session_id TEXT,
    project TEXT NOT NULL,
    user_prompt TEXT,
    prompt_counter INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'active' CHECK(status IN ('active','completed','failed')),
    started_at TEXT NOT NULL,
    started_at_epoch INTEGER NOT NULL,
    completed_at_epoch INTEGER
);

CREATE INDEX IF NOT EXISTS idx_sessions_project ON sdk_sessions(project);
CREATE INDEX IF NOT EXISTS idx_sessions_memory ON sdk_sessions(memory_session_id);

CREATE TABLE IF NOT EXISTS observations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    memory_session_id TEXT NOT NULL,
    project TEXT NOT NULL,
    type TEXT NOT NULL,
    title TEXT,
    subtitle TEXT,
    facts TEXT NOT NULL DEFAULT '[]',
    narrative TEXT,
    concepts TEXT NOT NULL DEFAULT '[]',
    files_read TEXT NOT NULL DEFAULT '[]',
    files_modified TEXT NOT NULL DEFAULT '[]',
    prompt_number INTEGER,
    discovery_tokens INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    created_at_epoch INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_observations_project ON observations(project);
CREATE INDEX IF NOT EXISTS idx_observations_type ON observations(type);
CREATE INDEX IF NOT EXISTS idx_observations_epoch ON observations(created_at_epoch);
CREATE INDEX IF NOT EXISTS idx_observations_session ON observations(memory_session_id);

CREATE TABLE IF NOT EXISTS session_summaries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    memory_session_id TEXT NOT NULL,
    project TEXT NOT NULL,
    request TEXT,
    investigated TEXT,
    learned TEXT,
    completed TEXT,
    next_steps TEXT,
    notes TEXT,
    prompt_number INTEGER,
    discovery_tokens INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    created_at_epoch INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_summaries_project ON session_summaries(project);
CREATE INDEX IF NOT EXISTS idx_summaries_epoch ON session_summaries(created_at_epoch);

CREATE TABLE IF NOT EXISTS user_prompts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content_session_id TEXT NOT NULL,
    project TEXT NOT NULL,
    prompt_number INTEGER NOT NULL,
    prompt_text TEXT NOT NULL,
    created_at TEXT NOT NULL,
    created_at_epoch INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_prompts_session ON user_prompts(content_session_id);
CREATE INDEX IF NOT EXISTS idx_prompts_epoch ON user_prompts(created_at_epoch);

-- Durable work queue backing each session's in-memory pending queue
CREATE TABLE IF NOT EXISTS pending_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_db_id INTEGER NOT NULL REFERENCES sdk_sessions(id) ON DELETE CASCADE,
    content_session_id TEXT NOT NULL,
    message_type TEXT NOT NULL CHECK(message_type IN ('observation','summarize')),
    payload TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN ('pending','processing','processed','failed')),
    retry_count INTEGER NOT NULL DEFAULT 0,
    error TEXT,
    created_at_epoch INTEGER NOT NULL,
    started_processing_at_epoch INTEGER,
    completed_at_epoch INTEGER
);

CREATE INDEX IF NOT EXISTS idx_pending_status ON pending_messages(status);
CREATE INDEX IF NOT EXISTS idx_pending_session ON pending_messages(session_db_id);

-- Derived vector metadata: a pointer table back into the relational rows
CREATE TABLE IF NOT EXISTS vector_documents (
    doc_id TEXT PRIMARY KEY,
    sqlite_id INTEGER NOT NULL,
    doc_type TEXT NOT NULL CHECK(doc_type IN ('observation','session_summary','user_prompt')),
    field TEXT NOT NULL,
    project TEXT NOT NULL,
    memory_session_id TEXT,
    created_at_epoch INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_vector_docs_source ON vector_documents(doc_type, sqlite_id);

CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// vec0 virtual table must be created separately (sqlite-vec syntax).
const VEC_TABLE_SQL: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS vector_embeddings USING vec0(
    doc_id TEXT PRIMARY KEY,
    embedding FLOAT[384]
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute_batch(VEC_TABLE_SQL)?;

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
        crate::db::load_sqlite_vec();
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
            "sdk_sessions",
            "observations",
            "session_summaries",
            "user_prompts",
            "pending_messages",
            "vector_documents",
            "vector_embeddings",
            "schema_meta",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing table {expected}");
        }

        let version: String = conn
            .query_row("SELECT vec_version()", [], |r| r.get(0))
            .unwrap();
        assert!(!version.is_empty());
    }

    #[test]
    fn schema_is_idempotent() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
    }
}

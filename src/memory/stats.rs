use anyhow::Result;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

/// Store-level counts used by `/api/metrics` and `doctor`.
#[derive(Debug, Default, Clone, Serialize)]
pub struct StoreStats {
    pub sessions: u64,
    pub active_sessions: u64,
    pub observations: u64,
    pub archived_observations: u64,
    pub summaries: u64,
    pub prompts: u64,
    pub vector_documents: u64,
    pub observations_by_type: HashMap<String, u64>,
    pub db_size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_observation_epoch: Option<i64>,
}

/// Compute store statistics. `db_path` is used for the file size; pass None in memory.
pub fn store_stats(conn: &Connection, db_path: Option<&Path>) -> Result<StoreStats> {
    let count = |sql: &str| -> Result<u64> {
        let n: i64 = conn.query_row(sql, [], |r| r.get(0))?;
        Ok(n as u64)
    };

    let mut by_type = HashMap::new();
    let mut stmt = conn.prepare(
        "SELECT type, COUNT(*) FROM observations
         WHERE archived_at_epoch IS NULL GROUP BY type",
    )?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
    for row in rows {
        let (ty, n) = row?;
        by_type.insert(ty, n as u64);
    }

    let db_size_bytes = db_path
        .and_then(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .unwrap_or(0);

    Ok(StoreStats {
        sessions: count("SELECT COUNT(*) FROM sdk_sessions")?,
        active_sessions: count("SELECT COUNT(*) FROM sdk_sessions WHERE status = 'active'")?,
        observations: count("SELECT COUNT(*) FROM observations WHERE archived_at_epoch IS NULL")?,
        archived_observations: count(
            "SELECT COUNT(*) FROM observations WHERE archived_at_epoch IS NOT NULL",
        )?,
        summaries: count("SELECT COUNT(*) FROM session_summaries WHERE archived_at_epoch IS NULL")?,
        prompts: count("SELECT COUNT(*) FROM user_prompts")?,
        vector_documents: count("SELECT COUNT(*) FROM vector_documents")?,
        observations_by_type: by_type,
        db_size_bytes,
        newest_observation_epoch: conn.query_row(
            "SELECT MAX(created_at_epoch) FROM observations",
            [],
            |r| r.get(0),
        )?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;

    #[test]
    fn empty_store_stats() {
        let conn = open_memory_database().unwrap();
        let stats = store_stats(&conn, None).unwrap();
        assert_eq!(stats.observations, 0);
        assert!(stats.observations_by_type.is_empty());
        assert!(stats.newest_observation_epoch.is_none());
    }
}

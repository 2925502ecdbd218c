//! Retention policy for observations and summaries.
//!
//! Soft mode stamps `archived_at_epoch` so rows drop out of every read; hard mode deletes them
//! together with their vector documents. Excluded observation types are never touched.

use anyhow::Result;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};

use crate::memory::store::now_epoch_ms;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionMode {
    #[default]
    Soft,
    Hard,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub enabled: bool,
    pub max_age_days: Option<u64>,
    /// Keep at most this many live observations (newest win).
    pub max_count: Option<usize>,
    pub mode: RetentionMode,
    pub excluded_types: Vec<String>,
}

#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct RetentionReport {
    pub observations: usize,
    pub summaries: usize,
    pub vector_documents: usize,
    pub mode: RetentionMode,
}

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Apply `policy` at `now` (epoch ms). A disabled policy is a no-op.
pub fn apply_retention(
    conn: &mut Connection,
    policy: &RetentionPolicy,
    now: i64,
) -> Result<RetentionReport> {
    let mut report = RetentionReport {
        mode: policy.mode,
        ..Default::default()
    };
    if !policy.enabled {
        return Ok(report);
    }

    let tx = conn.transaction()?;
    let mut obs_ids: Vec<i64> = Vec::new();
    let mut summary_ids: Vec<i64> = Vec::new();

    let mut exclusion = String::new();
    let mut excl_values: Vec<Value> = Vec::new();
    if !policy.excluded_types.is_empty() {
        let placeholders: Vec<String> = (0..policy.excluded_types.len())
            .map(|i| format!("?{}", i + 2))
            .collect();
        exclusion = format!(" AND type NOT IN ({})", placeholders.join(", "));
        excl_values = policy
            .excluded_types
            .iter()
            .map(|t| Value::Text(t.clone()))
            .collect();
    }

    if let Some(days) = policy.max_age_days {
        let cutoff = now - days as i64 * DAY_MS;
        let mut values = vec![Value::Integer(cutoff)];
        values.extend(excl_values.iter().cloned());
        let mut stmt = tx.prepare(&format!(
            "SELECT id FROM observations
             WHERE archived_at_epoch IS NULL AND created_at_epoch < ?1{exclusion}"
        ))?;
        obs_ids.extend(
            stmt.query_map(params_from_iter(values.iter()), |r| r.get::<_, i64>(0))?
                .collect::<Result<Vec<_>, _>>()?,
        );

        let mut stmt = tx.prepare(
            "SELECT id FROM session_summaries
             WHERE archived_at_epoch IS NULL AND created_at_epoch < ?1",
        )?;
        summary_ids.extend(
            stmt.query_map([cutoff], |r| r.get::<_, i64>(0))?
                .collect::<Result<Vec<_>, _>>()?,
        );
    }

    if let Some(max) = policy.max_count {
        let mut values = vec![Value::Integer(max as i64)];
        values.extend(excl_values.iter().cloned());
        let mut stmt = tx.prepare(&format!(
            "SELECT id FROM observations
             WHERE archived_at_epoch IS NULL{exclusion}
             ORDER BY created_at_epoch DESC, id DESC
             LIMIT -1 OFFSET ?1"
        ))?;
        for id in stmt
            .query_map(params_from_iter(values.iter()), |r| r.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?
        {
            if !obs_ids.contains(&id) {
                obs_ids.push(id);
            }
        }
    }

    for id in &obs_ids {
        match policy.mode {
            RetentionMode::Soft => {
                tx.execute(
                    "UPDATE observations SET archived_at_epoch = ?2 WHERE id = ?1",
                    [*id, now],
                )?;
            }
            RetentionMode::Hard => {
                tx.execute("DELETE FROM observations WHERE id = ?1", [*id])?;
            }
        }
        report.vector_documents += remove_vector_docs(&tx, "observation", *id)?;
    }
    for id in &summary_ids {
        match policy.mode {
            RetentionMode::Soft => {
                tx.execute(
                    "UPDATE session_summaries SET archived_at_epoch = ?2 WHERE id = ?1",
                    [*id, now],
                )?;
            }
            RetentionMode::Hard => {
                tx.execute("DELETE FROM session_summaries WHERE id = ?1", [*id])?;
            }
        }
        report.vector_documents += remove_vector_docs(&tx, "session_summary", *id)?;
    }

    tx.commit()?;
    report.observations = obs_ids.len();
    report.summaries = summary_ids.len();

    if report.observations + report.summaries > 0 {
        tracing::info!(
            observations = report.observations,
            summaries = report.summaries,
            mode = ?policy.mode,
            "retention applied"
        );
    }
    Ok(report)
}

/// Archived rows are invisible to search, so their vector documents go in either mode.
fn remove_vector_docs(conn: &Connection, doc_type: &str, sqlite_id: i64) -> Result<usize> {
    let doc_ids: Vec<String> = conn
        .prepare("SELECT doc_id FROM vector_documents WHERE doc_type = ?1 AND sqlite_id = ?2")?
        .query_map(rusqlite::params![doc_type, sqlite_id], |r| r.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    for doc_id in &doc_ids {
        conn.execute("DELETE FROM vector_embeddings WHERE doc_id = ?1", [doc_id])?;
    }
    Ok(conn.execute(
        "DELETE FROM vector_documents WHERE doc_type = ?1 AND sqlite_id = ?2",
        rusqlite::params![doc_type, sqlite_id],
    )?)
}

/// Convenience wrapper using the current time.
pub fn apply_retention_now(
    conn: &mut Connection,
    policy: &RetentionPolicy,
) -> Result<RetentionReport> {
    apply_retention(conn, policy, now_epoch_ms())
}

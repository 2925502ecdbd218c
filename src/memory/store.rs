//! Write path for generation output.
//!
//! [`store_batch`] is the single entry point used by the session drain: every observation
//! plus at most one summary from one generation batch is inserted inside one transaction,
//! and the pending-queue rows that fed the batch are marked processed in that same
//! transaction. Timestamps are produced once per batch so the ISO and epoch columns always
//! describe the same instant.

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, Row, Transaction};
use serde::Serialize;

use crate::memory::types::{
    Observation, ParsedObservation, ParsedSummary, SessionSummary, UserPrompt,
};

pub const OBSERVATION_COLUMNS: &str = "id, memory_session_id, project, type, title, subtitle, \
     facts, narrative, concepts, files_read, files_modified, prompt_number, discovery_tokens, \
     created_at, created_at_epoch";

pub const SUMMARY_COLUMNS: &str = "id, memory_session_id, project, request, investigated, \
     learned, completed, next_steps, notes, prompt_number, discovery_tokens, created_at, \
     created_at_epoch";

pub const PROMPT_COLUMNS: &str =
    "id, content_session_id, project, prompt_number, prompt_text, created_at, created_at_epoch";

pub fn now_epoch_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// ISO-8601 and epoch-millisecond forms of one instant (now, or the override).
pub fn timestamp_pair(override_epoch: Option<i64>) -> (String, i64) {
    let epoch = override_epoch.unwrap_or_else(now_epoch_ms);
    let instant = DateTime::<Utc>::from_timestamp_millis(epoch).unwrap_or_else(Utc::now);
    (instant.to_rfc3339_opts(SecondsFormat::Millis, true), epoch)
}

/// Everything one generation batch writes.
#[derive(Debug, Clone, Default)]
pub struct BatchWrite {
    pub memory_session_id: String,
    pub project: String,
    pub observations: Vec<ParsedObservation>,
    pub summary: Option<ParsedSummary>,
    pub prompt_number: Option<i64>,
    pub discovery_tokens: i64,
    /// Use this instant instead of now, typically the oldest pending message's enqueue time.
    pub override_epoch: Option<i64>,
    /// `pending_messages` rows consumed by this batch.
    pub processed_message_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredBatch {
    pub observations: Vec<Observation>,
    pub summary: Option<SessionSummary>,
    pub created_at_epoch: i64,
}

pub fn store_batch(conn: &mut Connection, batch: &BatchWrite) -> Result<StoredBatch> {
    let (created_at, epoch) = timestamp_pair(batch.override_epoch);
    let tx = conn.transaction()?;

    let mut observations = Vec::with_capacity(batch.observations.len());
    for obs in &batch.observations {
        let id = insert_observation(&tx, batch, obs, &created_at, epoch)?;
        observations.push(Observation {
            id,
            memory_session_id: batch.memory_session_id.clone(),
            project: batch.project.clone(),
            obs_type: obs.obs_type.clone(),
            title: obs.title.clone(),
            subtitle: obs.subtitle.clone(),
            facts: obs.facts.clone(),
            narrative: obs.narrative.clone(),
            concepts: obs.concepts.clone(),
            files_read: obs.files_read.clone(),
            files_modified: obs.files_modified.clone(),
            prompt_number: batch.prompt_number,
            discovery_tokens: batch.discovery_tokens,
            created_at: created_at.clone(),
            created_at_epoch: epoch,
        });
    }

    let summary = match &batch.summary {
        Some(s) => {
            let id = insert_summary(&tx, batch, s, &created_at, epoch)?;
            Some(SessionSummary {
                id,
                memory_session_id: batch.memory_session_id.clone(),
                project: batch.project.clone(),
                request: s.request.clone(),
                investigated: s.investigated.clone(),
                learned: s.learned.clone(),
                completed: s.completed.clone(),
                next_steps: s.next_steps.clone(),
                notes: s.notes.clone(),
                prompt_number: batch.prompt_number,
                discovery_tokens: batch.discovery_tokens,
                created_at: created_at.clone(),
                created_at_epoch: epoch,
            })
        }
        None => None,
    };

    crate::memory::queue::mark_processed(&tx, &batch.processed_message_ids)?;

    tx.commit()?;

    tracing::debug!(
        observations = observations.len(),
        summary = summary.is_some(),
        epoch,
        "generation batch stored"
    );

    Ok(StoredBatch {
        observations,
        summary,
        created_at_epoch: epoch,
    })
}

fn insert_observation(
    tx: &Transaction,
    batch: &BatchWrite,
    obs: &ParsedObservation,
    created_at: &str,
    epoch: i64,
) -> Result<i64> {
    tx.execute(
        "INSERT INTO observations (memory_session_id, project, type, title, subtitle, facts,
             narrative, concepts, files_read, files_modified, prompt_number, discovery_tokens,
             created_at, created_at_epoch)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            batch.memory_session_id,
            batch.project,
            obs.obs_type,
            obs.title,
            obs.subtitle,
            serde_json::to_string(&obs.facts)?,
            obs.narrative,
            serde_json::to_string(&obs.concepts)?,
            serde_json::to_string(&obs.files_read)?,
            serde_json::to_string(&obs.files_modified)?,
            batch.prompt_number,
            batch.discovery_tokens,
            created_at,
            epoch,
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

fn insert_summary(
    tx: &Transaction,
    batch: &BatchWrite,
    s: &ParsedSummary,
    created_at: &str,
    epoch: i64,
) -> Result<i64> {
    tx.execute(
        "INSERT INTO session_summaries (memory_session_id, project, request, investigated,
             learned, completed, next_steps, notes, prompt_number, discovery_tokens,
             created_at, created_at_epoch)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            batch.memory_session_id,
            batch.project,
            s.request,
            s.investigated,
            s.learned,
            s.completed,
            s.next_steps,
            s.notes,
            batch.prompt_number,
            batch.discovery_tokens,
            created_at,
            epoch,
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

/// Record a user prompt. Returns the stored row.
pub fn store_user_prompt(
    conn: &Connection,
    content_session_id: &str,
    project: &str,
    prompt_number: i64,
    prompt_text: &str,
    override_epoch: Option<i64>,
) -> Result<UserPrompt> {
    let (created_at, epoch) = timestamp_pair(override_epoch);
    conn.execute(
        "INSERT INTO user_prompts (content_session_id, project, prompt_number, prompt_text,
             created_at, created_at_epoch)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![content_session_id, project, prompt_number, prompt_text, created_at, epoch],
    )?;
    Ok(UserPrompt {
        id: conn.last_insert_rowid(),
        content_session_id: content_session_id.to_string(),
        project: project.to_string(),
        prompt_number,
        prompt_text: prompt_text.to_string(),
        created_at,
        created_at_epoch: epoch,
    })
}

fn json_list(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

/// Map a row selected with [`OBSERVATION_COLUMNS`].
pub fn observation_from_row(row: &Row) -> rusqlite::Result<Observation> {
    Ok(Observation {
        id: row.get(0)?,
        memory_session_id: row.get(1)?,
        project: row.get(2)?,
        obs_type: row.get(3)?,
        title: row.get(4)?,
        subtitle: row.get(5)?,
        facts: json_list(row.get(6)?),
        narrative: row.get(7)?,
        concepts: json_list(row.get(8)?),
        files_read: json_list(row.get(9)?),
        files_modified: json_list(row.get(10)?),
        prompt_number: row.get(11)?,
        discovery_tokens: row.get(12)?,
        created_at: row.get(13)?,
        created_at_epoch: row.get(14)?,
    })
}

/// Map a row selected with [`SUMMARY_COLUMNS`].
pub fn summary_from_row(row: &Row) -> rusqlite::Result<SessionSummary> {
    Ok(SessionSummary {
        id: row.get(0)?,
        memory_session_id: row.get(1)?,
        project: row.get(2)?,
        request: row.get(3)?,
        investigated: row.get(4)?,
        learned: row.get(5)?,
        completed: row.get(6)?,
        next_steps: row.get(7)?,
        notes: row.get(8)?,
        prompt_number: row.get(9)?,
        discovery_tokens: row.get(10)?,
        created_at: row.get(11)?,
        created_at_epoch: row.get(12)?,
    })
}

/// Map a row selected with [`PROMPT_COLUMNS`].
pub fn prompt_from_row(row: &Row) -> rusqlite::Result<UserPrompt> {
    Ok(UserPrompt {
        id: row.get(0)?,
        content_session_id: row.get(1)?,
        project: row.get(2)?,
        prompt_number: row.get(3)?,
        prompt_text: row.get(4)?,
        created_at: row.get(5)?,
        created_at_epoch: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;

    fn sample_observation() -> ParsedObservation {
        ParsedObservation {
            obs_type: "discovery".into(),
            title: Some("Found the config loader".into()),
            facts: vec!["config is TOML".into(), "env overrides win".into()],
            narrative: Some("Read config.rs".into()),
            concepts: vec!["how-it-works".into()],
            files_read: vec!["src/config.rs".into()],
            ..Default::default()
        }
    }

    #[test]
    fn timestamp_pair_uses_override() {
        let (iso, epoch) = timestamp_pair(Some(1_700_000_000_123));
        assert_eq!(epoch, 1_700_000_000_123);
        assert_eq!(iso, "2023-11-14T22:13:20.123Z");
    }

    #[test]
    fn store_batch_writes_observations_and_summary() {
        let mut conn = open_memory_database().unwrap();
        let batch = BatchWrite {
            memory_session_id: "mem-1".into(),
            project: "demo".into(),
            observations: vec![sample_observation(), sample_observation()],
            summary: Some(ParsedSummary {
                request: Some("wire the loader".into()),
                ..Default::default()
            }),
            prompt_number: Some(2),
            ..Default::default()
        };

        let stored = store_batch(&mut conn, &batch).unwrap();
        assert_eq!(stored.observations.len(), 2);
        assert!(stored.summary.is_some());
        assert!(stored.observations[0].id < stored.observations[1].id);

        let obs = conn
            .query_row(
                &format!("SELECT {OBSERVATION_COLUMNS} FROM observations WHERE id = ?1"),
                [stored.observations[0].id],
                observation_from_row,
            )
            .unwrap();
        assert_eq!(obs.facts, vec!["config is TOML", "env overrides win"]);
        assert_eq!(obs.created_at_epoch, stored.created_at_epoch);
    }

    #[test]
    fn store_user_prompt_round_trips() {
        let conn = open_memory_database().unwrap();
        let prompt = store_user_prompt(&conn, "c-1", "demo", 1, "fix the bug", Some(42)).unwrap();
        let back = conn
            .query_row(
                &format!("SELECT {PROMPT_COLUMNS} FROM user_prompts WHERE id = ?1"),
                [prompt.id],
                prompt_from_row,
            )
            .unwrap();
        assert_eq!(back, prompt);
    }
}

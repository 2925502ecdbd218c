//! Durable pending-message queue.
//!
//! Every observation/summarize request is written here before it enters a session's
//! in-memory queue. Status moves `pending` → `processing` when a drain claims it, then to
//! `processed` inside the batch transaction, or `failed` on a terminal provider error.
//! Cancelled work goes back to `pending`; rows stuck in `processing` after a crash are reset
//! on startup and re-enqueued.

use anyhow::Result;
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::memory::store::now_epoch_ms;
use crate::memory::types::{PendingMessage, PendingPayload};

/// Persist a work item. Returns it with its row id and enqueue time.
pub fn enqueue(
    conn: &Connection,
    session_db_id: i64,
    content_session_id: &str,
    payload: &PendingPayload,
) -> Result<PendingMessage> {
    let now = now_epoch_ms();
    conn.execute(
        "INSERT INTO pending_messages (session_db_id, content_session_id, message_type, payload,
             status, created_at_epoch)
         VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
        params![
            session_db_id,
            content_session_id,
            payload.kind(),
            serde_json::to_string(payload)?,
            now
        ],
    )?;
    Ok(PendingMessage {
        id: conn.last_insert_rowid(),
        payload: payload.clone(),
        enqueued_at_epoch: now,
    })
}

fn update_ids(
    conn: &Connection,
    sql_prefix: &str,
    leading: &[&dyn rusqlite::ToSql],
    ids: &[i64],
) -> Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }
    let offset = leading.len();
    let placeholders: Vec<String> = (0..ids.len())
        .map(|i| format!("?{}", i + offset + 1))
        .collect();
    let sql = format!("{sql_prefix} WHERE id IN ({})", placeholders.join(", "));

    let mut values: Vec<&dyn rusqlite::ToSql> = leading.to_vec();
    for id in ids {
        values.push(id);
    }
    Ok(conn.execute(&sql, values.as_slice())?)
}

/// Claim rows for a drain.
pub fn mark_processing(conn: &Connection, ids: &[i64]) -> Result<usize> {
    let now = now_epoch_ms();
    update_ids(
        conn,
        "UPDATE pending_messages SET status = 'processing', started_processing_at_epoch = ?1",
        &[&now],
        ids,
    )
}

/// Mark rows consumed by a committed batch. Called inside the batch transaction.
pub fn mark_processed(conn: &Connection, ids: &[i64]) -> Result<usize> {
    let now = now_epoch_ms();
    update_ids(
        conn,
        "UPDATE pending_messages SET status = 'processed', completed_at_epoch = ?1",
        &[&now],
        ids,
    )
}

/// Terminal failure for a batch.
pub fn mark_failed(conn: &Connection, ids: &[i64], error: &str) -> Result<usize> {
    let now = now_epoch_ms();
    update_ids(
        conn,
        "UPDATE pending_messages SET status = 'failed', retry_count = retry_count + 1, \
         completed_at_epoch = ?1, error = ?2",
        &[&now, &error],
        ids,
    )
}

/// Return cancelled work to the queue.
pub fn reset_to_pending(conn: &Connection, ids: &[i64]) -> Result<usize> {
    update_ids(
        conn,
        "UPDATE pending_messages SET status = 'pending', started_processing_at_epoch = NULL",
        &[],
        ids,
    )
}

/// Reset every row left in `processing` (the previous process died mid-drain).
pub fn reset_stuck(conn: &Connection) -> Result<usize> {
    reset_stuck_except(conn, &[])
}

/// Like [`reset_stuck`], but leaves rows owned by a live generation alone.
pub fn reset_stuck_except(conn: &Connection, in_flight: &[i64]) -> Result<usize> {
    let mut select = conn.prepare("SELECT id FROM pending_messages WHERE status = 'processing'")?;
    let stuck = select
        .query_map([], |row| row.get::<_, i64>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let mut update = conn.prepare(
        "UPDATE pending_messages SET status = 'pending', started_processing_at_epoch = NULL
         WHERE id = ?1",
    )?;
    let mut n = 0;
    for id in stuck.iter().filter(|id| !in_flight.contains(*id)) {
        n += update.execute([id])?;
    }
    if n > 0 {
        tracing::warn!(count = n, "reset stuck pending messages");
    }
    Ok(n)
}

/// A pending row joined with the session it belongs to.
#[derive(Debug, Clone)]
pub struct RecoverableMessage {
    pub session_db_id: i64,
    pub content_session_id: String,
    pub message: PendingMessage,
}

/// All `pending` rows in enqueue order. Rows whose payload no longer parses are marked failed.
pub fn load_pending(conn: &Connection) -> Result<Vec<RecoverableMessage>> {
    let mut stmt = conn.prepare(
        "SELECT id, session_db_id, content_session_id, payload, created_at_epoch
         FROM pending_messages WHERE status = 'pending' ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(rows.len());
    for (id, session_db_id, content_session_id, raw, enqueued_at_epoch) in rows {
        match serde_json::from_str::<PendingPayload>(&raw) {
            Ok(payload) => out.push(RecoverableMessage {
                session_db_id,
                content_session_id,
                message: PendingMessage {
                    id,
                    payload,
                    enqueued_at_epoch,
                },
            }),
            Err(e) => {
                tracing::warn!(id, error = %e, "dropping unparseable pending message");
                mark_failed(conn, &[id], &format!("invalid payload: {e}"))?;
            }
        }
    }
    Ok(out)
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct QueueCounts {
    pub pending: i64,
    pub processing: i64,
    pub processed: i64,
    pub failed: i64,
}

pub fn queue_counts(conn: &Connection) -> Result<QueueCounts> {
    Ok(conn.query_row(
        "SELECT
            COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN status = 'processing' THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN status = 'processed' THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0)
         FROM pending_messages",
        [],
        |row| {
            Ok(QueueCounts {
                pending: row.get(0)?,
                processing: row.get(1)?,
                processed: row.get(2)?,
                failed: row.get(3)?,
            })
        },
    )?)
}

/// Delete processed rows older than `before_epoch`.
pub fn purge_processed(conn: &Connection, before_epoch: i64) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM pending_messages WHERE status = 'processed' AND completed_at_epoch < ?1",
        [before_epoch],
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;
    use crate::memory::sessions::init_session;
    use crate::memory::types::{ObservationPayload, SummarizePayload};

    fn observation(tool: &str) -> PendingPayload {
        PendingPayload::Observation(ObservationPayload {
            tool_name: tool.into(),
            tool_input: serde_json::json!({"path": "src/lib.rs"}),
            tool_response: serde_json::json!("ok"),
            cwd: None,
            prompt_number: 1,
        })
    }

    #[test]
    fn lifecycle_pending_processing_processed() {
        let conn = open_memory_database().unwrap();
        let session = init_session(&conn, "c-1", "demo", Some("hello")).unwrap().session;

        let a = enqueue(&conn, session.id, "c-1", &observation("Read")).unwrap();
        let summarize = PendingPayload::Summarize(SummarizePayload::default());
        let b = enqueue(&conn, session.id, "c-1", &summarize).unwrap();

        assert_eq!(mark_processing(&conn, &[a.id, b.id]).unwrap(), 2);
        assert_eq!(queue_counts(&conn).unwrap().processing, 2);

        mark_processed(&conn, &[a.id]).unwrap();
        mark_failed(&conn, &[b.id], "boom").unwrap();
        let counts = queue_counts(&conn).unwrap();
        assert_eq!(counts.processed, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.pending, 0);
    }

    #[test]
    fn crash_recovery_resets_and_reloads_in_order() {
        let conn = open_memory_database().unwrap();
        let session = init_session(&conn, "c-1", "demo", None).unwrap().session;

        let a = enqueue(&conn, session.id, "c-1", &observation("Read")).unwrap();
        let b = enqueue(&conn, session.id, "c-1", &observation("Edit")).unwrap();
        mark_processing(&conn, &[a.id]).unwrap();

        assert_eq!(reset_stuck(&conn).unwrap(), 1);
        let pending = load_pending(&conn).unwrap();
        let ids: Vec<i64> = pending.iter().map(|m| m.message.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
        assert_eq!(pending[0].message.enqueued_at_epoch, a.enqueued_at_epoch);
        assert_eq!(pending[1].message.payload, observation("Edit"));
    }

    #[test]
    fn live_generations_keep_their_rows() {
        let conn = open_memory_database().unwrap();
        let session = init_session(&conn, "c-1", "demo", None).unwrap().session;

        let live = enqueue(&conn, session.id, "c-1", &observation("Read")).unwrap();
        let dead = enqueue(&conn, session.id, "c-1", &observation("Edit")).unwrap();
        mark_processing(&conn, &[live.id, dead.id]).unwrap();

        assert_eq!(reset_stuck_except(&conn, &[live.id]).unwrap(), 1);
        let pending = load_pending(&conn).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message.id, dead.id);
        assert_eq!(queue_counts(&conn).unwrap().processing, 1);
    }

    #[test]
    fn empty_id_list_is_noop() {
        let conn = open_memory_database().unwrap();
        assert_eq!(mark_processing(&conn, &[]).unwrap(), 0);
    }
}

//! `sdk_sessions` rows: create-or-continue by correlation id, prompt counter, memory id.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::memory::store::timestamp_pair;
use crate::memory::types::SessionRecord;

const SESSION_COLUMNS: &str = "id, content_session_id, memory_session_id, project, user_prompt, \
     prompt_counter, status, started_at, started_at_epoch, completed_at_epoch";

fn session_from_row(row: &rusqlite::Row) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        id: row.get(0)?,
        content_session_id: row.get(1)?,
        memory_session_id: row.get(2)?,
        project: row.get(3)?,
        user_prompt: row.get(4)?,
        prompt_counter: row.get(5)?,
        status: row.get(6)?,
        started_at: row.get(7)?,
        started_at_epoch: row.get(8)?,
        completed_at_epoch: row.get(9)?,
    })
}

/// Result of [`init_session`].
#[derive(Debug, Clone)]
pub struct SessionInit {
    pub session: SessionRecord,
    /// The prompt number assigned to this call (1 for a new session).
    pub prompt_number: i64,
    pub created: bool,
}

/// Create a session for `content_session_id`, or continue it and bump its prompt counter.
///
/// The counter is monotonic per session. A completed session that receives a new prompt
/// becomes active again.
pub fn init_session(
    conn: &Connection,
    content_session_id: &str,
    project: &str,
    user_prompt: Option<&str>,
) -> Result<SessionInit> {
    let (started_at, epoch) = timestamp_pair(None);
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO sdk_sessions (content_session_id, project, user_prompt,
             prompt_counter, status, started_at, started_at_epoch)
         VALUES (?1, ?2, ?3, 1, 'active', ?4, ?5)",
        params![content_session_id, project, user_prompt, started_at, epoch],
    )?;

    let created = inserted > 0;
    if !created {
        conn.execute(
            "UPDATE sdk_sessions
             SET prompt_counter = prompt_counter + 1,
                 status = 'active',
                 completed_at_epoch = NULL,
                 user_prompt = COALESCE(user_prompt, ?2)
             WHERE content_session_id = ?1",
            params![content_session_id, user_prompt],
        )?;
    }

    let session = get_by_content_id(conn, content_session_id)?
        .context("session row missing after upsert")?;

    Ok(SessionInit {
        prompt_number: session.prompt_counter,
        session,
        created,
    })
}

pub fn get_by_content_id(
    conn: &Connection,
    content_session_id: &str,
) -> Result<Option<SessionRecord>> {
    Ok(conn
        .query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sdk_sessions WHERE content_session_id = ?1"),
            [content_session_id],
            session_from_row,
        )
        .optional()?)
}

pub fn get_by_id(conn: &Connection, id: i64) -> Result<Option<SessionRecord>> {
    Ok(conn
        .query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sdk_sessions WHERE id = ?1"),
            [id],
            session_from_row,
        )
        .optional()?)
}

/// Record the memory-session id once the first generation succeeded. Never overwrites.
pub fn set_memory_session_id(conn: &Connection, id: i64, memory_session_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE sdk_sessions SET memory_session_id = ?2
         WHERE id = ?1 AND memory_session_id IS NULL",
        params![id, memory_session_id],
    )?;
    Ok(())
}

pub fn complete_session(conn: &Connection, id: i64) -> Result<bool> {
    let (_, epoch) = timestamp_pair(None);
    let n = conn.execute(
        "UPDATE sdk_sessions SET status = 'completed', completed_at_epoch = ?2 WHERE id = ?1",
        params![id, epoch],
    )?;
    Ok(n > 0)
}

pub fn mark_failed(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("UPDATE sdk_sessions SET status = 'failed' WHERE id = ?1", [id])?;
    Ok(())
}

pub fn count_active(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM sdk_sessions WHERE status = 'active'",
        [],
        |r| r.get(0),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;

    #[test]
    fn prompt_counter_is_monotonic() {
        let conn = open_memory_database().unwrap();
        let first = init_session(&conn, "c-1", "demo", Some("first")).unwrap();
        assert!(first.created);
        assert_eq!(first.prompt_number, 1);

        let second = init_session(&conn, "c-1", "demo", Some("second")).unwrap();
        assert!(!second.created);
        assert_eq!(second.prompt_number, 2);
        assert_eq!(second.session.id, first.session.id);
        assert_eq!(second.session.user_prompt.as_deref(), Some("first"));
    }

    #[test]
    fn memory_session_id_is_set_once() {
        let conn = open_memory_database().unwrap();
        let s = init_session(&conn, "c-1", "demo", None).unwrap().session;
        set_memory_session_id(&conn, s.id, "mem-a").unwrap();
        set_memory_session_id(&conn, s.id, "mem-b").unwrap();
        let back = get_by_id(&conn, s.id).unwrap().unwrap();
        assert_eq!(back.memory_session_id.as_deref(), Some("mem-a"));
    }

    #[test]
    fn completed_session_reactivates_on_new_prompt() {
        let conn = open_memory_database().unwrap();
        let s = init_session(&conn, "c-1", "demo", None).unwrap().session;
        assert!(complete_session(&conn, s.id).unwrap());
        assert_eq!(count_active(&conn).unwrap(), 0);

        let again = init_session(&conn, "c-1", "demo", None).unwrap();
        assert_eq!(again.session.status, "active");
        assert!(again.session.completed_at_epoch.is_none());
    }
}

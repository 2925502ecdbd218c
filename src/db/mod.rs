pub mod manager;
pub mod migrations;
pub mod schema;

use anyhow::{anyhow, Context, Result};
use rusqlite::Connection;
use serde::Serialize;
use sqlite_vec::sqlite3_vec_init;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Once};

static SQLITE_VEC_INIT: Once = Once::new();

/// Register the sqlite-vec extension globally. Safe to call multiple times.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

/// Open (or create) the hindsight store at the given path, with sqlite-vec loaded,
/// schema initialized and migrations applied.
pub fn open_database(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    load_sqlite_vec();

    let mut conn = Connection::open(path)
        .with_context(|| format!("failed to open database at {}", path.display()))?;

    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(std::time::Duration::from_millis(5_000))?;

    schema::init_schema(&conn).context("failed to initialize schema")?;
    migrations::run_migrations(&mut conn).context("failed to run migrations")?;

    tracing::info!(path = %path.display(), "database initialized");
    Ok(conn)
}

/// Open a fully migrated in-memory store.
pub fn open_memory_database() -> Result<Connection> {
    load_sqlite_vec();
    let mut conn = Connection::open_in_memory().context("failed to open in-memory database")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    schema::init_schema(&conn).context("failed to initialize schema")?;
    migrations::run_migrations(&mut conn).context("failed to run migrations")?;
    Ok(conn)
}

/// The single long-lived store connection shared by the whole daemon.
///
/// Closures passed to [`Database::call`] run on the blocking pool. A panic inside one
/// poisons the mutex; the guard is recovered because SQLite has already rolled back the
/// aborted transaction, so later requests see a consistent connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Option<Connection>>>,
    path: Option<PathBuf>,
}

impl Database {
    pub fn new(conn: Connection, path: Option<PathBuf>) -> Self {
        Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            path,
        }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = open_database(path)?;
        Ok(Self::new(conn, Some(path.to_path_buf())))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(open_memory_database()?, None))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` against the connection on the blocking thread pool.
    pub async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || with_conn(&conn, f))
            .await
            .context("database task failed")?
    }

    /// Drop the connection. Subsequent calls fail with a storage error.
    pub async fn close(&self) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(c) = guard.take() {
                c.close().map_err(|(_, e)| anyhow!("failed to close database: {e}"))?;
                tracing::info!("database closed");
            }
            Ok(())
        })
        .await
        .context("database close task failed")?
    }

    pub fn is_closed(&self) -> bool {
        self.conn
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_none()
    }
}

fn with_conn<F, T>(conn: &Mutex<Option<Connection>>, f: F) -> Result<T>
where
    F: FnOnce(&mut Connection) -> Result<T>,
{
    let mut guard = conn.lock().unwrap_or_else(|p| p.into_inner());
    let c = guard.as_mut().ok_or_else(|| anyhow!("database is closed"))?;
    f(c)
}

/// Result of [`check_database_health`].
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub integrity_ok: bool,
    pub integrity_details: String,
    pub schema_version: u32,
    pub sqlite_vec_version: String,
    pub embedding_model: Option<String>,
    pub session_count: i64,
    pub observation_count: i64,
    pub summary_count: i64,
    pub prompt_count: i64,
    pub pending_count: i64,
    pub vector_document_count: i64,
}

/// Integrity check plus schema/extension versions and row counts.
pub fn check_database_health(conn: &Connection) -> Result<HealthReport> {
    let integrity: String = conn.query_row("PRAGMA integrity_check", [], |r| r.get(0))?;
    let sqlite_vec_version: String = conn.query_row("SELECT vec_version()", [], |r| r.get(0))?;

    let count = |table: &str| -> Result<i64> {
        Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?)
    };

    Ok(HealthReport {
        integrity_ok: integrity == "ok",
        integrity_details: integrity,
        schema_version: migrations::get_schema_version(conn)?,
        sqlite_vec_version,
        embedding_model: migrations::get_embedding_model(conn)?,
        session_count: count("sdk_sessions")?,
        observation_count: count("observations")?,
        summary_count: count("session_summaries")?,
        prompt_count: count("user_prompts")?,
        pending_count: conn.query_row(
            "SELECT COUNT(*) FROM pending_messages WHERE status IN ('pending','processing')",
            [],
            |r| r.get(0),
        )?,
        vector_document_count: count("vector_documents")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_report_on_fresh_store() {
        let conn = open_memory_database().unwrap();
        let report = check_database_health(&conn).unwrap();
        assert!(report.integrity_ok);
        assert_eq!(report.schema_version, migrations::CURRENT_SCHEMA_VERSION);
        assert_eq!(report.observation_count, 0);
        assert!(!report.sqlite_vec_version.is_empty());
    }

    #[tokio::test]
    async fn closed_database_rejects_calls() {
        let db = Database::in_memory().unwrap();
        let n: i64 = db
            .call(|c| Ok(c.query_row("SELECT 1", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(n, 1);

        db.close().await.unwrap();
        assert!(db.is_closed());
        assert!(db.call(|_| Ok(())).await.is_err());
    }

    #[tokio::test]
    async fn failed_call_leaves_connection_usable() {
        let db = Database::in_memory().unwrap();
        let err = db
            .call(|c| Ok(c.execute("INSERT INTO no_such_table VALUES (1)", [])?))
            .await;
        assert!(err.is_err());
        let ok: i64 = db
            .call(|c| Ok(c.query_row("SELECT COUNT(*) FROM observations", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(ok, 0);
    }

    #[test]
    fn open_database_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("hindsight.db");
        let conn = open_database(&path).unwrap();
        assert!(path.exists());
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |r| r.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}

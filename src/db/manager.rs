//! Composition root for persistence: the relational store plus its derived vector index.

use anyhow::Result;
use std::sync::Arc;

use super::Database;
use crate::config::HindsightConfig;
use crate::embedding;
use crate::lifecycle::process::ProcessRegistry;
use crate::memory::store::{self, BatchWrite, StoredBatch};
use crate::memory::types::UserPrompt;
use crate::search::SearchOrchestrator;
use crate::vector::noop::NoopVectorIndex;
use crate::vector::sqlite_vec::SqliteVecIndex;
use crate::vector::SharedVectorIndex;

#[derive(Clone)]
pub struct DatabaseManager {
    db: Database,
    vector: SharedVectorIndex,
    search: SearchOrchestrator,
}

impl DatabaseManager {
    /// Open the configured store and select the vector backend.
    ///
    /// A backend that cannot be built (missing model files, no command configured) is
    /// replaced by the no-op index; the worker keeps running relational-only.
    pub fn open(config: &HindsightConfig, processes: Arc<ProcessRegistry>) -> Result<Self> {
        let db = Database::open(config.resolved_db_path())?;
        let vector: SharedVectorIndex = match config.vector.backend.as_str() {
            "none" | "" => Arc::new(NoopVectorIndex),
            "sqlite-vec" => match embedding::create_provider(&config.vector, processes) {
                Ok(embedder) => Arc::new(SqliteVecIndex::new(db.clone(), embedder)),
                Err(e) => {
                    tracing::warn!(error = %e, "vector backend unavailable, continuing without it");
                    Arc::new(NoopVectorIndex)
                }
            },
            other => {
                tracing::warn!(backend = other, "unknown vector backend, continuing without it");
                Arc::new(NoopVectorIndex)
            }
        };
        Ok(Self::from_parts(db, vector))
    }

    pub fn from_parts(db: Database, vector: SharedVectorIndex) -> Self {
        let search = SearchOrchestrator::new(db.clone(), Arc::clone(&vector));
        Self { db, vector, search }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn vector(&self) -> &SharedVectorIndex {
        &self.vector
    }

    pub fn search(&self) -> &SearchOrchestrator {
        &self.search
    }

    /// Persist one generation batch in a single transaction, then sync the vector index.
    pub async fn store_batch(&self, batch: BatchWrite) -> Result<StoredBatch> {
        let stored = self
            .db
            .call(move |conn| store::store_batch(conn, &batch))
            .await?;
        self.vector.sync_batch(&stored).await;
        Ok(stored)
    }

    pub async fn store_user_prompt(
        &self,
        content_session_id: String,
        project: String,
        prompt_number: i64,
        text: String,
    ) -> Result<UserPrompt> {
        let prompt = self
            .db
            .call(move |conn| {
                store::store_user_prompt(
                    conn,
                    &content_session_id,
                    &project,
                    prompt_number,
                    &text,
                    None,
                )
            })
            .await?;
        self.vector.sync_prompt(&prompt).await;
        Ok(prompt)
    }

    /// Close the vector backend's external resources, then the store.
    pub async fn close(&self) -> Result<()> {
        self.vector.close().await;
        self.db.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::ParsedObservation;

    #[tokio::test]
    async fn store_batch_then_close() {
        let manager =
            DatabaseManager::from_parts(Database::in_memory().unwrap(), Arc::new(NoopVectorIndex));
        let stored = manager
            .store_batch(BatchWrite {
                memory_session_id: "mem-1".into(),
                project: "demo".into(),
                observations: vec![ParsedObservation {
                    obs_type: "discovery".into(),
                    title: Some("found it".into()),
                    ..Default::default()
                }],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(stored.observations.len(), 1);

        manager.close().await.unwrap();
        assert!(manager.db().is_closed());
        let err = manager.db().call(|_| Ok(())).await.unwrap_err();
        assert!(err.to_string().contains("closed"));
    }

    #[test]
    fn disabled_backend_opens_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = HindsightConfig::default();
        config.storage.data_dir = dir.path().to_string_lossy().into_owned();
        config.vector.backend = "none".into();
        let manager = DatabaseManager::open(&config, Arc::new(ProcessRegistry::new(1))).unwrap();
        assert!(!manager.vector().is_enabled());
    }
}

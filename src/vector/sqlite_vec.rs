//! sqlite-vec backed index: `vector_documents` metadata plus the `vector_embeddings` vec0
//! table, both inside the main store file.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use rusqlite::{params, Connection};

use super::{
    embedding_to_bytes, observation_documents, prompt_documents, summary_documents,
    BackfillReport, VectorDocument, VectorError, VectorIndex, VectorMatch,
};
use crate::db::Database;
use crate::embedding::EmbeddingProvider;
use crate::memory::query::{observations_by_ids, prompts_by_ids, summaries_by_ids, QueryFilters};
use crate::memory::types::{DocType, Observation, SessionSummary, UserPrompt};

/// Rows embedded per backfill round trip.
const BACKFILL_CHUNK: usize = 64;

/// Metadata every document of one source row shares.
#[derive(Debug, Clone)]
struct SourceRow {
    sqlite_id: i64,
    doc_type: DocType,
    project: String,
    memory_session_id: Option<String>,
    created_at_epoch: i64,
}

pub struct SqliteVecIndex {
    db: Database,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl SqliteVecIndex {
    pub fn new(db: Database, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self { db, embedder }
    }

    /// Embed and write `docs`. Returns the number of documents written.
    async fn write_documents(
        &self,
        source: SourceRow,
        docs: Vec<VectorDocument>,
    ) -> Result<usize, VectorError> {
        if docs.is_empty() {
            return Ok(0);
        }
        let texts: Vec<String> = docs.iter().map(|d| d.text.clone()).collect();
        let embeddings = self
            .embedder
            .embed_batch(&texts)
            .await
            .map_err(|e| VectorError::Embedding(format!("{e:#}")))?;

        let written = self
            .db
            .call(move |conn| {
                let tx = conn.transaction()?;
                for (doc, emb) in docs.iter().zip(embeddings.iter()) {
                    upsert_document(&tx, &source, doc, emb)?;
                }
                tx.commit()?;
                Ok(docs.len())
            })
            .await?;
        Ok(written)
    }

    async fn sync_logged(&self, source: SourceRow, docs: Vec<VectorDocument>) {
        let (doc_type, id) = (source.doc_type, source.sqlite_id);
        match self.write_documents(source, docs).await {
            Ok(n) => tracing::debug!(%doc_type, id, documents = n, "vector sync"),
            Err(e) => tracing::warn!(%doc_type, id, error = %e, "vector sync failed"),
        }
    }
}

fn upsert_document(
    conn: &Connection,
    source: &SourceRow,
    doc: &VectorDocument,
    embedding: &[f32],
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO vector_documents
             (doc_id, sqlite_id, doc_type, field, project, memory_session_id, created_at_epoch)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            doc.doc_id,
            source.sqlite_id,
            source.doc_type.as_str(),
            doc.field,
            source.project,
            source.memory_session_id,
            source.created_at_epoch,
        ],
    )?;
    // vec0 has no upsert
    conn.execute("DELETE FROM vector_embeddings WHERE doc_id = ?1", [&doc.doc_id])?;
    conn.execute(
        "INSERT INTO vector_embeddings (doc_id, embedding) VALUES (?1, ?2)",
        params![doc.doc_id, embedding_to_bytes(embedding)],
    )?;
    Ok(())
}

fn observation_source(o: &Observation) -> SourceRow {
    SourceRow {
        sqlite_id: o.id,
        doc_type: DocType::Observation,
        project: o.project.clone(),
        memory_session_id: Some(o.memory_session_id.clone()),
        created_at_epoch: o.created_at_epoch,
    }
}

fn summary_source(s: &SessionSummary) -> SourceRow {
    SourceRow {
        sqlite_id: s.id,
        doc_type: DocType::SessionSummary,
        project: s.project.clone(),
        memory_session_id: Some(s.memory_session_id.clone()),
        created_at_epoch: s.created_at_epoch,
    }
}

fn prompt_source(p: &UserPrompt) -> SourceRow {
    SourceRow {
        sqlite_id: p.id,
        doc_type: DocType::UserPrompt,
        project: p.project.clone(),
        memory_session_id: None,
        created_at_epoch: p.created_at_epoch,
    }
}

/// Ids of rows in `table` with no document of `doc_type` yet.
fn missing_ids(
    conn: &Connection,
    table: &str,
    doc_type: DocType,
    live_only: bool,
) -> Result<Vec<i64>> {
    let archived = if live_only { "AND t.archived_at_epoch IS NULL" } else { "" };
    let sql = format!(
        "SELECT t.id FROM {table} t
         WHERE NOT EXISTS (
             SELECT 1 FROM vector_documents v WHERE v.doc_type = ?1 AND v.sqlite_id = t.id
         ) {archived}
         ORDER BY t.id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let ids = stmt
        .query_map([doc_type.as_str()], |r| r.get(0))?
        .collect::<Result<Vec<i64>, _>>()?;
    Ok(ids)
}

fn unbounded() -> QueryFilters {
    QueryFilters {
        limit: Some(crate::memory::query::MAX_LIMIT),
        ..Default::default()
    }
}

#[async_trait]
impl VectorIndex for SqliteVecIndex {
    fn backend_name(&self) -> &'static str {
        "sqlite-vec"
    }

    fn is_enabled(&self) -> bool {
        true
    }

    async fn sync_observation(&self, observation: &Observation) {
        self.sync_logged(observation_source(observation), observation_documents(observation))
            .await;
    }

    async fn sync_summary(&self, summary: &SessionSummary) {
        self.sync_logged(summary_source(summary), summary_documents(summary))
            .await;
    }

    async fn sync_prompt(&self, prompt: &UserPrompt) {
        self.sync_logged(prompt_source(prompt), prompt_documents(prompt))
            .await;
    }

    async fn query(
        &self,
        text: &str,
        doc_type: Option<DocType>,
        limit: usize,
    ) -> Result<Vec<VectorMatch>, VectorError> {
        let embedding = self
            .embedder
            .embed(text)
            .await
            .map_err(|e| VectorError::Embedding(format!("{e:#}")))?;

        // Over-fetch when filtering by type since the KNN runs before the filter.
        let k = (if doc_type.is_some() { limit * 3 } else { limit }).max(1);

        let matches = self
            .db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT e.doc_id, e.distance, d.sqlite_id, d.doc_type, d.project, d.created_at_epoch
                     FROM (SELECT doc_id, distance FROM vector_embeddings
                           WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2) e
                     JOIN vector_documents d ON d.doc_id = e.doc_id
                     ORDER BY e.distance",
                )?;
                let rows = stmt
                    .query_map(params![embedding_to_bytes(&embedding), k as i64], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, f64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, i64>(5)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        Ok(matches
            .into_iter()
            .filter_map(|(doc_id, distance, sqlite_id, ty, project, created_at_epoch)| {
                let ty: DocType = ty.parse().ok()?;
                Some(VectorMatch {
                    doc_id,
                    sqlite_id,
                    doc_type: ty,
                    project,
                    created_at_epoch,
                    distance: distance as f32,
                })
            })
            .filter(|m| doc_type.map_or(true, |t| t == m.doc_type))
            .take(limit)
            .collect())
    }

    async fn ensure_backfilled(&self) -> Result<BackfillReport, VectorError> {
        let (obs_ids, summary_ids, prompt_ids) = self
            .db
            .call(|conn| {
                Ok((
                    missing_ids(conn, "observations", DocType::Observation, true)?,
                    missing_ids(conn, "session_summaries", DocType::SessionSummary, true)?,
                    missing_ids(conn, "user_prompts", DocType::UserPrompt, false)?,
                ))
            })
            .await?;

        let mut report = BackfillReport::default();

        for chunk in obs_ids.chunks(BACKFILL_CHUNK) {
            let ids = chunk.to_vec();
            let rows = self
                .db
                .call(move |conn| observations_by_ids(conn, &ids, &unbounded()))
                .await?;
            for row in &rows {
                report.documents_added += self
                    .write_documents(observation_source(row), observation_documents(row))
                    .await?;
            }
            report.observations += rows.len();
        }

        for chunk in summary_ids.chunks(BACKFILL_CHUNK) {
            let ids = chunk.to_vec();
            let rows = self
                .db
                .call(move |conn| summaries_by_ids(conn, &ids, &unbounded()))
                .await?;
            for row in &rows {
                report.documents_added += self
                    .write_documents(summary_source(row), summary_documents(row))
                    .await?;
            }
            report.summaries += rows.len();
        }

        for chunk in prompt_ids.chunks(BACKFILL_CHUNK) {
            let ids = chunk.to_vec();
            let rows = self
                .db
                .call(move |conn| prompts_by_ids(conn, &ids, &unbounded()))
                .await?;
            for row in &rows {
                report.documents_added += self
                    .write_documents(prompt_source(row), prompt_documents(row))
                    .await?;
            }
            report.prompts += rows.len();
        }

        if report.documents_added > 0 {
            tracing::info!(
                observations = report.observations,
                summaries = report.summaries,
                prompts = report.prompts,
                documents = report.documents_added,
                "vector backfill complete"
            );
        }
        Ok(report)
    }

    async fn document_count(&self) -> Result<u64, VectorError> {
        let n: i64 = self
            .db
            .call(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM vector_documents", [], |r| r.get(0))?)
            })
            .await?;
        Ok(n as u64)
    }

    async fn close(&self) {
        self.embedder.close().await;
    }
}

/// Group matches by doc type, keeping rank order inside each bucket.
pub fn bucket_by_type(matches: &[VectorMatch]) -> HashMap<DocType, Vec<i64>> {
    let mut buckets: HashMap<DocType, Vec<i64>> = HashMap::new();
    for m in matches {
        let ids = buckets.entry(m.doc_type).or_default();
        if !ids.contains(&m.sqlite_id) {
            ids.push(m.sqlite_id);
        }
    }
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(doc_type: DocType, id: i64) -> VectorMatch {
        VectorMatch {
            doc_id: format!("{doc_type}_{id}"),
            sqlite_id: id,
            doc_type,
            project: "p".into(),
            created_at_epoch: 0,
            distance: 0.0,
        }
    }

    #[test]
    fn buckets_dedupe_and_keep_rank() {
        let matches = vec![
            hit(DocType::Observation, 5),
            hit(DocType::SessionSummary, 1),
            hit(DocType::Observation, 2),
            hit(DocType::Observation, 5),
        ];
        let buckets = bucket_by_type(&matches);
        assert_eq!(buckets[&DocType::Observation], vec![5, 2]);
        assert_eq!(buckets[&DocType::SessionSummary], vec![1]);
        assert!(!buckets.contains_key(&DocType::UserPrompt));
    }
}

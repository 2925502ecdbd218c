//! Derived, rebuildable semantic index over the relational rows.
//!
//! [`VectorIndex`] has two implementations: [`noop::NoopVectorIndex`] when the backend is
//! disabled and [`sqlite_vec::SqliteVecIndex`] (vec0 table in the same store file). Sync
//! calls never fail outward: the relational write is the source of truth and the index can
//! always be rebuilt with [`VectorIndex::ensure_backfilled`].

pub mod noop;
pub mod sqlite_vec;

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use crate::memory::store::StoredBatch;
use crate::memory::types::{DocType, Observation, SessionSummary, UserPrompt};

#[derive(Debug, Error)]
pub enum VectorError {
    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("vector storage error: {0}")]
    Storage(String),

    #[error("vector backend disabled")]
    Disabled,
}

impl From<anyhow::Error> for VectorError {
    fn from(e: anyhow::Error) -> Self {
        Self::Storage(format!("{e:#}"))
    }
}

/// One nearest-neighbour hit, pointing back at its relational row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorMatch {
    pub doc_id: String,
    pub sqlite_id: i64,
    pub doc_type: DocType,
    pub project: String,
    pub created_at_epoch: i64,
    pub distance: f32,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub observations: usize,
    pub summaries: usize,
    pub prompts: usize,
    pub documents_added: usize,
}

/// One searchable field of a source row.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorDocument {
    pub doc_id: String,
    pub field: String,
    pub text: String,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn backend_name(&self) -> &'static str;

    fn is_enabled(&self) -> bool;

    async fn sync_observation(&self, observation: &Observation);

    async fn sync_summary(&self, summary: &SessionSummary);

    async fn sync_prompt(&self, prompt: &UserPrompt);

    /// Up to `limit` nearest documents, optionally restricted to one doc type.
    async fn query(
        &self,
        text: &str,
        doc_type: Option<DocType>,
        limit: usize,
    ) -> Result<Vec<VectorMatch>, VectorError>;

    /// Index every relational row that has no documents yet. Idempotent.
    async fn ensure_backfilled(&self) -> Result<BackfillReport, VectorError>;

    async fn document_count(&self) -> Result<u64, VectorError>;

    async fn close(&self);

    /// Sync everything one generation batch stored.
    async fn sync_batch(&self, batch: &StoredBatch) {
        for obs in &batch.observations {
            self.sync_observation(obs).await;
        }
        if let Some(summary) = &batch.summary {
            self.sync_summary(summary).await;
        }
    }
}

pub type SharedVectorIndex = Arc<dyn VectorIndex>;

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

/// `obs_{id}_narrative`, `obs_{id}_text` (title + subtitle), `obs_{id}_fact_{n}`.
pub fn observation_documents(obs: &Observation) -> Vec<VectorDocument> {
    let mut docs = Vec::new();
    if let Some(narrative) = non_empty(obs.narrative.as_deref()) {
        docs.push(VectorDocument {
            doc_id: format!("obs_{}_narrative", obs.id),
            field: "narrative".into(),
            text: narrative.to_string(),
        });
    }
    let heading: Vec<&str> = [non_empty(obs.title.as_deref()), non_empty(obs.subtitle.as_deref())]
        .into_iter()
        .flatten()
        .collect();
    if !heading.is_empty() {
        docs.push(VectorDocument {
            doc_id: format!("obs_{}_text", obs.id),
            field: "text".into(),
            text: heading.join(" - "),
        });
    }
    for (n, fact) in obs.facts.iter().enumerate() {
        if let Some(fact) = non_empty(Some(fact)) {
            docs.push(VectorDocument {
                doc_id: format!("obs_{}_fact_{n}", obs.id),
                field: "fact".into(),
                text: fact.to_string(),
            });
        }
    }
    docs
}

/// `summary_{id}_{field}` for each non-empty summary field.
pub fn summary_documents(summary: &SessionSummary) -> Vec<VectorDocument> {
    summary
        .fields()
        .into_iter()
        .filter_map(|(field, value)| {
            non_empty(value).map(|text| VectorDocument {
                doc_id: format!("summary_{}_{field}", summary.id),
                field: field.to_string(),
                text: text.to_string(),
            })
        })
        .collect()
}

/// `prompt_{id}`.
pub fn prompt_documents(prompt: &UserPrompt) -> Vec<VectorDocument> {
    non_empty(Some(&prompt.prompt_text))
        .map(|text| VectorDocument {
            doc_id: format!("prompt_{}", prompt.id),
            field: "prompt".into(),
            text: text.to_string(),
        })
        .into_iter()
        .collect()
}

/// Convert an f32 embedding slice to raw bytes for sqlite-vec.
pub fn embedding_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            std::mem::size_of_val(embedding),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs() -> Observation {
        Observation {
            id: 7,
            memory_session_id: "m".into(),
            project: "p".into(),
            obs_type: "bugfix".into(),
            title: Some("Fixed race".into()),
            subtitle: None,
            facts: vec!["lock order matters".into(), "  ".into(), "use one mutex".into()],
            narrative: Some("The drain raced the enqueue.".into()),
            concepts: vec![],
            files_read: vec![],
            files_modified: vec![],
            prompt_number: None,
            discovery_tokens: 0,
            created_at: String::new(),
            created_at_epoch: 0,
        }
    }

    #[test]
    fn observation_doc_ids() {
        let ids: Vec<String> = observation_documents(&obs())
            .into_iter()
            .map(|d| d.doc_id)
            .collect();
        assert_eq!(
            ids,
            vec!["obs_7_narrative", "obs_7_text", "obs_7_fact_0", "obs_7_fact_2"]
        );
    }

    #[test]
    fn empty_prompt_has_no_document() {
        let prompt = UserPrompt {
            id: 3,
            content_session_id: "c".into(),
            project: "p".into(),
            prompt_number: 1,
            prompt_text: "   ".into(),
            created_at: String::new(),
            created_at_epoch: 0,
        };
        assert!(prompt_documents(&prompt).is_empty());
    }

    #[test]
    fn embedding_bytes_length() {
        let v = vec![1.0f32; 4];
        assert_eq!(embedding_to_bytes(&v).len(), 16);
    }
}

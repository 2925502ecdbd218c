//! Multi-strategy search over the relational store and the vector index.
//!
//! - no query text: relational only ([`Strategy::Sqlite`]);
//! - text and an enabled backend: nearest documents, recency cut, bucketed hydration
//!   ([`Strategy::Vector`]); a backend failure falls back to the relational path with the
//!   text dropped and `fell_back` set;
//! - text and no backend: an explicit empty result with reason `no_vector_backend`.
//!
//! Concept/type/file lookups intersect a relational metadata filter with vector rank when a
//! backend exists ([`Strategy::Hybrid`]), else they are plain relational lookups.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::Database;
use crate::memory::query::{
    observations_by_ids, prompts_by_ids, query_observations, query_prompts, query_summaries,
    summaries_by_ids, QueryFilters, SortOrder,
};
use crate::memory::store::now_epoch_ms;
use crate::memory::types::{DocType, Observation, SessionSummary, UserPrompt};
use crate::vector::sqlite_vec::bucket_by_type;
use crate::vector::{VectorError, VectorIndex};

/// Semantic matches older than this are dropped.
pub const RECENCY_WINDOW_DAYS: i64 = 90;
/// Nearest documents requested per vector query.
pub const VECTOR_BATCH: usize = 100;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

pub const REASON_NO_BACKEND: &str = "no_vector_backend";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Sqlite,
    Vector,
    Hybrid,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SearchQuery {
    pub query: Option<String>,
    /// Restrict to one row kind.
    pub doc_type: Option<DocType>,
    /// Ignore `query` and run the relational path.
    pub filter_only: bool,
    #[serde(flatten)]
    pub filters: QueryFilters,
}

impl SearchQuery {
    fn text(&self) -> Option<&str> {
        self.query.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }

    fn wants(&self, doc_type: DocType) -> bool {
        match self.doc_type {
            Some(t) => t == doc_type,
            None => doc_type == DocType::Observation || !self.filters.is_observation_only(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResults {
    pub observations: Vec<Observation>,
    pub sessions: Vec<SessionSummary>,
    pub prompts: Vec<UserPrompt>,
    pub strategy: Strategy,
    pub fell_back: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SearchResults {
    fn empty(strategy: Strategy) -> Self {
        Self {
            observations: Vec::new(),
            sessions: Vec::new(),
            prompts: Vec::new(),
            strategy,
            fell_back: false,
            reason: None,
        }
    }

    pub fn total(&self) -> usize {
        self.observations.len() + self.sessions.len() + self.prompts.len()
    }
}

/// Metadata lookups served by [`SearchOrchestrator::lookup`].
#[derive(Debug, Clone)]
pub enum Lookup {
    Concept(String),
    Types(Vec<String>),
    File(String),
}

impl Lookup {
    fn apply(&self, filters: &mut QueryFilters) {
        match self {
            Self::Concept(c) => filters.concept = Some(c.clone()),
            Self::Types(t) => filters.obs_types = t.clone(),
            Self::File(f) => filters.file = Some(f.clone()),
        }
    }

    fn as_text(&self) -> String {
        match self {
            Self::Concept(c) => c.clone(),
            Self::Types(t) => t.join(" "),
            Self::File(f) => f.clone(),
        }
    }
}

#[derive(Clone)]
pub struct SearchOrchestrator {
    db: Database,
    vector: Arc<dyn VectorIndex>,
}

impl SearchOrchestrator {
    pub fn new(db: Database, vector: Arc<dyn VectorIndex>) -> Self {
        Self { db, vector }
    }

    pub async fn search(&self, query: SearchQuery) -> Result<SearchResults> {
        let text = match query.text() {
            Some(t) if !query.filter_only => t.to_string(),
            _ => return self.sqlite_strategy(&query).await,
        };

        if !self.vector.is_enabled() {
            tracing::debug!(query = %text, "text search without a vector backend");
            let mut results = SearchResults::empty(Strategy::Sqlite);
            results.reason = Some(REASON_NO_BACKEND.to_string());
            return Ok(results);
        }

        match self.vector_strategy(&text, &query).await {
            Ok(results) => Ok(results),
            Err(SearchFailure::Vector(e)) => {
                tracing::warn!(error = %e, "vector query failed, falling back to sqlite");
                self.fallback(&query, &e).await
            }
            Err(SearchFailure::Storage(e)) => Err(e),
        }
    }

    /// Concept/type/file lookup. `query` optionally supplies ranking text.
    pub async fn lookup(&self, lookup: Lookup, mut query: SearchQuery) -> Result<SearchResults> {
        lookup.apply(&mut query.filters);
        query.doc_type = Some(DocType::Observation);

        if !self.vector.is_enabled() {
            return self.sqlite_strategy(&query).await;
        }

        let text = query
            .text()
            .map(str::to_string)
            .unwrap_or_else(|| lookup.as_text());
        match self.hybrid_strategy(&text, &query).await {
            Ok(results) => Ok(results),
            Err(SearchFailure::Vector(e)) => {
                tracing::warn!(error = %e, "hybrid ranking failed, falling back to sqlite");
                self.fallback(&query, &e).await
            }
            Err(SearchFailure::Storage(e)) => Err(e),
        }
    }

    async fn fallback(&self, query: &SearchQuery, error: &VectorError) -> Result<SearchResults> {
        let mut stripped = query.clone();
        stripped.query = None;
        let mut results = self.sqlite_strategy(&stripped).await?;
        results.fell_back = true;
        results.reason = Some(format!("vector_query_failed: {error}"));
        Ok(results)
    }

    async fn sqlite_strategy(&self, query: &SearchQuery) -> Result<SearchResults> {
        let filters = query.filters.clone();
        let (obs, sessions, prompts) = (
            query.wants(DocType::Observation),
            query.wants(DocType::SessionSummary),
            query.wants(DocType::UserPrompt),
        );
        let (observations, sessions, prompts) = self
            .db
            .call(move |conn| {
                Ok((
                    if obs { query_observations(conn, &filters)? } else { Vec::new() },
                    if sessions { query_summaries(conn, &filters)? } else { Vec::new() },
                    if prompts { query_prompts(conn, &filters)? } else { Vec::new() },
                ))
            })
            .await?;
        Ok(SearchResults {
            observations,
            sessions,
            prompts,
            strategy: Strategy::Sqlite,
            fell_back: false,
            reason: None,
        })
    }

    async fn vector_strategy(
        &self,
        text: &str,
        query: &SearchQuery,
    ) -> Result<SearchResults, SearchFailure> {
        let mut matches = self
            .vector
            .query(text, query.doc_type, VECTOR_BATCH)
            .await
            .map_err(SearchFailure::Vector)?;

        let cutoff = now_epoch_ms() - RECENCY_WINDOW_DAYS * DAY_MS;
        matches.retain(|m| m.created_at_epoch >= cutoff);
        if let Some(project) = &query.filters.project {
            matches.retain(|m| &m.project == project);
        }

        let mut results = SearchResults::empty(Strategy::Vector);
        if matches.is_empty() {
            return Ok(results);
        }

        let buckets = bucket_by_type(&matches);
        let mut filters = query.filters.clone();
        filters.order.get_or_insert(SortOrder::Relevance);

        let obs_ids = take_bucket(&buckets, DocType::Observation, query);
        let summary_ids = take_bucket(&buckets, DocType::SessionSummary, query);
        let prompt_ids = take_bucket(&buckets, DocType::UserPrompt, query);

        let (observations, sessions, prompts) = self
            .db
            .call(move |conn| {
                Ok((
                    observations_by_ids(conn, &obs_ids, &filters)?,
                    summaries_by_ids(conn, &summary_ids, &filters)?,
                    prompts_by_ids(conn, &prompt_ids, &filters)?,
                ))
            })
            .await
            .map_err(SearchFailure::Storage)?;

        results.observations = observations;
        results.sessions = sessions;
        results.prompts = prompts;
        Ok(results)
    }

    async fn hybrid_strategy(
        &self,
        text: &str,
        query: &SearchQuery,
    ) -> Result<SearchResults, SearchFailure> {
        let mut filters = query.filters.clone();
        filters.limit = Some(VECTOR_BATCH);
        filters.offset = None;
        let candidates: Vec<i64> = self
            .db
            .call(move |conn| {
                Ok(query_observations(conn, &filters)?
                    .into_iter()
                    .map(|o| o.id)
                    .collect())
            })
            .await
            .map_err(SearchFailure::Storage)?;

        let mut results = SearchResults::empty(Strategy::Hybrid);
        if candidates.is_empty() {
            return Ok(results);
        }

        let matches = self
            .vector
            .query(text, Some(DocType::Observation), VECTOR_BATCH)
            .await
            .map_err(SearchFailure::Vector)?;

        // Ranked candidates first, then the rest in their relational order.
        let mut ranked: Vec<i64> = Vec::with_capacity(candidates.len());
        for m in &matches {
            if candidates.contains(&m.sqlite_id) && !ranked.contains(&m.sqlite_id) {
                ranked.push(m.sqlite_id);
            }
        }
        for id in &candidates {
            if !ranked.contains(id) {
                ranked.push(*id);
            }
        }

        let mut filters = query.filters.clone();
        filters.order.get_or_insert(SortOrder::Relevance);
        results.observations = self
            .db
            .call(move |conn| observations_by_ids(conn, &ranked, &filters))
            .await
            .map_err(SearchFailure::Storage)?;
        Ok(results)
    }
}

enum SearchFailure {
    Vector(VectorError),
    Storage(anyhow::Error),
}

fn take_bucket(
    buckets: &std::collections::HashMap<DocType, Vec<i64>>,
    doc_type: DocType,
    query: &SearchQuery,
) -> Vec<i64> {
    if !query.wants(doc_type) {
        return Vec::new();
    }
    buckets.get(&doc_type).cloned().unwrap_or_default()
}

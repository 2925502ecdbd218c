//! Relational read path: filtered listings and batched hydration by id.
//!
//! All reads skip rows archived by retention. Filters are assembled into one parameterized
//! `WHERE` clause; JSON list columns are matched with `json_each`.

use anyhow::Result;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde::Deserialize;

use crate::memory::store::{
    observation_from_row, prompt_from_row, summary_from_row, OBSERVATION_COLUMNS,
    PROMPT_COLUMNS, SUMMARY_COLUMNS,
};
use crate::memory::types::{Observation, SessionSummary, UserPrompt};

pub const DEFAULT_LIMIT: usize = 20;
pub const MAX_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    DateDesc,
    DateAsc,
    /// Keep the caller's id order (vector rank). Plain listings treat it as `DateDesc`.
    Relevance,
}

/// Residual filters applied by every relational read.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueryFilters {
    pub project: Option<String>,
    /// Observation types (`bugfix`, `feature`, ...). Observations only.
    pub obs_types: Vec<String>,
    /// Observations whose `concepts` list contains this value.
    pub concept: Option<String>,
    /// Observations that read or modified a path containing this value.
    pub file: Option<String>,
    /// Inclusive lower bound, epoch ms.
    pub date_start: Option<i64>,
    /// Inclusive upper bound, epoch ms.
    pub date_end: Option<i64>,
    /// `None` means newest first for listings and rank order for vector hydration.
    pub order: Option<SortOrder>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl QueryFilters {
    pub fn sort_order(&self) -> SortOrder {
        self.order.unwrap_or_default()
    }

    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }

    /// True when a filter only observations can satisfy is set.
    pub fn is_observation_only(&self) -> bool {
        !self.obs_types.is_empty() || self.concept.is_some() || self.file.is_some()
    }
}

struct WhereBuilder {
    clauses: Vec<String>,
    values: Vec<Value>,
}

impl WhereBuilder {
    fn new() -> Self {
        Self {
            clauses: Vec::new(),
            values: Vec::new(),
        }
    }

    fn push(&mut self, clause: impl Into<String>, value: Value) {
        self.values.push(value);
        let clause = clause.into().replace("?#", &format!("?{}", self.values.len()));
        self.clauses.push(clause);
    }

    fn push_raw(&mut self, clause: &str) {
        self.clauses.push(clause.to_string());
    }

    fn common(&mut self, filters: &QueryFilters, epoch_column: &str) {
        if let Some(project) = &filters.project {
            self.push("project = ?#", Value::Text(project.clone()));
        }
        if let Some(start) = filters.date_start {
            self.push(format!("{epoch_column} >= ?#"), Value::Integer(start));
        }
        if let Some(end) = filters.date_end {
            self.push(format!("{epoch_column} <= ?#"), Value::Integer(end));
        }
    }

    fn ids(&mut self, ids: &[i64]) {
        let start = self.values.len();
        let placeholders: Vec<String> = (0..ids.len())
            .map(|i| format!("?{}", start + i + 1))
            .collect();
        self.values.extend(ids.iter().map(|id| Value::Integer(*id)));
        self.clauses.push(format!("id IN ({})", placeholders.join(", ")));
    }

    fn sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", self.clauses.join(" AND "))
        }
    }
}

fn observation_where(filters: &QueryFilters) -> WhereBuilder {
    let mut w = WhereBuilder::new();
    w.push_raw("archived_at_epoch IS NULL");
    w.common(filters, "created_at_epoch");
    if !filters.obs_types.is_empty() {
        let start = w.values.len();
        let placeholders: Vec<String> = (0..filters.obs_types.len())
            .map(|i| format!("?{}", start + i + 1))
            .collect();
        w.values
            .extend(filters.obs_types.iter().map(|t| Value::Text(t.clone())));
        w.clauses.push(format!("type IN ({})", placeholders.join(", ")));
    }
    if let Some(concept) = &filters.concept {
        w.push(
            "EXISTS (SELECT 1 FROM json_each(observations.concepts) WHERE value = ?#)",
            Value::Text(concept.clone()),
        );
    }
    if let Some(file) = &filters.file {
        w.push(
            "(EXISTS (SELECT 1 FROM json_each(observations.files_read) WHERE value LIKE ?#) \
             OR EXISTS (SELECT 1 FROM json_each(observations.files_modified) WHERE value LIKE ?#))",
            Value::Text(format!("%{file}%")),
        );
    }
    w
}

fn order_sql(order: SortOrder) -> &'static str {
    match order {
        SortOrder::DateAsc => "ORDER BY created_at_epoch ASC, id ASC",
        SortOrder::DateDesc | SortOrder::Relevance => "ORDER BY created_at_epoch DESC, id DESC",
    }
}

fn page_sql(filters: &QueryFilters) -> String {
    format!(
        "LIMIT {} OFFSET {}",
        filters.effective_limit(),
        filters.offset.unwrap_or(0)
    )
}

pub fn query_observations(conn: &Connection, filters: &QueryFilters) -> Result<Vec<Observation>> {
    let w = observation_where(filters);
    let sql = format!(
        "SELECT {OBSERVATION_COLUMNS} FROM observations {} {} {}",
        w.sql(),
        order_sql(filters.sort_order()),
        page_sql(filters)
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(w.values.iter()), observation_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn query_summaries(conn: &Connection, filters: &QueryFilters) -> Result<Vec<SessionSummary>> {
    let mut w = WhereBuilder::new();
    w.push_raw("archived_at_epoch IS NULL");
    w.common(filters, "created_at_epoch");
    let sql = format!(
        "SELECT {SUMMARY_COLUMNS} FROM session_summaries {} {} {}",
        w.sql(),
        order_sql(filters.sort_order()),
        page_sql(filters)
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(w.values.iter()), summary_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn query_prompts(conn: &Connection, filters: &QueryFilters) -> Result<Vec<UserPrompt>> {
    let mut w = WhereBuilder::new();
    w.common(filters, "created_at_epoch");
    let sql = format!(
        "SELECT {PROMPT_COLUMNS} FROM user_prompts {} {} {}",
        w.sql(),
        order_sql(filters.sort_order()),
        page_sql(filters)
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(w.values.iter()), prompt_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Reorder `rows` to follow `ids` (rank order), dropping ids that did not come back.
fn in_id_order<T>(ids: &[i64], rows: Vec<T>, id_of: impl Fn(&T) -> i64) -> Vec<T> {
    let mut by_id: std::collections::HashMap<i64, T> =
        rows.into_iter().map(|r| (id_of(&r), r)).collect();
    ids.iter().filter_map(|id| by_id.remove(id)).collect()
}

/// Hydrate observations by id in one read, applying residual filters, ordering and limit.
pub fn observations_by_ids(
    conn: &Connection,
    ids: &[i64],
    filters: &QueryFilters,
) -> Result<Vec<Observation>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut w = observation_where(filters);
    w.ids(ids);
    let sql = format!(
        "SELECT {OBSERVATION_COLUMNS} FROM observations {} {}",
        w.sql(),
        order_sql(filters.sort_order())
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(w.values.iter()), observation_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(finish(ids, rows, filters, |o| o.id))
}

pub fn summaries_by_ids(
    conn: &Connection,
    ids: &[i64],
    filters: &QueryFilters,
) -> Result<Vec<SessionSummary>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut w = WhereBuilder::new();
    w.push_raw("archived_at_epoch IS NULL");
    w.common(filters, "created_at_epoch");
    w.ids(ids);
    let sql = format!(
        "SELECT {SUMMARY_COLUMNS} FROM session_summaries {} {}",
        w.sql(),
        order_sql(filters.sort_order())
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(w.values.iter()), summary_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(finish(ids, rows, filters, |s| s.id))
}

pub fn prompts_by_ids(
    conn: &Connection,
    ids: &[i64],
    filters: &QueryFilters,
) -> Result<Vec<UserPrompt>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut w = WhereBuilder::new();
    w.common(filters, "created_at_epoch");
    w.ids(ids);
    let sql = format!(
        "SELECT {PROMPT_COLUMNS} FROM user_prompts {} {}",
        w.sql(),
        order_sql(filters.sort_order())
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(w.values.iter()), prompt_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(finish(ids, rows, filters, |p| p.id))
}

fn finish<T>(
    ids: &[i64],
    rows: Vec<T>,
    filters: &QueryFilters,
    id_of: impl Fn(&T) -> i64,
) -> Vec<T> {
    let rows = if filters.sort_order() == SortOrder::Relevance {
        in_id_order(ids, rows, id_of)
    } else {
        rows
    };
    rows.into_iter()
        .skip(filters.offset.unwrap_or(0))
        .take(filters.effective_limit())
        .collect()
}

/// Most recent observations for a project, newest first.
pub fn recent_observations(
    conn: &Connection,
    project: &str,
    limit: usize,
) -> Result<Vec<Observation>> {
    query_observations(
        conn,
        &QueryFilters {
            project: Some(project.to_string()),
            limit: Some(limit),
            ..Default::default()
        },
    )
}

pub fn recent_summaries(
    conn: &Connection,
    project: &str,
    limit: usize,
) -> Result<Vec<SessionSummary>> {
    query_summaries(
        conn,
        &QueryFilters {
            project: Some(project.to_string()),
            limit: Some(limit),
            ..Default::default()
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;
    use crate::memory::store::{store_batch, BatchWrite};
    use crate::memory::types::ParsedObservation;

    fn seed(conn: &mut Connection) -> Vec<i64> {
        let mut ids = Vec::new();
        for (i, (ty, concept, file)) in [
            ("bugfix", "gotcha", "src/db/mod.rs"),
            ("feature", "pattern", "src/api/mod.rs"),
            ("bugfix", "pattern", "src/api/auth.rs"),
        ]
        .into_iter()
        .enumerate()
        {
            let stored = store_batch(
                conn,
                &BatchWrite {
                    memory_session_id: "mem".into(),
                    project: if i == 1 { "other".into() } else { "demo".into() },
                    observations: vec![ParsedObservation {
                        obs_type: ty.into(),
                        title: Some(format!("obs {i}")),
                        concepts: vec![concept.into()],
                        files_modified: vec![file.into()],
                        ..Default::default()
                    }],
                    override_epoch: Some(1_000 * (i as i64 + 1)),
                    ..Default::default()
                },
            )
            .unwrap();
            ids.push(stored.observations[0].id);
        }
        ids
    }

    #[test]
    fn filters_by_project_type_concept_and_file() {
        let mut conn = open_memory_database().unwrap();
        let ids = seed(&mut conn);

        let demo = query_observations(
            &conn,
            &QueryFilters {
                project: Some("demo".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(demo.iter().map(|o| o.id).collect::<Vec<_>>(), vec![ids[2], ids[0]]);

        let bugfix = query_observations(
            &conn,
            &QueryFilters {
                obs_types: vec!["bugfix".into()],
                order: Some(SortOrder::DateAsc),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(bugfix.iter().map(|o| o.id).collect::<Vec<_>>(), vec![ids[0], ids[2]]);

        let pattern = query_observations(
            &conn,
            &QueryFilters {
                concept: Some("pattern".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(pattern.len(), 2);

        let api = query_observations(
            &conn,
            &QueryFilters {
                file: Some("src/api".into()),
                project: Some("demo".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(api.len(), 1);
        assert_eq!(api[0].id, ids[2]);
    }

    #[test]
    fn date_range_is_inclusive() {
        let mut conn = open_memory_database().unwrap();
        seed(&mut conn);
        let rows = query_observations(
            &conn,
            &QueryFilters {
                date_start: Some(2_000),
                date_end: Some(3_000),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn hydration_preserves_rank_order() {
        let mut conn = open_memory_database().unwrap();
        let ids = seed(&mut conn);
        let ranked = vec![ids[1], ids[2], ids[0]];
        let rows = observations_by_ids(
            &conn,
            &ranked,
            &QueryFilters {
                order: Some(SortOrder::Relevance),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(rows.iter().map(|o| o.id).collect::<Vec<_>>(), ranked);

        let limited = observations_by_ids(
            &conn,
            &ranked,
            &QueryFilters {
                order: Some(SortOrder::Relevance),
                project: Some("demo".into()),
                limit: Some(1),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, ids[2]);
    }
}

//! Search, hydration and context-injection handlers.
//!
//! Query strings are parsed into [`SearchParams`] (plain strings) and converted, because
//! list and numeric fields don't survive `serde(flatten)` through form decoding.

use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, NaiveDate};
use serde::Deserialize;

use super::AppState;
use crate::error::{require, ApiResult, WorkerError};
use crate::memory::context::build_context;
use crate::memory::query::{observations_by_ids, QueryFilters, SortOrder};
use crate::memory::types::{DocType, Observation};
use crate::search::{Lookup, SearchQuery, SearchResults};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SearchParams {
    pub query: Option<String>,
    /// `observations`, `sessions` or `prompts`.
    #[serde(alias = "type")]
    pub doc_type: Option<String>,
    /// Comma-separated observation types.
    pub obs_type: Option<String>,
    pub concept: Option<String>,
    pub concepts: Option<String>,
    pub file: Option<String>,
    pub files: Option<String>,
    pub project: Option<String>,
    /// Epoch ms, `YYYY-MM-DD` or RFC 3339.
    #[serde(alias = "dateStart")]
    pub date_start: Option<String>,
    #[serde(alias = "dateEnd")]
    pub date_end: Option<String>,
    #[serde(alias = "orderBy")]
    pub order_by: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    #[serde(alias = "filterOnly")]
    pub filter_only: Option<bool>,
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Parse a date bound. `end_of_day` widens a bare date to its last millisecond.
pub fn parse_date(value: &str, end_of_day: bool) -> Option<i64> {
    let value = value.trim();
    if let Ok(ms) = value.parse::<i64>() {
        return Some(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.timestamp_millis());
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()?;
    let time = if end_of_day {
        date.and_hms_milli_opt(23, 59, 59, 999)?
    } else {
        date.and_hms_opt(0, 0, 0)?
    };
    Some(time.and_utc().timestamp_millis())
}

fn parse_order(value: &str) -> ApiResult<SortOrder> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| WorkerError::validation(format!("invalid order_by: {value}")))
}

fn parse_bound(value: Option<&str>, field: &str, end_of_day: bool) -> ApiResult<Option<i64>> {
    value
        .filter(|v| !v.trim().is_empty())
        .map(|v| {
            parse_date(v, end_of_day)
                .ok_or_else(|| WorkerError::validation(format!("invalid {field}: {v}")))
        })
        .transpose()
}

impl SearchParams {
    pub fn into_query(self) -> ApiResult<SearchQuery> {
        let doc_type = self
            .doc_type
            .as_deref()
            .filter(|t| !t.is_empty() && *t != "all")
            .map(|t| t.parse::<DocType>().map_err(WorkerError::Validation))
            .transpose()?;
        let filters = QueryFilters {
            project: self.project.filter(|p| !p.is_empty()),
            obs_types: split_list(self.obs_type.as_deref()),
            concept: self.concept.or(self.concepts).filter(|c| !c.is_empty()),
            file: self.file.or(self.files).filter(|f| !f.is_empty()),
            date_start: parse_bound(self.date_start.as_deref(), "date_start", false)?,
            date_end: parse_bound(self.date_end.as_deref(), "date_end", true)?,
            order: self.order_by.as_deref().map(parse_order).transpose()?,
            limit: self.limit,
            offset: self.offset,
        };
        Ok(SearchQuery {
            query: self.query,
            doc_type,
            filter_only: self.filter_only.unwrap_or(false),
            filters,
        })
    }
}

pub async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<SearchResults>> {
    let query = params.into_query()?;
    Ok(Json(state.store.search().search(query).await?))
}

pub async fn by_concept(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<SearchResults>> {
    let concept = require(
        params.concept.as_deref().or(params.concepts.as_deref()),
        "concept",
    )?
    .to_string();
    let query = params.into_query()?;
    Ok(Json(state.store.search().lookup(Lookup::Concept(concept), query).await?))
}

pub async fn by_type(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<SearchResults>> {
    let types = split_list(Some(require(params.obs_type.as_deref(), "obs_type")?));
    let query = params.into_query()?;
    Ok(Json(state.store.search().lookup(Lookup::Types(types), query).await?))
}

pub async fn by_file(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<SearchResults>> {
    let file = require(params.file.as_deref().or(params.files.as_deref()), "file")?.to_string();
    let query = params.into_query()?;
    Ok(Json(state.store.search().lookup(Lookup::File(file), query).await?))
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub ids: Vec<i64>,
    #[serde(default, alias = "orderBy")]
    pub order_by: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub project: Option<String>,
}

pub async fn observations_batch(
    State(state): State<AppState>,
    Json(body): Json<BatchRequest>,
) -> ApiResult<Json<Vec<Observation>>> {
    if body.ids.is_empty() {
        return Ok(Json(Vec::new()));
    }
    let filters = QueryFilters {
        project: body.project,
        order: Some(
            body.order_by
                .as_deref()
                .map(parse_order)
                .transpose()?
                .unwrap_or(SortOrder::Relevance),
        ),
        limit: Some(body.limit.unwrap_or(body.ids.len())),
        ..Default::default()
    };
    let ids = body.ids;
    let rows = state
        .store
        .db()
        .call(move |conn| observations_by_ids(conn, &ids, &filters))
        .await?;
    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
pub struct ContextParams {
    pub project: Option<String>,
    /// `json` returns the structured form; anything else plain text.
    pub format: Option<String>,
}

pub async fn context_inject(
    State(state): State<AppState>,
    Query(params): Query<ContextParams>,
) -> ApiResult<Response> {
    let project = require(params.project.as_deref(), "project")?.to_string();
    let config = state.config.context.clone();
    let context = state
        .store
        .db()
        .call(move |conn| build_context(conn, &project, &config))
        .await?;
    if params.format.as_deref() == Some("json") {
        return Ok(Json(context).into_response());
    }
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], context.text).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_convert_to_filters() {
        let params = SearchParams {
            query: Some("auth".into()),
            doc_type: Some("observations".into()),
            obs_type: Some("bugfix, feature".into()),
            date_start: Some("2025-01-01".into()),
            date_end: Some("2025-01-01".into()),
            order_by: Some("date_asc".into()),
            limit: Some(5),
            ..Default::default()
        };
        let query = params.into_query().unwrap();
        assert_eq!(query.doc_type, Some(DocType::Observation));
        assert_eq!(query.filters.obs_types, vec!["bugfix", "feature"]);
        assert_eq!(query.filters.order, Some(SortOrder::DateAsc));
        let (start, end) = (query.filters.date_start.unwrap(), query.filters.date_end.unwrap());
        assert_eq!(end - start, 24 * 60 * 60 * 1000 - 1);
    }

    #[test]
    fn dates_accept_epoch_and_rfc3339() {
        assert_eq!(parse_date("1700000000000", false), Some(1_700_000_000_000));
        assert_eq!(parse_date("1970-01-01T00:00:01Z", false), Some(1_000));
        assert_eq!(parse_date("yesterday", false), None);
    }

    #[test]
    fn bad_order_is_a_validation_error() {
        let params = SearchParams {
            order_by: Some("sideways".into()),
            ..Default::default()
        };
        assert!(matches!(params.into_query(), Err(WorkerError::Validation(_))));
    }
}

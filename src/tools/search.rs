//! MCP `search` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `search` MCP tool. Maps onto `GET /api/search`.
#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct SearchParams {
    /// Free-text query. Omit to list by filters only.
    #[schemars(description = "Natural language query. Omit to list by filters only.")]
    pub query: Option<String>,

    #[schemars(description = "Restrict to one kind: 'observations', 'sessions' or 'prompts'")]
    pub r#type: Option<String>,

    #[schemars(description = "Comma-separated observation types, e.g. 'bugfix,feature'")]
    pub obs_type: Option<String>,

    #[schemars(description = "Observations tagged with this concept")]
    pub concept: Option<String>,

    #[schemars(description = "Observations that read or modified a path containing this value")]
    pub file: Option<String>,

    #[schemars(description = "Project name")]
    pub project: Option<String>,

    #[schemars(description = "Inclusive start date (YYYY-MM-DD, RFC 3339 or epoch ms)")]
    pub date_start: Option<String>,

    #[schemars(description = "Inclusive end date (YYYY-MM-DD, RFC 3339 or epoch ms)")]
    pub date_end: Option<String>,

    #[schemars(description = "'date_desc' (default), 'date_asc' or 'relevance'")]
    pub order_by: Option<String>,

    #[schemars(description = "Maximum results per kind (default 20)")]
    pub limit: Option<usize>,

    pub offset: Option<usize>,
}

impl SearchParams {
    /// Non-empty fields as query-string pairs.
    pub fn to_query(&self) -> Vec<(&'static str, String)> {
        let strings = [
            ("query", &self.query),
            ("type", &self.r#type),
            ("obs_type", &self.obs_type),
            ("concept", &self.concept),
            ("file", &self.file),
            ("project", &self.project),
            ("date_start", &self.date_start),
            ("date_end", &self.date_end),
            ("order_by", &self.order_by),
        ];
        let mut pairs: Vec<(&'static str, String)> = strings
            .into_iter()
            .filter_map(|(k, v)| v.as_ref().filter(|v| !v.is_empty()).map(|v| (k, v.clone())))
            .collect();
        if let Some(limit) = self.limit {
            pairs.push(("limit", limit.to_string()));
        }
        if let Some(offset) = self.offset {
            pairs.push(("offset", offset.to_string()));
        }
        pairs
    }
}

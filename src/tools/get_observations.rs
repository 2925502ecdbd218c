//! MCP `get_observations` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Full observations by id, typically ids taken from a `search` result.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct GetObservationsParams {
    #[schemars(description = "Observation ids to fetch")]
    pub ids: Vec<i64>,

    #[schemars(description = "'relevance' keeps the given id order (default), or 'date_desc' / 'date_asc'")]
    pub order_by: Option<String>,
}

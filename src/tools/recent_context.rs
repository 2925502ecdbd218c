//! MCP `recent_context` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct RecentContextParams {
    /// Project whose recent memory is returned.
    #[schemars(description = "Project name whose recent summaries and observations to return")]
    pub project: String,
}

pub mod get_observations;
pub mod recent_context;
pub mod search;

use get_observations::GetObservationsParams;
use recent_context::RecentContextParams;
use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::{tool, tool_handler, tool_router, ServerHandler};
use search::SearchParams;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// MCP tool handler. Every tool is a thin call into the local worker's HTTP API, so the MCP
/// process never opens the store itself.
#[derive(Clone)]
pub struct HindsightTools {
    tool_router: ToolRouter<Self>,
    base_url: String,
    http: reqwest::Client,
}

#[tool_router]
impl HindsightTools {
    pub fn new(base_url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            tool_router: Self::tool_router(),
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    fn url(&self, path: &str, query: &[(&str, String)]) -> Result<reqwest::Url, String> {
        reqwest::Url::parse_with_params(&format!("{}{path}", self.base_url), query)
            .map_err(|e| format!("invalid worker url: {e}"))
    }

    async fn read_body(response: reqwest::Response) -> Result<String, String> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| format!("failed to read worker response: {e}"))?;
        if !status.is_success() {
            return Err(format!("worker returned HTTP {status}: {body}"));
        }
        Ok(body)
    }

    #[tool(description = "Search stored memory (observations, session summaries, prompts). Returns ids, titles and dates; the response reports the strategy used and whether it fell back to plain filtering.")]
    async fn search(&self, Parameters(params): Parameters<SearchParams>) -> Result<String, String> {
        tracing::info!(query = ?params.query, "search called");
        let url = self.url("/api/search", &params.to_query())?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| format!("worker unreachable: {e}"))?;
        Self::read_body(response).await
    }

    #[tool(description = "Recent memory for a project as markdown: latest session summaries and observations, within a token budget.")]
    async fn recent_context(
        &self,
        Parameters(params): Parameters<RecentContextParams>,
    ) -> Result<String, String> {
        tracing::info!(project = %params.project, "recent_context called");
        let url = self.url("/api/context/inject", &[("project", params.project)])?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| format!("worker unreachable: {e}"))?;
        Self::read_body(response).await
    }

    #[tool(description = "Fetch full observations (narrative, facts, files) by id.")]
    async fn get_observations(
        &self,
        Parameters(params): Parameters<GetObservationsParams>,
    ) -> Result<String, String> {
        if params.ids.is_empty() {
            return Err("ids must not be empty".into());
        }
        tracing::info!(count = params.ids.len(), "get_observations called");
        let url = self.url("/api/observations/batch", &[])?;
        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({ "ids": params.ids, "order_by": params.order_by }))
            .send()
            .await
            .map_err(|e| format!("worker unreachable: {e}"))?;
        Self::read_body(response).await
    }
}

#[tool_handler]
impl ServerHandler for HindsightTools {
    fn get_info(&self) -> rmcp::model::ServerInfo {
        rmcp::model::ServerInfo {
            instructions: Some(
                "hindsight records what happened in past coding sessions. Use search to find \
                 relevant observations, get_observations for full details, and recent_context \
                 for a project overview."
                    .into(),
            ),
            capabilities: rmcp::model::ServerCapabilities::builder()
                .enable_tools()
                .build(),
            ..Default::default()
        }
    }
}

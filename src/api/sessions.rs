//! Session ingestion handlers. Field names are snake_case; camelCase aliases are accepted for
//! hook scripts that send them.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::AppState;
use crate::error::{require, ApiResult, WorkerError};
use crate::memory::types::{ObservationPayload, SummarizePayload};
use crate::session::{InitOutcome, QueueOutcome, SessionSnapshot};

#[derive(Debug, Deserialize)]
pub struct InitRequest {
    #[serde(alias = "contentSessionId")]
    pub content_session_id: Option<String>,
    pub project: Option<String>,
    pub prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ObservationRequest {
    #[serde(alias = "contentSessionId")]
    pub content_session_id: Option<String>,
    pub project: Option<String>,
    #[serde(alias = "toolName")]
    pub tool_name: Option<String>,
    #[serde(default, alias = "toolInput")]
    pub tool_input: serde_json::Value,
    #[serde(default, alias = "toolResponse")]
    pub tool_response: serde_json::Value,
    pub cwd: Option<String>,
    #[serde(default, alias = "promptNumber")]
    pub prompt_number: i64,
}

#[derive(Debug, Deserialize)]
pub struct SummarizeRequest {
    #[serde(alias = "contentSessionId")]
    pub content_session_id: Option<String>,
    pub project: Option<String>,
    #[serde(alias = "lastUserMessage")]
    pub last_user_message: Option<String>,
    #[serde(alias = "lastAssistantMessage")]
    pub last_assistant_message: Option<String>,
    #[serde(default, alias = "promptNumber")]
    pub prompt_number: i64,
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    #[serde(alias = "contentSessionId")]
    pub content_session_id: Option<String>,
}

fn accepting(state: &AppState) -> ApiResult<()> {
    if state.sessions.is_shutting_down() {
        return Err(WorkerError::ShuttingDown);
    }
    Ok(())
}

pub async fn init(
    State(state): State<AppState>,
    Json(body): Json<InitRequest>,
) -> ApiResult<Json<InitOutcome>> {
    accepting(&state)?;
    let cid = require(body.content_session_id.as_deref(), "content_session_id")?;
    let project = require(body.project.as_deref(), "project")?;
    let outcome = state
        .sessions
        .init_session(cid, project, body.prompt.as_deref())
        .await?;
    Ok(Json(outcome))
}

pub async fn observations(
    State(state): State<AppState>,
    Json(body): Json<ObservationRequest>,
) -> ApiResult<Json<QueueOutcome>> {
    accepting(&state)?;
    let cid = require(body.content_session_id.as_deref(), "content_session_id")?;
    let tool_name = require(body.tool_name.as_deref(), "tool_name")?;
    let payload = ObservationPayload {
        tool_name: tool_name.to_string(),
        tool_input: body.tool_input,
        tool_response: body.tool_response,
        cwd: body.cwd,
        prompt_number: body.prompt_number,
    };
    let outcome = state
        .sessions
        .queue_observation(cid, body.project.as_deref(), payload)
        .await?;
    Ok(Json(outcome))
}

pub async fn summarize(
    State(state): State<AppState>,
    Json(body): Json<SummarizeRequest>,
) -> ApiResult<Json<QueueOutcome>> {
    accepting(&state)?;
    let cid = require(body.content_session_id.as_deref(), "content_session_id")?;
    let payload = SummarizePayload {
        last_user_message: body.last_user_message,
        last_assistant_message: body.last_assistant_message,
        prompt_number: body.prompt_number,
    };
    let outcome = state
        .sessions
        .queue_summarize(cid, body.project.as_deref(), payload)
        .await?;
    Ok(Json(outcome))
}

pub async fn complete(
    State(state): State<AppState>,
    Json(body): Json<CompleteRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let cid = require(body.content_session_id.as_deref(), "content_session_id")?;
    match state.sessions.complete_session(cid).await? {
        Some(id) => Ok(Json(json!({ "completed": true, "session_db_id": id }))),
        None => Err(WorkerError::NotFound(format!("session {cid}"))),
    }
}

pub async fn list(State(state): State<AppState>) -> Json<Vec<SessionSnapshot>> {
    Json(state.sessions.snapshots())
}

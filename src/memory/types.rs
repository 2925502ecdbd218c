//! Row and payload types for the relational store.
//!
//! [`Observation`], [`SessionSummary`] and [`UserPrompt`] mirror their tables one to one.
//! [`ParsedObservation`] / [`ParsedSummary`] are what a generation batch produces before
//! it is persisted. [`PendingPayload`] is the tagged union carried by the durable queue.

use serde::{Deserialize, Serialize};

/// Discriminator for the three searchable row kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocType {
    Observation,
    SessionSummary,
    UserPrompt,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Observation => "observation",
            Self::SessionSummary => "session_summary",
            Self::UserPrompt => "user_prompt",
        }
    }
}

impl std::fmt::Display for DocType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DocType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "observation" | "observations" => Ok(Self::Observation),
            "session_summary" | "session" | "sessions" | "summary" => Ok(Self::SessionSummary),
            "user_prompt" | "prompt" | "prompts" => Ok(Self::UserPrompt),
            _ => Err(format!("unknown document type: {s}")),
        }
    }
}

/// A stored observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: i64,
    pub memory_session_id: String,
    pub project: String,
    #[serde(rename = "type")]
    pub obs_type: String,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub facts: Vec<String>,
    pub narrative: Option<String>,
    pub concepts: Vec<String>,
    pub files_read: Vec<String>,
    pub files_modified: Vec<String>,
    pub prompt_number: Option<i64>,
    pub discovery_tokens: i64,
    pub created_at: String,
    pub created_at_epoch: i64,
}

/// A stored end-of-session digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: i64,
    pub memory_session_id: String,
    pub project: String,
    pub request: Option<String>,
    pub investigated: Option<String>,
    pub learned: Option<String>,
    pub completed: Option<String>,
    pub next_steps: Option<String>,
    pub notes: Option<String>,
    pub prompt_number: Option<i64>,
    pub discovery_tokens: i64,
    pub created_at: String,
    pub created_at_epoch: i64,
}

impl SessionSummary {
    /// Searchable text fields, in display order.
    pub fn fields(&self) -> [(&'static str, Option<&str>); 6] {
        [
            ("request", self.request.as_deref()),
            ("investigated", self.investigated.as_deref()),
            ("learned", self.learned.as_deref()),
            ("completed", self.completed.as_deref()),
            ("next_steps", self.next_steps.as_deref()),
            ("notes", self.notes.as_deref()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPrompt {
    pub id: i64,
    pub content_session_id: String,
    pub project: String,
    pub prompt_number: i64,
    pub prompt_text: String,
    pub created_at: String,
    pub created_at_epoch: i64,
}

/// One `sdk_sessions` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: i64,
    pub content_session_id: String,
    pub memory_session_id: Option<String>,
    pub project: String,
    pub user_prompt: Option<String>,
    pub prompt_counter: i64,
    pub status: String,
    pub started_at: String,
    pub started_at_epoch: i64,
    pub completed_at_epoch: Option<i64>,
}

/// An observation as produced by a generation batch, before it has an id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedObservation {
    #[serde(rename = "type")]
    pub obs_type: String,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub facts: Vec<String>,
    pub narrative: Option<String>,
    pub concepts: Vec<String>,
    pub files_read: Vec<String>,
    pub files_modified: Vec<String>,
}

/// A summary as produced by a generation batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedSummary {
    pub request: Option<String>,
    pub investigated: Option<String>,
    pub learned: Option<String>,
    pub completed: Option<String>,
    pub next_steps: Option<String>,
    pub notes: Option<String>,
}

/// A tool-use event to be turned into observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationPayload {
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: serde_json::Value,
    #[serde(default)]
    pub tool_response: serde_json::Value,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub prompt_number: i64,
}

/// An end-of-session summary request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummarizePayload {
    #[serde(default)]
    pub last_user_message: Option<String>,
    #[serde(default)]
    pub last_assistant_message: Option<String>,
    #[serde(default)]
    pub prompt_number: i64,
}

/// Work item carried by a session's queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PendingPayload {
    Observation(ObservationPayload),
    Summarize(SummarizePayload),
}

impl PendingPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Observation(_) => "observation",
            Self::Summarize(_) => "summarize",
        }
    }

    pub fn prompt_number(&self) -> i64 {
        match self {
            Self::Observation(o) => o.prompt_number,
            Self::Summarize(s) => s.prompt_number,
        }
    }
}

/// A durably queued work item: the payload plus its row id and original enqueue time.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub id: i64,
    pub payload: PendingPayload,
    pub enqueued_at_epoch: i64,
}

//! Prompt construction for generation batches.

use crate::memory::types::{ObservationPayload, PendingMessage, PendingPayload, SummarizePayload};

/// Characters kept from each tool input/response before it is sent to a provider.
const MAX_PAYLOAD_CHARS: usize = 8_000;

pub fn system_prompt(observation_types: &[String]) -> String {
    let types = observation_types.join(" | ");
    format!(
        "You are a memory recorder observing a coding session. You never use tools and never \
talk to the user. For every tool use you are shown, decide whether it taught something \
worth remembering later: a discovery about the codebase, a bug fixed, a feature built, a \
decision taken. Skip routine reads that taught nothing.

Record each worthwhile event as:

<observation>
  <type>{types}</type>
  <title>short title</title>
  <subtitle>one sentence</subtitle>
  <facts><fact>concise, self-contained fact</fact></facts>
  <narrative>what happened and why it matters</narrative>
  <concepts><concept>keyword</concept></concepts>
  <files_read><file>path</file></files_read>
  <files_modified><file>path</file></files_modified>
</observation>

When asked for a summary, reply with exactly one block:

<summary>
  <request>what the user asked for</request>
  <investigated>what was looked at</investigated>
  <learned>what was learned</learned>
  <completed>what was finished</completed>
  <next_steps>what remains</next_steps>
  <notes>anything else</notes>
</summary>

Output only these XML blocks. An empty reply is valid."
    )
}

/// Header sent once, at the start of a session's conversation.
pub fn session_header(project: &str, user_prompt: Option<&str>, prompt_number: i64) -> String {
    format!(
        "<session_context>\n  <project>{}</project>\n  <user_request>{}</user_request>\n  <prompt_number>{}</prompt_number>\n</session_context>\n",
        project,
        user_prompt.unwrap_or(""),
        prompt_number
    )
}

/// One user turn covering every queued item in FIFO order.
pub fn batch_turn(messages: &[PendingMessage]) -> String {
    let mut out = String::new();
    for message in messages {
        match &message.payload {
            PendingPayload::Observation(obs) => {
                out.push_str(&observation_block(obs, message.enqueued_at_epoch))
            }
            PendingPayload::Summarize(sum) => out.push_str(&summary_request(sum)),
        }
        out.push('\n');
    }
    out
}

fn observation_block(obs: &ObservationPayload, epoch: i64) -> String {
    format!(
        "<observed_tool_use>\n  <tool>{}</tool>\n  <occurred_at_epoch>{}</occurred_at_epoch>\n{}  <input>{}</input>\n  <output>{}</output>\n</observed_tool_use>\n",
        obs.tool_name,
        epoch,
        obs.cwd
            .as_deref()
            .map(|cwd| format!("  <cwd>{cwd}</cwd>\n"))
            .unwrap_or_default(),
        truncate(&render_json(&obs.tool_input)),
        truncate(&render_json(&obs.tool_response)),
    )
}

fn summary_request(sum: &SummarizePayload) -> String {
    let mut out = String::from("<summary_request>\n");
    if let Some(user) = sum.last_user_message.as_deref().filter(|s| !s.is_empty()) {
        out.push_str(&format!("  <last_user_message>{}</last_user_message>\n", truncate(user)));
    }
    if let Some(assistant) = sum.last_assistant_message.as_deref().filter(|s| !s.is_empty()) {
        out.push_str(&format!(
            "  <last_assistant_message>{}</last_assistant_message>\n",
            truncate(assistant)
        ));
    }
    out.push_str("  Write the <summary> block for this session now.\n</summary_request>\n");
    out
}

fn render_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_PAYLOAD_CHARS {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(MAX_PAYLOAD_CHARS).collect();
    cut.push_str("… [truncated]");
    cut
}

//! Parse `<observation>` and `<summary>` blocks out of provider output.

use regex::Regex;
use std::sync::LazyLock;

use crate::memory::types::{ParsedObservation, ParsedSummary};

static OBSERVATION_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<observation>(.*?)</observation>").expect("valid regex"));
static SUMMARY_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<summary>(.*?)</summary>").expect("valid regex"));

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedOutput {
    pub observations: Vec<ParsedObservation>,
    pub summary: Option<ParsedSummary>,
}

/// Extract every observation and the first summary. `allowed_types[0]` replaces unknown types.
pub fn parse_output(text: &str, allowed_types: &[String]) -> ParsedOutput {
    let observations = OBSERVATION_BLOCK
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| parse_observation(m.as_str(), allowed_types))
        .filter(|o| o.title.is_some() || o.narrative.is_some() || !o.facts.is_empty())
        .collect();

    let summary = SUMMARY_BLOCK
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| parse_summary(m.as_str()))
        .filter(|s| {
            [&s.request, &s.investigated, &s.learned, &s.completed, &s.next_steps, &s.notes]
                .iter()
                .any(|f| f.is_some())
        });

    ParsedOutput { observations, summary }
}

fn parse_observation(block: &str, allowed_types: &[String]) -> ParsedObservation {
    let raw_type = field(block, "type").unwrap_or_default().to_lowercase();
    let obs_type = if allowed_types.iter().any(|t| *t == raw_type) {
        raw_type
    } else {
        if !raw_type.is_empty() {
            tracing::debug!(obs_type = %raw_type, "unknown observation type, using default");
        }
        allowed_types.first().cloned().unwrap_or_else(|| "discovery".to_string())
    };

    ParsedObservation {
        obs_type,
        title: field(block, "title"),
        subtitle: field(block, "subtitle"),
        facts: list(block, "facts", "fact"),
        narrative: field(block, "narrative"),
        concepts: list(block, "concepts", "concept"),
        files_read: list(block, "files_read", "file"),
        files_modified: list(block, "files_modified", "file"),
    }
}

fn parse_summary(block: &str) -> ParsedSummary {
    ParsedSummary {
        request: field(block, "request"),
        investigated: field(block, "investigated"),
        learned: field(block, "learned"),
        completed: field(block, "completed"),
        next_steps: field(block, "next_steps"),
        notes: field(block, "notes"),
    }
}

/// Trimmed inner text of the first `<tag>`; empty content reads as absent.
fn field(block: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = block.find(&open)? + open.len();
    let end = block[start..].find(&close)? + start;
    let value = block[start..end].trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn list(block: &str, container: &str, item: &str) -> Vec<String> {
    let Some(inner) = raw_section(block, container) else {
        return Vec::new();
    };
    let open = format!("<{item}>");
    let close = format!("</{item}>");
    let mut out = Vec::new();
    let mut rest = inner;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        let Some(end) = after.find(&close) else { break };
        let value = after[..end].trim();
        if !value.is_empty() {
            out.push(value.to_string());
        }
        rest = &after[end + close.len()..];
    }
    out
}

fn raw_section<'a>(block: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = block.find(&open)? + open.len();
    let end = block[start..].find(&close)? + start;
    Some(&block[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types() -> Vec<String> {
        vec!["discovery".into(), "bugfix".into(), "feature".into()]
    }

    #[test]
    fn parses_multiple_observations() {
        let text = r#"
<observation>
  <type>bugfix</type>
  <title>Fix off-by-one in pager</title>
  <facts><fact>page index starts at 0</fact><fact>limit was inclusive</fact></facts>
  <narrative>The pager skipped the last row.</narrative>
  <concepts><concept>pagination</concept></concepts>
  <files_read><file>src/pager.rs</file></files_read>
  <files_modified><file>src/pager.rs</file></files_modified>
</observation>
noise between blocks
<observation>
  <type>feature</type>
  <title>Add CSV export</title>
</observation>"#;
        let out = parse_output(text, &types());
        assert_eq!(out.observations.len(), 2);
        let first = &out.observations[0];
        assert_eq!(first.obs_type, "bugfix");
        assert_eq!(first.facts, vec!["page index starts at 0", "limit was inclusive"]);
        assert_eq!(first.files_modified, vec!["src/pager.rs"]);
        assert_eq!(first.concepts, vec!["pagination"]);
        assert_eq!(out.observations[1].title.as_deref(), Some("Add CSV export"));
        assert!(out.summary.is_none());
    }

    #[test]
    fn unknown_type_falls_back_to_first_allowed() {
        let out = parse_output(
            "<observation><type>musing</type><title>t</title></observation>",
            &types(),
        );
        assert_eq!(out.observations[0].obs_type, "discovery");
    }

    #[test]
    fn empty_blocks_are_dropped() {
        let out = parse_output(
            "<observation><type>bugfix</type></observation><summary></summary>",
            &types(),
        );
        assert!(out.observations.is_empty());
        assert!(out.summary.is_none());
    }

    #[test]
    fn parses_summary() {
        let text = "<summary><request>add login</request><learned>tokens expire</learned>\
                    <next_steps>write tests</next_steps></summary>";
        let s = parse_output(text, &types()).summary.unwrap();
        assert_eq!(s.request.as_deref(), Some("add login"));
        assert_eq!(s.learned.as_deref(), Some("tokens expire"));
        assert_eq!(s.next_steps.as_deref(), Some("write tests"));
        assert!(s.notes.is_none());
    }

    #[test]
    fn plain_text_yields_nothing() {
        assert_eq!(parse_output("nothing notable here", &types()), ParsedOutput::default());
    }
}

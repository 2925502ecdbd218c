//! Recent-memory context for injection at session start.
//!
//! Formats the newest summaries and observations of a project as markdown, stopping once
//! the estimated token count (chars / 4) would exceed the budget.

use anyhow::Result;
use rusqlite::Connection;
use serde::Serialize;

use crate::config::ContextConfig;
use crate::memory::query::{recent_observations, recent_summaries};
use crate::memory::types::{Observation, SessionSummary};

#[derive(Debug, Clone, Serialize)]
pub struct InjectedContext {
    pub project: String,
    pub text: String,
    pub observations: usize,
    pub summaries: usize,
    pub estimated_tokens: usize,
    pub truncated: bool,
}

pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

fn summary_block(s: &SessionSummary) -> String {
    let mut out = format!("### Session summary ({})\n", s.created_at);
    for (label, value) in s.fields() {
        if let Some(v) = value.filter(|v| !v.trim().is_empty()) {
            out.push_str(&format!("- **{label}**: {}\n", v.trim()));
        }
    }
    out
}

fn observation_line(o: &Observation) -> String {
    let title = o.title.as_deref().unwrap_or("(untitled)");
    let mut line = format!("- #{} [{}] {}", o.id, o.obs_type, title);
    if let Some(sub) = o.subtitle.as_deref().filter(|s| !s.is_empty()) {
        line.push_str(&format!(": {sub}"));
    }
    if !o.files_modified.is_empty() {
        line.push_str(&format!(" (modified: {})", o.files_modified.join(", ")));
    }
    line.push('\n');
    line
}

pub fn build_context(
    conn: &Connection,
    project: &str,
    config: &ContextConfig,
) -> Result<InjectedContext> {
    let summaries = recent_summaries(conn, project, config.summary_count)?;
    let observations = recent_observations(conn, project, config.observation_count)?;

    let mut text = format!("# Recent memory for {project}\n\n");
    let mut used_summaries = 0;
    let mut used_observations = 0;
    let mut truncated = false;

    if summaries.is_empty() && observations.is_empty() {
        text.push_str("No previous sessions recorded for this project.\n");
    }

    for s in &summaries {
        let block = summary_block(s);
        if estimate_tokens(&text) + estimate_tokens(&block) > config.token_budget {
            truncated = true;
            break;
        }
        text.push_str(&block);
        text.push('\n');
        used_summaries += 1;
    }

    if !truncated && !observations.is_empty() {
        text.push_str("## Recent observations\n");
        for o in &observations {
            let line = observation_line(o);
            if estimate_tokens(&text) + estimate_tokens(&line) > config.token_budget {
                truncated = true;
                break;
            }
            text.push_str(&line);
            used_observations += 1;
        }
    }

    Ok(InjectedContext {
        project: project.to_string(),
        estimated_tokens: estimate_tokens(&text),
        text,
        observations: used_observations,
        summaries: used_summaries,
        truncated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;
    use crate::memory::store::{store_batch, BatchWrite};
    use crate::memory::types::{ParsedObservation, ParsedSummary};

    fn seed(conn: &mut Connection, n: usize) {
        store_batch(
            conn,
            &BatchWrite {
                memory_session_id: "mem".into(),
                project: "demo".into(),
                observations: (0..n)
                    .map(|i| ParsedObservation {
                        obs_type: "feature".into(),
                        title: Some(format!("Added endpoint number {i}")),
                        files_modified: vec!["src/api/mod.rs".into()],
                        ..Default::default()
                    })
                    .collect(),
                summary: Some(ParsedSummary {
                    request: Some("add endpoints".into()),
                    completed: Some("all of them".into()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .unwrap();
    }

    #[test]
    fn empty_project_has_placeholder() {
        let conn = open_memory_database().unwrap();
        let ctx = build_context(&conn, "demo", &ContextConfig::default()).unwrap();
        assert!(ctx.text.contains("No previous sessions"));
        assert_eq!(ctx.observations, 0);
    }

    #[test]
    fn context_includes_summary_and_observations() {
        let mut conn = open_memory_database().unwrap();
        seed(&mut conn, 3);
        let ctx = build_context(&conn, "demo", &ContextConfig::default()).unwrap();
        assert_eq!(ctx.summaries, 1);
        assert_eq!(ctx.observations, 3);
        assert!(ctx.text.contains("**request**: add endpoints"));
        assert!(!ctx.truncated);
    }

    #[test]
    fn budget_truncates() {
        let mut conn = open_memory_database().unwrap();
        seed(&mut conn, 50);
        let config = ContextConfig {
            token_budget: 120,
            ..Default::default()
        };
        let ctx = build_context(&conn, "demo", &config).unwrap();
        assert!(ctx.truncated);
        assert!(ctx.estimated_tokens <= 120);
        assert!(ctx.observations < 50);
    }
}

//! Native log-format parsers for the supported agent CLIs.
//!
//! Each agent gets a module of free functions; dispatch is a `match` over
//! [`AgentKind`]. Parse failure always means an empty result — transcript
//! files are append-only and a torn trailing write is expected during live
//! tailing, so malformed JSON is swallowed, never surfaced.

pub mod claude_code;
pub mod codex;
pub mod gemini;

use chrono::{DateTime, Utc};

use crate::model::{AgentActivity, AgentKind};

/// Session identity extracted from the first readable unit of a log file.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionMeta {
    pub session_id: String,
    pub project_path: String,
    pub started_at: Option<DateTime<Utc>>,
}

/// Parse one batch of new lines from a session file into activities.
///
/// For the JSON-lines agents each line is parsed independently; Gemini
/// checkpoints are whole-file JSON, so the batch is rejoined first.
pub fn parse_lines(
    agent: AgentKind,
    lines: &[String],
    session_id: &str,
    file_path: &str,
) -> Vec<AgentActivity> {
    match agent {
        AgentKind::ClaudeCode => lines
            .iter()
            .flat_map(|line| claude_code::parse_line(line, file_path))
            .collect(),
        AgentKind::Codex => lines
            .iter()
            .flat_map(|line| codex::parse_line(line, session_id))
            .collect(),
        AgentKind::Gemini => gemini::parse_checkpoint(&lines.join("\n")),
    }
}

/// Extract `(sessionId, projectPath)` from the first readable content of a
/// session file. Returns `None` until the identifying record has been
/// written by the agent.
pub fn extract_session_meta(
    agent: AgentKind,
    lines: &[String],
    file_path: &str,
) -> Option<SessionMeta> {
    match agent {
        AgentKind::ClaudeCode => claude_code::extract_session_meta(lines, file_path),
        AgentKind::Codex => lines.first().and_then(|line| codex::extract_session_meta(line)),
        AgentKind::Gemini => gemini::extract_session_meta(&lines.join("\n")),
    }
}

/// Parse an RFC 3339 timestamp, falling back to `now` for records that omit
/// or mangle it.
pub(crate) fn parse_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ActivityPayload;

    #[test]
    fn malformed_json_is_swallowed_for_every_agent() {
        let lines = vec!["{not json at all".to_string()];
        for agent in AgentKind::all() {
            assert!(parse_lines(agent, &lines, "s1", "/tmp/x.jsonl").is_empty());
            assert!(extract_session_meta(agent, &lines, "/tmp/x.jsonl").is_none());
        }
    }

    #[test]
    fn claude_jsonl_first_line_then_tool_use() {
        // Line 1 carries the session identity, line 2 is a tool-use record.
        let lines = vec![
            r#"{"type":"user","sessionId":"s1","cwd":"/tmp/proj","timestamp":"2026-03-01T10:00:00Z","message":{"role":"user","content":[{"type":"text","text":"hi"}]}}"#.to_string(),
            r#"{"type":"assistant","sessionId":"s1","timestamp":"2026-03-01T10:00:05Z","message":{"role":"assistant","content":[{"type":"tool_use","id":"t1","name":"Bash","input":{"command":"ls"}}]}}"#.to_string(),
        ];

        let meta = extract_session_meta(AgentKind::ClaudeCode, &lines, "/tmp/session.jsonl")
            .expect("meta");
        assert_eq!(meta.session_id, "s1");
        assert_eq!(meta.project_path, "/tmp/proj");

        let activities = parse_lines(AgentKind::ClaudeCode, &lines, "s1", "/tmp/session.jsonl");
        let tool_use = activities
            .iter()
            .find(|a| a.payload.is_tool_use())
            .expect("tool_use activity");
        assert_eq!(tool_use.session_id, "s1");
        match &tool_use.payload {
            ActivityPayload::ToolUse { tool_name, .. } => assert_eq!(tool_name, "bash"),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn parse_timestamp_falls_back_to_now() {
        let before = Utc::now();
        let parsed = parse_timestamp(Some("garbage"));
        assert!(parsed >= before);

        let fixed = parse_timestamp(Some("2026-03-01T10:00:00Z"));
        assert_eq!(fixed.to_rfc3339(), "2026-03-01T10:00:00+00:00");
    }
}

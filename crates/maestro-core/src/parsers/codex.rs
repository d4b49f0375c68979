//! Codex CLI rollout JSONL parser.
//!
//! The first record of a rollout file is a `session_meta` carrying the
//! session id and cwd; everything after is an `event_msg` with a typed
//! payload. Codex does not timestamp individual events, so activities are
//! stamped at parse time.

use serde::Deserialize;
use serde_json::Value;

use super::{parse_timestamp, SessionMeta};
use crate::model::{truncate_content, ActivityPayload, AgentActivity, AgentKind};

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum CodexLine {
    #[serde(rename = "session_meta", rename_all = "camelCase")]
    SessionMeta {
        session_id: String,
        cwd: String,
        #[serde(default)]
        start_time: Option<String>,
    },
    #[serde(rename = "event_msg")]
    EventMsg { payload: CodexPayload },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CodexPayload {
    UserMessage {
        #[serde(default)]
        content: String,
    },
    AgentMessage {
        #[serde(default)]
        content: String,
    },
    ToolCall {
        name: String,
        #[serde(default)]
        arguments: Value,
    },
    ToolResult {
        name: String,
        #[serde(default)]
        output: String,
        #[serde(default)]
        success: bool,
    },
    ExecCommand {
        command: String,
        #[serde(default)]
        cwd: Option<String>,
    },
    ExecResult {
        exit_code: i32,
        #[serde(default)]
        stdout: String,
        #[serde(default)]
        stderr: String,
    },
    FileEdit {
        path: String,
    },
    Error {
        message: String,
        #[serde(default)]
        code: Option<String>,
    },
    /// Bookkeeping record, not surfaced as an activity.
    TokenCount {
        #[serde(default)]
        input: u64,
        #[serde(default)]
        output: u64,
    },
}

fn arg_str<'a>(args: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| args.get(*key).and_then(Value::as_str))
}

fn tool_summary(name: &str, args: &Value) -> String {
    let lower = name.to_lowercase();
    if lower.contains("read") || lower.contains("file") {
        return format!("Read {}", arg_str(args, &["path", "file"]).unwrap_or("file"));
    }
    if lower.contains("write") {
        return format!("Write {}", arg_str(args, &["path", "file"]).unwrap_or("file"));
    }
    if lower.contains("search") {
        return format!("Search: \"{}\"", arg_str(args, &["query", "pattern"]).unwrap_or(""));
    }
    name.to_string()
}

/// Parse one rollout line into zero or more activities attributed to
/// `session_id` (the id comes from the file's `session_meta`, not the line).
pub fn parse_line(line: &str, session_id: &str) -> Vec<AgentActivity> {
    let Ok(parsed) = serde_json::from_str::<CodexLine>(line) else {
        return Vec::new();
    };

    let make = |timestamp, payload| {
        AgentActivity::new(session_id.to_string(), AgentKind::Codex, timestamp, payload)
    };

    match parsed {
        CodexLine::SessionMeta { cwd, start_time, .. } => {
            vec![make(
                parse_timestamp(start_time.as_deref()),
                ActivityPayload::SessionStart {
                    project_path: cwd.clone(),
                    cwd,
                },
            )]
        }
        CodexLine::EventMsg { payload } => {
            let now = parse_timestamp(None);
            let payload = match payload {
                CodexPayload::UserMessage { content } => {
                    let (content, truncated) = truncate_content(&content, 2000);
                    ActivityPayload::UserPrompt { content, truncated }
                }
                CodexPayload::AgentMessage { content } => {
                    let (content, truncated) = truncate_content(&content, 2000);
                    ActivityPayload::AssistantMessage { content, truncated }
                }
                CodexPayload::ToolCall { name, arguments } => {
                    let summary = tool_summary(&name, &arguments);
                    ActivityPayload::ToolUse {
                        tool_name: name.to_lowercase(),
                        tool_input: arguments,
                        summary,
                    }
                }
                CodexPayload::ToolResult { name, output, success } => {
                    let (output, _) = truncate_content(&output, 500);
                    ActivityPayload::ToolResult {
                        tool_name: name.to_lowercase(),
                        success,
                        output,
                        error: None,
                    }
                }
                CodexPayload::ExecCommand { command, cwd } => {
                    let (shortened, _) = truncate_content(&command, 50);
                    ActivityPayload::ToolUse {
                        tool_name: "bash".into(),
                        tool_input: serde_json::json!({ "command": command, "cwd": cwd }),
                        summary: format!("Run: {shortened}"),
                    }
                }
                CodexPayload::ExecResult { exit_code, stdout, stderr } => {
                    let success = exit_code == 0;
                    let raw = if stdout.is_empty() { stderr.clone() } else { stdout };
                    let (output, _) = truncate_content(&raw, 500);
                    ActivityPayload::ToolResult {
                        tool_name: "bash".into(),
                        success,
                        output,
                        error: (!success).then_some(stderr),
                    }
                }
                CodexPayload::FileEdit { path } => ActivityPayload::ToolUse {
                    tool_name: "edit".into(),
                    tool_input: serde_json::json!({ "path": path }),
                    summary: format!("Edit {path}"),
                },
                CodexPayload::Error { message, code } => ActivityPayload::Error {
                    error_kind: code.unwrap_or_else(|| "unknown".into()),
                    message,
                },
                CodexPayload::TokenCount { .. } => return Vec::new(),
            };
            vec![make(now, payload)]
        }
    }
}

/// Extract session identity from a rollout file's first line.
pub fn extract_session_meta(first_line: &str) -> Option<SessionMeta> {
    match serde_json::from_str::<CodexLine>(first_line) {
        Ok(CodexLine::SessionMeta { session_id, cwd, start_time }) => Some(SessionMeta {
            session_id,
            project_path: cwd,
            started_at: start_time
                .as_deref()
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&chrono::Utc)),
        }),
        _ => None,
    }
}

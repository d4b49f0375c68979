//! Claude Code session JSONL parser.
//!
//! Each line is a JSON object with a `type` (user/assistant/system), a
//! `message.content` array, a `sessionId` and an optional `cwd`. The project
//! path is additionally encoded into the transcript's parent directory name
//! (`~/.claude/projects/-Users-vm-proj/…`, dashes standing in for slashes).

use serde::Deserialize;
use serde_json::Value;

use super::{parse_timestamp, SessionMeta};
use crate::model::{truncate_content, ActivityPayload, AgentActivity, AgentKind};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClaudeLine {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<ClaudeMessage>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    cwd: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClaudeMessage {
    /// Kept as raw values so one unrecognized content item never poisons
    /// the rest of the line.
    #[serde(default)]
    content: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClaudeContent {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: Option<bool>,
    },
}

/// Claude Code's internal tool names, normalized to our lowercase scheme.
fn normalize_tool_name(name: &str) -> String {
    match name {
        "Read" => "read".into(),
        "Write" => "write".into(),
        "Edit" => "edit".into(),
        "MultiEdit" => "multi_edit".into(),
        "Bash" => "bash".into(),
        "Glob" => "glob".into(),
        "Grep" => "grep".into(),
        "LS" => "ls".into(),
        "TodoRead" => "todo_read".into(),
        "TodoWrite" => "todo_write".into(),
        "WebFetch" => "web_fetch".into(),
        "WebSearch" => "web_search".into(),
        "NotebookRead" => "notebook_read".into(),
        "NotebookEdit" => "notebook_edit".into(),
        "Task" => "task".into(),
        other => other.to_lowercase(),
    }
}

fn input_str<'a>(input: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| input.get(*key).and_then(Value::as_str))
}

/// Human-readable one-liner for a tool invocation.
fn tool_summary(raw_name: &str, normalized: &str, input: &Value) -> String {
    match normalized {
        "read" => format!("Read {}", input_str(input, &["file_path", "path"]).unwrap_or("file")),
        "write" => format!("Write {}", input_str(input, &["file_path", "path"]).unwrap_or("file")),
        "edit" => format!("Edit {}", input_str(input, &["file_path", "path"]).unwrap_or("file")),
        "multi_edit" => format!(
            "Multi-edit {}",
            input_str(input, &["file_path", "path"]).unwrap_or("file")
        ),
        "bash" => {
            let cmd = input_str(input, &["command"]).unwrap_or("");
            let (shortened, truncated) = truncate_content(cmd, 50);
            if truncated {
                format!("Run: {shortened}")
            } else {
                format!("Run: {cmd}")
            }
        }
        "glob" => format!("Find files: {}", input_str(input, &["pattern"]).unwrap_or("*")),
        "grep" => format!(
            "Search: \"{}\"",
            input_str(input, &["pattern", "query"]).unwrap_or("")
        ),
        "ls" => format!("List {}", input_str(input, &["path"]).unwrap_or(".")),
        "web_fetch" => format!("Fetch {}", input_str(input, &["url"]).unwrap_or("URL")),
        "web_search" => format!("Search web: \"{}\"", input_str(input, &["query"]).unwrap_or("")),
        "task" => {
            let desc: String = input_str(input, &["description", "prompt"])
                .unwrap_or("")
                .chars()
                .take(40)
                .collect();
            format!("Task: {desc}...")
        }
        _ => raw_name.to_string(),
    }
}

/// Tool result content can be a plain string or a content-block array.
fn result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Parse one JSONL line into zero or more activities.
pub fn parse_line(line: &str, _file_path: &str) -> Vec<AgentActivity> {
    let Ok(parsed) = serde_json::from_str::<ClaudeLine>(line) else {
        return Vec::new();
    };
    let Some(session_id) = parsed.session_id else {
        return Vec::new();
    };

    let timestamp = parse_timestamp(parsed.timestamp.as_deref());
    let contents = parsed.message.map(|m| m.content).unwrap_or_default();

    let mut activities = Vec::new();

    match parsed.kind.as_str() {
        "user" => {
            for item in &contents {
                if let Ok(ClaudeContent::Text { text }) =
                    serde_json::from_value::<ClaudeContent>(item.clone())
                {
                    let (content, truncated) = truncate_content(&text, 2000);
                    activities.push(AgentActivity::new(
                        session_id.clone(),
                        AgentKind::ClaudeCode,
                        timestamp,
                        ActivityPayload::UserPrompt { content, truncated },
                    ));
                }
            }
        }
        "assistant" => {
            for item in &contents {
                let Ok(content) = serde_json::from_value::<ClaudeContent>(item.clone()) else {
                    continue;
                };
                let payload = match content {
                    ClaudeContent::Text { text } => {
                        let (content, truncated) = truncate_content(&text, 2000);
                        ActivityPayload::AssistantMessage { content, truncated }
                    }
                    ClaudeContent::Thinking { thinking } => {
                        let (content, truncated) = truncate_content(&thinking, 1000);
                        ActivityPayload::AssistantThinking { content, truncated }
                    }
                    ClaudeContent::ToolUse { name, input } => {
                        let normalized = normalize_tool_name(&name);
                        let summary = tool_summary(&name, &normalized, &input);
                        ActivityPayload::ToolUse {
                            tool_name: normalized,
                            tool_input: input,
                            summary,
                        }
                    }
                    ClaudeContent::ToolResult { content, is_error } => {
                        let is_error = is_error.unwrap_or(false);
                        let text = result_text(&content);
                        let (output, _) = truncate_content(&text, 500);
                        ActivityPayload::ToolResult {
                            // Tool name comes from the paired tool_use.
                            tool_name: "unknown".into(),
                            success: !is_error,
                            output,
                            error: is_error.then_some(text),
                        }
                    }
                };
                activities.push(AgentActivity::new(
                    session_id.clone(),
                    AgentKind::ClaudeCode,
                    timestamp,
                    payload,
                ));
            }
        }
        "system" => {
            // System messages mark session boundaries.
            let text: String = contents
                .iter()
                .filter_map(|item| {
                    match serde_json::from_value::<ClaudeContent>(item.clone()) {
                        Ok(ClaudeContent::Text { text }) => Some(text),
                        _ => None,
                    }
                })
                .collect::<Vec<_>>()
                .join("\n");

            if text.contains("session") || text.contains("starting") {
                let cwd = parsed.cwd.unwrap_or_default();
                activities.push(AgentActivity::new(
                    session_id,
                    AgentKind::ClaudeCode,
                    timestamp,
                    ActivityPayload::SessionStart {
                        project_path: cwd.clone(),
                        cwd,
                    },
                ));
            }
        }
        _ => {}
    }

    activities
}

/// Extract session identity from the first lines of a transcript.
///
/// The project path comes from the encoded directory name when it decodes to
/// a clean absolute path, else from the `cwd` field of the first record.
pub fn extract_session_meta(lines: &[String], file_path: &str) -> Option<SessionMeta> {
    for line in lines {
        let Ok(parsed) = serde_json::from_str::<ClaudeLine>(line) else {
            continue;
        };
        let Some(session_id) = parsed.session_id else {
            continue;
        };

        let cwd = parsed.cwd.unwrap_or_default();
        let project_path = decode_project_dir(file_path).unwrap_or_else(|| cwd.clone());

        return Some(SessionMeta {
            session_id,
            project_path,
            started_at: parsed
                .timestamp
                .as_deref()
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&chrono::Utc)),
        });
    }
    None
}

/// Decode `~/.claude/projects/-Users-vm-proj/session.jsonl` into
/// `/Users/vm/proj`. Rejects anything that does not decode to a traversal-free
/// absolute path.
fn decode_project_dir(file_path: &str) -> Option<String> {
    let parts: Vec<&str> = file_path.split('/').collect();
    let projects_idx = parts.iter().position(|p| *p == "projects")?;
    let encoded = parts.get(projects_idx + 1)?;

    let rest = encoded.strip_prefix('-')?;
    let decoded = format!("/{}", rest.replace('-', "/"));
    if decoded.split('/').any(|part| part == "..") {
        return None;
    }
    Some(decoded)
}

//! Gemini CLI checkpoint parser.
//!
//! Gemini writes whole-file JSON checkpoints under
//! `~/.gemini/tmp/<hash>/checkpoints/*.json` rather than streaming JSONL, so
//! the parser takes the full file content every time.

use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use super::{parse_timestamp, SessionMeta};
use crate::model::{truncate_content, ActivityPayload, AgentActivity, AgentKind};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCheckpoint {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    working_directory: Option<String>,
    #[serde(default)]
    messages: Vec<GeminiMessage>,
    #[serde(default)]
    tool_calls: Vec<GeminiToolCall>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiMessage {
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiToolCall {
    name: String,
    #[serde(default)]
    args: Value,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    timestamp: Option<String>,
}

fn tool_summary(name: &str, args: &Value) -> String {
    if let Some(path) = args
        .get("path")
        .or_else(|| args.get("file"))
        .and_then(Value::as_str)
    {
        return format!("{name} {path}");
    }
    if let Some(command) = args.get("command").and_then(Value::as_str) {
        let (shortened, _) = truncate_content(command, 50);
        return format!("Run: {shortened}");
    }
    if let Some(query) = args.get("query").and_then(Value::as_str) {
        let (shortened, _) = truncate_content(query, 30);
        return format!("{name}: \"{shortened}\"");
    }
    name.to_string()
}

/// Parse a full checkpoint file into activities.
pub fn parse_checkpoint(content: &str) -> Vec<AgentActivity> {
    let Ok(checkpoint) = serde_json::from_str::<GeminiCheckpoint>(content) else {
        return Vec::new();
    };

    let session_id = checkpoint
        .session_id
        .or(checkpoint.id)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // Per-entry timestamps are optional; fall back to checkpoint-level ones.
    let fallback = checkpoint
        .timestamp
        .as_deref()
        .or(checkpoint.updated_at.as_deref());

    let mut activities = Vec::new();

    for msg in &checkpoint.messages {
        let timestamp = parse_timestamp(msg.timestamp.as_deref().or(fallback));
        let payload = match msg.role.as_str() {
            "user" => {
                let (content, truncated) = truncate_content(&msg.content, 2000);
                ActivityPayload::UserPrompt { content, truncated }
            }
            "model" => {
                let (content, truncated) = truncate_content(&msg.content, 2000);
                ActivityPayload::AssistantMessage { content, truncated }
            }
            _ => continue,
        };
        activities.push(AgentActivity::new(
            session_id.clone(),
            AgentKind::Gemini,
            timestamp,
            payload,
        ));
    }

    for tool in &checkpoint.tool_calls {
        let timestamp = parse_timestamp(tool.timestamp.as_deref().or(fallback));
        activities.push(AgentActivity::new(
            session_id.clone(),
            AgentKind::Gemini,
            timestamp,
            ActivityPayload::ToolUse {
                tool_name: tool.name.to_lowercase(),
                tool_input: tool.args.clone(),
                summary: tool_summary(&tool.name, &tool.args),
            },
        ));

        if let Some(result) = &tool.result {
            let (output, _) = truncate_content(result, 500);
            activities.push(AgentActivity::new(
                session_id.clone(),
                AgentKind::Gemini,
                timestamp,
                ActivityPayload::ToolResult {
                    tool_name: tool.name.to_lowercase(),
                    success: tool.success != Some(false),
                    output,
                    error: None,
                },
            ));
        }
    }

    activities
}

/// Extract session identity from a checkpoint. Unlike activity parsing this
/// never invents an id — an unidentifiable checkpoint yields no session.
pub fn extract_session_meta(content: &str) -> Option<SessionMeta> {
    let checkpoint = serde_json::from_str::<GeminiCheckpoint>(content).ok()?;
    let session_id = checkpoint.session_id.or(checkpoint.id)?;
    let cwd = checkpoint
        .cwd
        .or(checkpoint.working_directory)
        .unwrap_or_default();

    Some(SessionMeta {
        session_id,
        project_path: cwd,
        started_at: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHECKPOINT: &str = r#"{
        "sessionId": "gem-1",
        "cwd": "/tmp/proj",
        "timestamp": "2026-03-01T11:00:00Z",
        "messages": [
            {"role": "user", "content": "add a test"},
            {"role": "model", "content": "done", "timestamp": "2026-03-01T11:00:10Z"},
            {"role": "system", "content": "ignored"}
        ],
        "toolCalls": [
            {"name": "ReadFile", "args": {"path": "/tmp/proj/a.rs"}, "result": "fn main() {}", "success": true}
        ]
    }"#;

    #[test]
    fn checkpoint_yields_messages_and_tools() {
        let activities = parse_checkpoint(CHECKPOINT);
        let kinds: Vec<&str> = activities.iter().map(|a| a.payload.kind()).collect();
        assert_eq!(
            kinds,
            vec!["user_prompt", "assistant_message", "tool_use", "tool_result"]
        );
        assert!(activities.iter().all(|a| a.session_id == "gem-1"));
    }

    #[test]
    fn message_without_timestamp_uses_checkpoint_timestamp() {
        let activities = parse_checkpoint(CHECKPOINT);
        assert_eq!(
            activities[0].timestamp.to_rfc3339(),
            "2026-03-01T11:00:00+00:00"
        );
        assert_eq!(
            activities[1].timestamp.to_rfc3339(),
            "2026-03-01T11:00:10+00:00"
        );
    }

    #[test]
    fn tool_summary_uses_path_then_command_then_query() {
        assert_eq!(
            tool_summary("ReadFile", &serde_json::json!({"path": "/a"})),
            "ReadFile /a"
        );
        assert_eq!(
            tool_summary("Shell", &serde_json::json!({"command": "ls -la"})),
            "Run: ls -la"
        );
        assert_eq!(
            tool_summary("Search", &serde_json::json!({"query": "todo"})),
            "Search: \"todo\""
        );
        assert_eq!(tool_summary("Custom", &serde_json::json!({})), "Custom");
    }

    #[test]
    fn meta_accepts_id_and_working_directory_aliases() {
        let meta = extract_session_meta(
            r#"{"id": "gem-2", "workingDirectory": "/home/vm/x"}"#,
        )
        .expect("meta");
        assert_eq!(meta.session_id, "gem-2");
        assert_eq!(meta.project_path, "/home/vm/x");
    }

    #[test]
    fn meta_requires_a_session_id() {
        assert!(extract_session_meta(r#"{"cwd": "/tmp"}"#).is_none());
    }
}

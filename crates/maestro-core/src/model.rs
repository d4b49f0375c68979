//! Session and activity data model.
//!
//! One [`AgentSession`] per agent run, identified by the id the agent itself
//! minted. Activities are normalized events extracted from the agent's
//! native log format and are immutable once created.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Supported agent CLI families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentKind {
    ClaudeCode,
    Codex,
    Gemini,
}

impl AgentKind {
    pub fn display_name(&self) -> &'static str {
        match self {
            AgentKind::ClaudeCode => "Claude Code",
            AgentKind::Codex => "Codex CLI",
            AgentKind::Gemini => "Gemini CLI",
        }
    }

    pub fn all() -> [AgentKind; 3] {
        [AgentKind::ClaudeCode, AgentKind::Codex, AgentKind::Gemini]
    }
}

/// How the session came to exist: spawned by the host's own PTY launcher or
/// observed running externally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionSource {
    MaestroPty,
    External,
}

/// Lifecycle status. `Ended` is terminal — a session is never resurrected;
/// a new run produces a new session object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Idle,
    Ended,
}

/// One run of an agent CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSession {
    /// Stable id derived from the agent's own session identifier.
    pub id: String,
    pub agent: AgentKind,
    pub source: SessionSource,
    pub project_path: String,
    /// The log file this session was discovered from.
    pub file_path: String,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,
    pub message_count: u64,
    pub tool_use_count: u64,
    /// Correlation to a host-UI workspace, if the project is bound to one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub space_id: Option<String>,
}

impl AgentSession {
    pub fn project_name(&self) -> &str {
        self.project_path
            .rsplit('/')
            .find(|part| !part.is_empty())
            .unwrap_or(&self.project_path)
    }
}

/// Type-specific payload of a normalized activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityPayload {
    #[serde(rename_all = "camelCase")]
    SessionStart { cwd: String, project_path: String },
    UserPrompt {
        content: String,
        truncated: bool,
    },
    AssistantMessage {
        content: String,
        truncated: bool,
    },
    AssistantThinking {
        content: String,
        truncated: bool,
    },
    #[serde(rename_all = "camelCase")]
    ToolUse {
        tool_name: String,
        tool_input: serde_json::Value,
        summary: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        tool_name: String,
        success: bool,
        output: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Error { error_kind: String, message: String },
}

impl ActivityPayload {
    /// Stable wire name of the variant, matching the serde tag.
    pub fn kind(&self) -> &'static str {
        match self {
            ActivityPayload::SessionStart { .. } => "session_start",
            ActivityPayload::UserPrompt { .. } => "user_prompt",
            ActivityPayload::AssistantMessage { .. } => "assistant_message",
            ActivityPayload::AssistantThinking { .. } => "assistant_thinking",
            ActivityPayload::ToolUse { .. } => "tool_use",
            ActivityPayload::ToolResult { .. } => "tool_result",
            ActivityPayload::Error { .. } => "error",
        }
    }

    pub fn is_message(&self) -> bool {
        matches!(
            self,
            ActivityPayload::UserPrompt { .. } | ActivityPayload::AssistantMessage { .. }
        )
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, ActivityPayload::ToolUse { .. })
    }
}

/// One normalized event belonging to exactly one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentActivity {
    pub id: Uuid,
    pub session_id: String,
    pub agent: AgentKind,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: ActivityPayload,
}

impl AgentActivity {
    pub fn new(
        session_id: impl Into<String>,
        agent: AgentKind,
        timestamp: DateTime<Utc>,
        payload: ActivityPayload,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            agent,
            timestamp,
            payload,
        }
    }
}

/// A filesystem subtree the host UI has bound to a workspace. When at least
/// one repo is connected, sessions outside every connected repo are dropped
/// at ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedRepo {
    pub path: String,
    pub absolute_path: String,
    pub space_id: String,
    pub monitoring_enabled: bool,
}

impl ConnectedRepo {
    /// Whether `project_path` is this repo or a descendant of it.
    pub fn contains(&self, project_path: &str) -> bool {
        project_path == self.absolute_path
            || project_path.starts_with(&format!("{}/", self.absolute_path))
    }
}

/// Truncate to `max` characters, appending `...` when anything was cut.
/// Returns the (possibly shortened) text and whether truncation happened.
pub fn truncate_content(content: &str, max: usize) -> (String, bool) {
    if content.chars().count() <= max {
        return (content.to_string(), false);
    }
    let kept: String = content.chars().take(max.saturating_sub(3)).collect();
    (format!("{kept}..."), true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_kind_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&AgentKind::ClaudeCode).unwrap(),
            r#""claude-code""#
        );
        assert_eq!(serde_json::to_string(&AgentKind::Codex).unwrap(), r#""codex""#);
        assert_eq!(serde_json::to_string(&AgentKind::Gemini).unwrap(), r#""gemini""#);
    }

    #[test]
    fn session_status_roundtrip() {
        for status in [SessionStatus::Active, SessionStatus::Idle, SessionStatus::Ended] {
            let json = serde_json::to_string(&status).unwrap();
            let back: SessionStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(back, status);
        }
    }

    #[test]
    fn activity_payload_flattens_into_wire_shape() {
        let activity = AgentActivity::new(
            "s1",
            AgentKind::ClaudeCode,
            Utc::now(),
            ActivityPayload::ToolUse {
                tool_name: "bash".into(),
                tool_input: serde_json::json!({"command": "ls"}),
                summary: "Run: ls".into(),
            },
        );

        let value = serde_json::to_value(&activity).unwrap();
        assert_eq!(value["type"], "tool_use");
        assert_eq!(value["sessionId"], "s1");
        assert_eq!(value["agent"], "claude-code");
        assert_eq!(value["toolName"], "bash");
        assert_eq!(value["summary"], "Run: ls");
    }

    #[test]
    fn truncate_content_short_text_untouched() {
        let (text, truncated) = truncate_content("hello", 10);
        assert_eq!(text, "hello");
        assert!(!truncated);
    }

    #[test]
    fn truncate_content_cuts_and_marks() {
        let long = "x".repeat(50);
        let (text, truncated) = truncate_content(&long, 20);
        assert!(truncated);
        assert_eq!(text.chars().count(), 20);
        assert!(text.ends_with("..."));
    }

    #[test]
    fn connected_repo_contains_descendants_only() {
        let repo = ConnectedRepo {
            path: "proj".into(),
            absolute_path: "/home/vm/proj".into(),
            space_id: "space-1".into(),
            monitoring_enabled: true,
        };

        assert!(repo.contains("/home/vm/proj"));
        assert!(repo.contains("/home/vm/proj/src"));
        assert!(!repo.contains("/home/vm/proj-other"));
        assert!(!repo.contains("/home/vm"));
    }

    #[test]
    fn project_name_is_last_path_component() {
        let session = AgentSession {
            id: "s1".into(),
            agent: AgentKind::Codex,
            source: SessionSource::External,
            project_path: "/home/vm/widgets".into(),
            file_path: String::new(),
            started_at: Utc::now(),
            last_activity_at: Utc::now(),
            status: SessionStatus::Active,
            process_id: None,
            message_count: 0,
            tool_use_count: 0,
            space_id: None,
        };
        assert_eq!(session.project_name(), "widgets");
    }
}

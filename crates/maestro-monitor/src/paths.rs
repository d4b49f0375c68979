//! Where each agent CLI keeps its session data on disk.

use std::path::{Path, PathBuf};

use maestro_core::AgentKind;
use tracing::warn;

/// One agent's watch root plus the file shape that identifies its
/// transcripts inside it.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub agent: AgentKind,
    pub base_dir: PathBuf,
    /// Glob matched against the file name only (e.g. `*.jsonl`).
    pub file_pattern: String,
    /// Path component that must appear somewhere above the file
    /// (Gemini keeps checkpoints under a `checkpoints/` directory).
    pub required_component: Option<&'static str>,
}

impl WatchConfig {
    pub fn matches(&self, path: &Path) -> bool {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };

        let name_matches = match glob::Pattern::new(&self.file_pattern) {
            Ok(pattern) => pattern.matches(file_name),
            Err(e) => {
                warn!(pattern = %self.file_pattern, "invalid glob pattern: {e}");
                return false;
            }
        };
        if !name_matches {
            return false;
        }

        match self.required_component {
            Some(component) => path
                .components()
                .any(|c| c.as_os_str().to_str() == Some(component)),
            None => true,
        }
    }
}

/// Default watch configs rooted at the user's home directory.
pub fn default_configs() -> Vec<WatchConfig> {
    match home_dir() {
        Some(home) => configs_under(&home),
        None => {
            warn!("could not determine home directory, no agent directories watched");
            Vec::new()
        }
    }
}

/// Watch configs rooted at an explicit directory. Tests point this at a
/// tempdir laid out like a real home.
pub fn configs_under(home: &Path) -> Vec<WatchConfig> {
    vec![
        WatchConfig {
            agent: AgentKind::ClaudeCode,
            base_dir: home.join(".claude").join("projects"),
            file_pattern: "*.jsonl".into(),
            required_component: None,
        },
        WatchConfig {
            agent: AgentKind::Codex,
            base_dir: home.join(".codex").join("sessions"),
            file_pattern: "*.jsonl".into(),
            required_component: None,
        },
        WatchConfig {
            agent: AgentKind::Gemini,
            base_dir: home.join(".gemini").join("tmp"),
            file_pattern: "*.json".into(),
            required_component: Some("checkpoints"),
        },
    ]
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

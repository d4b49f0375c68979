//! Host-UI workspace cache.
//!
//! Spaces, tabs, and their contents belong to the desktop UI; the gateway
//! only mirrors the latest snapshot the host pushed and forwards create
//! requests back over a command channel, fire-and-forget.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// Tab kinds the host knows how to create.
pub const VALID_TAB_KINDS: &[&str] = &[
    "terminal",
    "browser",
    "notes",
    "agent",
    "app-launcher",
    "tasks",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabSnapshot {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceSnapshot {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_path: Option<String>,
    #[serde(default)]
    pub tabs: Vec<TabSnapshot>,
}

/// Requests the gateway forwards to the host UI.
#[derive(Debug, Clone, PartialEq)]
pub enum SpaceCommand {
    CreateTerminal {
        space_id: String,
    },
    CreateTab {
        space_id: String,
        kind: String,
        url: Option<String>,
    },
}

pub struct SpaceCache {
    spaces: Mutex<Vec<SpaceSnapshot>>,
    commands: mpsc::UnboundedSender<SpaceCommand>,
}

impl SpaceCache {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SpaceCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                spaces: Mutex::new(Vec::new()),
                commands: tx,
            }),
            rx,
        )
    }

    /// Replace the snapshot wholesale; the host owns the truth.
    pub fn update(&self, spaces: Vec<SpaceSnapshot>) {
        debug!(count = spaces.len(), "space cache updated");
        *self.spaces.lock().unwrap_or_else(|p| p.into_inner()) = spaces;
    }

    pub fn list(&self) -> Vec<SpaceSnapshot> {
        self.spaces.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn get(&self, space_id: &str) -> Option<SpaceSnapshot> {
        self.spaces
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .find(|s| s.id == space_id)
            .cloned()
    }

    /// Fire-and-forget; returns false only when the host side is gone.
    pub fn request(&self, command: SpaceCommand) -> bool {
        self.commands.send(command).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: &str) -> SpaceSnapshot {
        SpaceSnapshot {
            id: id.into(),
            name: format!("Space {id}"),
            color: None,
            icon: None,
            repo_path: None,
            tabs: Vec::new(),
        }
    }

    #[test]
    fn update_replaces_and_get_finds() {
        let (cache, _rx) = SpaceCache::new();
        cache.update(vec![snapshot("a"), snapshot("b")]);
        assert_eq!(cache.list().len(), 2);
        assert_eq!(cache.get("b").unwrap().name, "Space b");

        cache.update(vec![snapshot("c")]);
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn requests_reach_the_command_channel() {
        let (cache, mut rx) = SpaceCache::new();
        assert!(cache.request(SpaceCommand::CreateTerminal { space_id: "s".into() }));
        assert_eq!(
            rx.try_recv().unwrap(),
            SpaceCommand::CreateTerminal { space_id: "s".into() }
        );
    }

    #[test]
    fn request_fails_once_receiver_dropped() {
        let (cache, rx) = SpaceCache::new();
        drop(rx);
        assert!(!cache.request(SpaceCommand::CreateTerminal { space_id: "s".into() }));
    }
}

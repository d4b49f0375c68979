//! In-memory session and activity store.
//!
//! One mutex guards the whole registry so every state transition is atomic
//! with the event it emits. All state is rebuilt from the filesystem and
//! process table on restart; nothing here persists.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use maestro_core::{
    AgentActivity, AgentKind, AgentSession, ConnectedRepo, SessionSource, SessionStatus,
};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

const MAX_ACTIVITIES_PER_SESSION: usize = 500;
const MAX_TOTAL_ACTIVITIES: usize = 2000;
/// Sessions whose first observed activity is older than this are imported
/// as already ended so a backlog of historical transcripts does not flood
/// subscribers.
const STALE_SESSION_AGE_SECS: i64 = 60 * 60;

/// Emitted on every state transition and new activity, in registry order.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    SessionCreated(AgentSession),
    SessionUpdated(AgentSession),
    SessionEnded(AgentSession),
    ActivityAdded(AgentActivity),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub total_activities: usize,
    pub connected_repos: usize,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, AgentSession>,
    activities: HashMap<String, VecDeque<AgentActivity>>,
    global_activities: VecDeque<AgentActivity>,
    connected_repos: HashMap<String, ConnectedRepo>,
}

pub struct SessionRegistry {
    inner: Mutex<Inner>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned registry lock means a panicked writer; the data is
        // plain maps, safe to keep serving.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ------------------------------------------------------------------
    // Connected repos
    // ------------------------------------------------------------------

    pub fn connect_repo(&self, repo: ConnectedRepo) {
        info!(path = %repo.absolute_path, space = %repo.space_id, "connected repo");
        self.lock()
            .connected_repos
            .insert(repo.absolute_path.clone(), repo);
    }

    pub fn disconnect_repo(&self, absolute_path: &str) {
        info!(path = %absolute_path, "disconnected repo");
        self.lock().connected_repos.remove(absolute_path);
    }

    pub fn connected_repos(&self) -> Vec<ConnectedRepo> {
        self.lock().connected_repos.values().cloned().collect()
    }

    pub fn repo_for_path(&self, project_path: &str) -> Option<ConnectedRepo> {
        self.lock()
            .connected_repos
            .values()
            .find(|repo| repo.contains(project_path))
            .cloned()
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Create the session if unseen, or return the existing one.
    ///
    /// The repo-scoping filter applies here and only here: with at least one
    /// repo connected, sessions outside every repo are silently dropped.
    /// Sessions are never re-filtered retroactively.
    pub fn get_or_create_session(
        &self,
        session_id: &str,
        agent: AgentKind,
        source: SessionSource,
        project_path: &str,
        file_path: &str,
        started_at: Option<DateTime<Utc>>,
    ) -> Option<AgentSession> {
        let mut inner = self.lock();

        if let Some(existing) = inner.sessions.get(session_id) {
            return Some(existing.clone());
        }

        if !inner.connected_repos.is_empty()
            && !inner
                .connected_repos
                .values()
                .any(|repo| repo.contains(project_path))
        {
            debug!(session = %session_id, path = %project_path, "session outside connected repos, dropped");
            return None;
        }

        let space_id = inner
            .connected_repos
            .values()
            .find(|repo| repo.contains(project_path))
            .map(|repo| repo.space_id.clone());

        let now = Utc::now();
        let started = started_at.unwrap_or(now);
        let is_old = now - started > ChronoDuration::seconds(STALE_SESSION_AGE_SECS);

        let session = AgentSession {
            id: session_id.to_string(),
            agent,
            source,
            project_path: project_path.to_string(),
            file_path: file_path.to_string(),
            started_at: started,
            last_activity_at: started,
            status: if is_old { SessionStatus::Ended } else { SessionStatus::Active },
            process_id: None,
            message_count: 0,
            tool_use_count: 0,
            space_id,
        };

        inner.sessions.insert(session.id.clone(), session.clone());
        inner.activities.insert(session.id.clone(), VecDeque::new());

        if !is_old {
            info!(session = %session.id, agent = ?agent, path = %project_path, "session created");
            let _ = self.events.send(RegistryEvent::SessionCreated(session.clone()));
        }

        Some(session)
    }

    /// Append one activity. Dropped for unknown or ended sessions — ended is
    /// terminal and history does not reopen it.
    pub fn record_activity(&self, activity: AgentActivity) {
        let mut inner = self.lock();

        let Some(session) = inner.sessions.get_mut(&activity.session_id) else {
            return;
        };
        if session.status == SessionStatus::Ended {
            return;
        }

        session.last_activity_at = activity.timestamp.max(session.last_activity_at);
        if activity.payload.is_message() {
            session.message_count += 1;
        }
        if activity.payload.is_tool_use() {
            session.tool_use_count += 1;
        }

        if session.status == SessionStatus::Idle {
            session.status = SessionStatus::Active;
        }
        let session_snapshot = session.clone();

        let per_session = inner
            .activities
            .entry(activity.session_id.clone())
            .or_default();
        per_session.push_back(activity.clone());
        while per_session.len() > MAX_ACTIVITIES_PER_SESSION {
            per_session.pop_front();
        }

        inner.global_activities.push_back(activity.clone());
        while inner.global_activities.len() > MAX_TOTAL_ACTIVITIES {
            inner.global_activities.pop_front();
        }

        let _ = self.events.send(RegistryEvent::ActivityAdded(activity));
        let _ = self
            .events
            .send(RegistryEvent::SessionUpdated(session_snapshot));
    }

    /// Sweep every active session idle whose last activity predates the
    /// threshold. Called on a timer, not per-session.
    pub fn sweep_idle(&self, idle_threshold: std::time::Duration) -> usize {
        let mut inner = self.lock();
        let cutoff = Utc::now()
            - ChronoDuration::from_std(idle_threshold).unwrap_or(ChronoDuration::seconds(30));

        let mut transitioned = Vec::new();
        for session in inner.sessions.values_mut() {
            if session.status == SessionStatus::Active && session.last_activity_at < cutoff {
                session.status = SessionStatus::Idle;
                transitioned.push(session.clone());
            }
        }

        let count = transitioned.len();
        for session in transitioned {
            debug!(session = %session.id, "session idle");
            let _ = self.events.send(RegistryEvent::SessionUpdated(session));
        }
        count
    }

    /// Terminal transition. Idempotent; an ended session stays ended.
    pub fn end_session(&self, session_id: &str, reason: &str) {
        let mut inner = self.lock();
        let Some(session) = inner.sessions.get_mut(session_id) else {
            return;
        };
        if session.status == SessionStatus::Ended {
            return;
        }
        session.status = SessionStatus::Ended;
        session.last_activity_at = Utc::now();
        let snapshot = session.clone();
        info!(session = %session_id, reason = %reason, "session ended");
        let _ = self.events.send(RegistryEvent::SessionEnded(snapshot));
    }

    pub fn attach_process(&self, session_id: &str, pid: u32) {
        let mut inner = self.lock();
        let Some(session) = inner.sessions.get_mut(session_id) else {
            return;
        };
        if session.process_id.is_some() {
            return;
        }
        session.process_id = Some(pid);
        let snapshot = session.clone();
        let _ = self.events.send(RegistryEvent::SessionUpdated(snapshot));
    }

    /// Delete sessions that have been ended for longer than `max_age`, along
    /// with their activity lists.
    pub fn prune_ended(&self, max_age: std::time::Duration) -> usize {
        let mut inner = self.lock();
        let cutoff =
            Utc::now() - ChronoDuration::from_std(max_age).unwrap_or(ChronoDuration::hours(24));

        let stale: Vec<String> = inner
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Ended && s.last_activity_at < cutoff)
            .map(|s| s.id.clone())
            .collect();

        for id in &stale {
            inner.sessions.remove(id);
            inner.activities.remove(id);
        }

        if !stale.is_empty() {
            info!(pruned = stale.len(), "pruned old sessions");
        }
        stale.len()
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn sessions(&self) -> Vec<AgentSession> {
        self.lock().sessions.values().cloned().collect()
    }

    pub fn active_sessions(&self) -> Vec<AgentSession> {
        self.lock()
            .sessions
            .values()
            .filter(|s| s.status != SessionStatus::Ended)
            .cloned()
            .collect()
    }

    pub fn session(&self, session_id: &str) -> Option<AgentSession> {
        self.lock().sessions.get(session_id).cloned()
    }

    pub fn sessions_for_space(&self, space_id: &str) -> Vec<AgentSession> {
        self.lock()
            .sessions
            .values()
            .filter(|s| s.space_id.as_deref() == Some(space_id))
            .cloned()
            .collect()
    }

    pub fn activities(&self, session_id: &str, limit: usize) -> Vec<AgentActivity> {
        let inner = self.lock();
        match inner.activities.get(session_id) {
            Some(list) => list
                .iter()
                .rev()
                .take(limit)
                .rev()
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn recent_activities(&self, limit: usize) -> Vec<AgentActivity> {
        let inner = self.lock();
        inner
            .global_activities
            .iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.lock();
        RegistryStats {
            total_sessions: inner.sessions.len(),
            active_sessions: inner
                .sessions
                .values()
                .filter(|s| s.status != SessionStatus::Ended)
                .count(),
            total_activities: inner.global_activities.len(),
            connected_repos: inner.connected_repos.len(),
        }
    }

    /// Drop everything. Used by stop paths so restart cycles never leak.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.sessions.clear();
        inner.activities.clear();
        inner.global_activities.clear();
        inner.connected_repos.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_core::ActivityPayload;

    fn registry() -> SessionRegistry {
        SessionRegistry::new()
    }

    fn create(reg: &SessionRegistry, id: &str, path: &str) -> Option<AgentSession> {
        reg.get_or_create_session(
            id,
            AgentKind::ClaudeCode,
            SessionSource::External,
            path,
            "/tmp/file.jsonl",
            Some(Utc::now()),
        )
    }

    fn activity(session_id: &str, payload: ActivityPayload) -> AgentActivity {
        AgentActivity::new(session_id, AgentKind::ClaudeCode, Utc::now(), payload)
    }

    fn tool_use(session_id: &str) -> AgentActivity {
        activity(
            session_id,
            ActivityPayload::ToolUse {
                tool_name: "bash".into(),
                tool_input: serde_json::json!({}),
                summary: "Run: ls".into(),
            },
        )
    }

    #[test]
    fn create_emits_event_and_is_idempotent() {
        let reg = registry();
        let mut rx = reg.subscribe();

        let session = create(&reg, "s1", "/tmp/p").expect("created");
        assert_eq!(session.status, SessionStatus::Active);

        match rx.try_recv().expect("event") {
            RegistryEvent::SessionCreated(s) => assert_eq!(s.id, "s1"),
            other => panic!("unexpected event: {other:?}"),
        }

        // Same id again: no second creation event.
        create(&reg, "s1", "/tmp/p").expect("existing");
        assert!(rx.try_recv().is_err());
        assert_eq!(reg.sessions().len(), 1);
    }

    #[test]
    fn stale_first_activity_creates_ended_session_silently() {
        let reg = registry();
        let mut rx = reg.subscribe();

        let session = reg
            .get_or_create_session(
                "old",
                AgentKind::Codex,
                SessionSource::External,
                "/tmp/p",
                "/tmp/f.jsonl",
                Some(Utc::now() - ChronoDuration::hours(3)),
            )
            .expect("created");

        assert_eq!(session.status, SessionStatus::Ended);
        assert!(rx.try_recv().is_err(), "no event for historical sessions");
    }

    #[test]
    fn repo_scoping_filters_at_creation_only() {
        let reg = registry();
        reg.connect_repo(ConnectedRepo {
            path: "proj".into(),
            absolute_path: "/home/vm/proj".into(),
            space_id: "space-1".into(),
            monitoring_enabled: true,
        });

        assert!(create(&reg, "inside", "/home/vm/proj/sub").is_some());
        assert!(create(&reg, "outside", "/elsewhere").is_none());

        let inside = reg.session("inside").expect("session");
        assert_eq!(inside.space_id.as_deref(), Some("space-1"));

        // Disconnecting afterwards does not remove the session.
        reg.disconnect_repo("/home/vm/proj");
        assert!(reg.session("inside").is_some());
    }

    #[test]
    fn ended_is_terminal() {
        let reg = registry();
        create(&reg, "s1", "/tmp/p");
        reg.end_session("s1", "process_exit");
        assert_eq!(reg.session("s1").unwrap().status, SessionStatus::Ended);

        // Neither activity nor a second end moves it.
        reg.record_activity(tool_use("s1"));
        reg.end_session("s1", "again");
        let session = reg.session("s1").unwrap();
        assert_eq!(session.status, SessionStatus::Ended);
        assert_eq!(session.tool_use_count, 0);
        assert!(reg.activities("s1", 10).is_empty());
    }

    #[test]
    fn activity_updates_counts_and_revives_idle() {
        let reg = registry();
        create(&reg, "s1", "/tmp/p");

        reg.sweep_idle(std::time::Duration::from_secs(0));
        assert_eq!(reg.session("s1").unwrap().status, SessionStatus::Idle);

        reg.record_activity(activity(
            "s1",
            ActivityPayload::UserPrompt { content: "hi".into(), truncated: false },
        ));
        reg.record_activity(tool_use("s1"));

        let session = reg.session("s1").unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.message_count, 1);
        assert_eq!(session.tool_use_count, 1);
    }

    #[test]
    fn idle_sweep_only_touches_stale_active_sessions() {
        let reg = registry();
        create(&reg, "fresh", "/tmp/a");
        create(&reg, "stale", "/tmp/b");

        // Make one session look stale by recording nothing and sweeping with
        // a zero threshold; then refresh the other.
        reg.record_activity(activity(
            "fresh",
            ActivityPayload::UserPrompt { content: "now".into(), truncated: false },
        ));

        let transitioned = reg.sweep_idle(std::time::Duration::from_secs(3600));
        assert_eq!(transitioned, 0, "nothing older than an hour");

        let transitioned = reg.sweep_idle(std::time::Duration::from_secs(0));
        assert_eq!(transitioned, 2);
    }

    #[test]
    fn per_session_activity_cap_drops_oldest() {
        let reg = registry();
        create(&reg, "s1", "/tmp/p");

        for _ in 0..(MAX_ACTIVITIES_PER_SESSION + 25) {
            reg.record_activity(tool_use("s1"));
        }

        let activities = reg.activities("s1", usize::MAX);
        assert_eq!(activities.len(), MAX_ACTIVITIES_PER_SESSION);
    }

    #[test]
    fn global_ring_caps_across_sessions() {
        let reg = registry();
        create(&reg, "a", "/tmp/a");
        create(&reg, "b", "/tmp/b");

        for i in 0..(MAX_TOTAL_ACTIVITIES + 50) {
            let id = if i % 2 == 0 { "a" } else { "b" };
            reg.record_activity(tool_use(id));
        }

        assert_eq!(reg.recent_activities(usize::MAX).len(), MAX_TOTAL_ACTIVITIES);
        assert_eq!(reg.recent_activities(10).len(), 10);
    }

    #[test]
    fn prune_removes_only_long_ended_sessions() {
        let reg = registry();
        create(&reg, "live", "/tmp/a");
        create(&reg, "dead", "/tmp/b");
        reg.record_activity(tool_use("dead"));
        reg.end_session("dead", "test");

        // Ended but not old enough yet.
        assert_eq!(reg.prune_ended(std::time::Duration::from_secs(3600)), 0);

        // With a zero retention window the ended session goes, with its
        // activities; the live one stays.
        assert_eq!(reg.prune_ended(std::time::Duration::from_secs(0)), 1);
        assert!(reg.session("dead").is_none());
        assert!(reg.activities("dead", 10).is_empty());
        assert!(reg.session("live").is_some());
    }

    #[test]
    fn activities_for_unknown_session_are_dropped() {
        let reg = registry();
        reg.record_activity(tool_use("ghost"));
        assert!(reg.recent_activities(10).is_empty());
    }

    #[test]
    fn attach_process_sets_pid_once() {
        let reg = registry();
        create(&reg, "s1", "/tmp/p");
        reg.attach_process("s1", 42);
        reg.attach_process("s1", 99);
        assert_eq!(reg.session("s1").unwrap().process_id, Some(42));
    }

    #[test]
    fn stats_reflect_state() {
        let reg = registry();
        create(&reg, "a", "/tmp/a");
        create(&reg, "b", "/tmp/b");
        reg.record_activity(tool_use("a"));
        reg.end_session("b", "test");

        let stats = reg.stats();
        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.total_activities, 1);
        assert_eq!(stats.connected_repos, 0);
    }
}

//! Monitor service: owns the file watcher, the process scanner, and the
//! idle/prune timers, and feeds everything into the session registry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use maestro_core::parsers;
use maestro_core::{AgentKind, SessionSource};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::paths::{self, WatchConfig};
use crate::registry::{RegistryEvent, SessionRegistry};
use crate::scanner::{self, DetectedProcess};
use crate::watcher::{FileEvent, FileWatcher};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub watch_configs: Vec<WatchConfig>,
    pub rescan_interval: Duration,
    pub process_scan_interval: Duration,
    pub idle_threshold: Duration,
    pub idle_sweep_interval: Duration,
    pub prune_interval: Duration,
    pub session_retention: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            watch_configs: paths::default_configs(),
            rescan_interval: Duration::from_secs(5),
            process_scan_interval: Duration::from_secs(5),
            idle_threshold: Duration::from_secs(30),
            idle_sweep_interval: Duration::from_secs(10),
            prune_interval: Duration::from_secs(5 * 60),
            session_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Long-lived owner of the monitoring pipeline. Constructed once at process
/// start; stopping closes watchers, clears timers, and drops all in-memory
/// maps so start/stop cycles never leak.
pub struct AgentMonitor {
    registry: Arc<SessionRegistry>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl AgentMonitor {
    pub fn start(config: MonitorConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        Self::start_with_registry(config, registry)
    }

    pub fn start_with_registry(config: MonitorConfig, registry: Arc<SessionRegistry>) -> Self {
        info!("agent monitor starting");
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        // File watcher → ingest.
        let (file_tx, file_rx) = mpsc::channel::<FileEvent>(256);
        let watcher = FileWatcher::new(
            config.watch_configs.clone(),
            file_tx,
            config.rescan_interval,
            cancel.clone(),
        );
        tasks.push(tokio::spawn(watcher.run()));
        tasks.push(tokio::spawn(ingest_loop(
            file_rx,
            Arc::clone(&registry),
            cancel.clone(),
        )));

        // Process scanner → lifecycle bookkeeping.
        let (proc_tx, proc_rx) = mpsc::channel::<Vec<DetectedProcess>>(16);
        tasks.push(tokio::spawn(scanner::run_polling(
            config.process_scan_interval,
            proc_tx,
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(process_loop(
            proc_rx,
            Arc::clone(&registry),
            cancel.clone(),
        )));

        // Periodic sweeps. One timer each, not per-session timers.
        tasks.push(tokio::spawn(sweep_loop(
            Arc::clone(&registry),
            config.idle_sweep_interval,
            config.idle_threshold,
            config.prune_interval,
            config.session_retention,
            cancel.clone(),
        )));

        Self {
            registry,
            cancel,
            tasks,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.registry.subscribe()
    }

    /// Stop everything and wait for the tasks to drain.
    pub async fn stop(self) {
        info!("agent monitor stopping");
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        self.registry.clear();
        info!("agent monitor stopped");
    }
}

/// File events → parsed activities → registry.
async fn ingest_loop(
    mut rx: mpsc::Receiver<FileEvent>,
    registry: Arc<SessionRegistry>,
    cancel: CancellationToken,
) {
    // filePath → sessionId, resolved lazily once the identifying record
    // has been written.
    let mut file_sessions: HashMap<PathBuf, String> = HashMap::new();

    loop {
        let event = tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(event) => event,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        match event {
            FileEvent::Changed { agent, path, lines, .. } => {
                ingest_lines(&registry, &mut file_sessions, agent, &path, &lines);
            }
            FileEvent::Removed { path, .. } => {
                file_sessions.remove(&path);
            }
        }
    }
}

fn ingest_lines(
    registry: &SessionRegistry,
    file_sessions: &mut HashMap<PathBuf, String>,
    agent: AgentKind,
    path: &PathBuf,
    lines: &[String],
) {
    let file_path = path.to_string_lossy().to_string();

    let session_id = match file_sessions.get(path) {
        Some(id) => id.clone(),
        None => {
            let Some(meta) = parsers::extract_session_meta(agent, lines, &file_path) else {
                // Identifying record not written yet; try again on the
                // next batch.
                return;
            };
            let Some(session) = registry.get_or_create_session(
                &meta.session_id,
                agent,
                SessionSource::External,
                &meta.project_path,
                &file_path,
                meta.started_at,
            ) else {
                // Filtered by repo scoping.
                return;
            };
            file_sessions.insert(path.clone(), session.id.clone());
            session.id
        }
    };

    let activities = parsers::parse_lines(agent, lines, &session_id, &file_path);
    debug!(
        session = %session_id,
        count = activities.len(),
        "parsed activities from file change"
    );
    for activity in activities {
        registry.record_activity(activity);
    }
}

/// Process scans → pid attachment and exit-driven session end.
async fn process_loop(
    mut rx: mpsc::Receiver<Vec<DetectedProcess>>,
    registry: Arc<SessionRegistry>,
    cancel: CancellationToken,
) {
    let mut last: Vec<DetectedProcess> = Vec::new();
    let mut pid_sessions: HashMap<u32, String> = HashMap::new();

    loop {
        let processes = tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(processes) => processes,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        let current_pids: std::collections::HashSet<u32> =
            processes.iter().map(|p| p.pid).collect();
        let previous_pids: std::collections::HashSet<u32> = last.iter().map(|p| p.pid).collect();

        // Newly seen processes: bind to a session by agent + cwd.
        for process in &processes {
            if previous_pids.contains(&process.pid) {
                continue;
            }
            info!(pid = process.pid, agent = ?process.agent, "agent process detected");

            let Some(cwd) = &process.cwd else { continue };
            let candidate = registry.sessions().into_iter().find(|session| {
                session.agent == process.agent
                    && session.process_id.is_none()
                    && (session.project_path == *cwd
                        || session.project_path.starts_with(&format!("{cwd}/"))
                        || cwd.starts_with(&format!("{}/", session.project_path)))
            });
            if let Some(session) = candidate {
                registry.attach_process(&session.id, process.pid);
                pid_sessions.insert(process.pid, session.id);
            }
        }

        // Vanished processes: end the bound session.
        for process in &last {
            if current_pids.contains(&process.pid) {
                continue;
            }
            info!(pid = process.pid, agent = ?process.agent, "agent process exited");
            if let Some(session_id) = pid_sessions.remove(&process.pid) {
                registry.end_session(&session_id, "process_exit");
            }
        }

        last = processes;
    }
}

async fn sweep_loop(
    registry: Arc<SessionRegistry>,
    idle_sweep_interval: Duration,
    idle_threshold: Duration,
    prune_interval: Duration,
    session_retention: Duration,
    cancel: CancellationToken,
) {
    let mut idle_tick = tokio::time::interval(idle_sweep_interval);
    let mut prune_tick = tokio::time::interval(prune_interval);
    idle_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    prune_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = idle_tick.tick() => {
                registry.sweep_idle(idle_threshold);
            }
            _ = prune_tick.tick() => {
                registry.prune_ended(session_retention);
            }
            _ = cancel.cancelled() => break,
        }
    }
}

//! Incremental tailing of agent session files.
//!
//! Discovery is dual-path: a native recursive watch (notify) where the
//! platform supports it, plus a slow full-tree rescan as a correctness
//! backstop — recursive watch APIs are unreliable for deeply nested,
//! frequently rotated paths. Per file we keep a byte offset and the carried
//! trailing fragment, so every emitted batch contains only newly appended,
//! complete lines.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use maestro_core::AgentKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::paths::WatchConfig;

/// Fallback rescan cadence.
pub const DEFAULT_RESCAN_INTERVAL: Duration = Duration::from_secs(5);
/// Recursion cap for the fallback rescan.
const MAX_SCAN_DEPTH: usize = 10;
/// Files whose mtime is older than this at discovery are tailed from EOF
/// instead of replayed.
const STALE_FILE_AGE: Duration = Duration::from_secs(60 * 60);

/// Raw line batches surfaced to the ingest side.
#[derive(Debug, Clone, PartialEq)]
pub enum FileEvent {
    Changed {
        agent: AgentKind,
        path: PathBuf,
        lines: Vec<String>,
        /// First sight of this file — the whole content is in `lines` so the
        /// parser can extract session metadata.
        is_new: bool,
    },
    Removed {
        agent: AgentKind,
        path: PathBuf,
    },
}

/// Tail position for one known file.
#[derive(Debug, Default)]
struct TailState {
    offset: u64,
    /// Possibly-incomplete trailing line carried to the next read.
    fragment: Vec<u8>,
}

/// Read everything appended since `state.offset`, returning complete lines
/// and updating the tail state. A shrunken file (rewrite/truncation) resets
/// to the beginning — Gemini rewrites its checkpoints in place.
fn tail_file(path: &Path, state: &mut TailState) -> std::io::Result<Vec<String>> {
    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();

    if len < state.offset {
        state.offset = 0;
        state.fragment.clear();
    }

    if len == state.offset {
        return Ok(Vec::new());
    }

    file.seek(SeekFrom::Start(state.offset))?;
    let mut new_bytes = Vec::with_capacity((len - state.offset) as usize);
    file.read_to_end(&mut new_bytes)?;

    let mut buffer = std::mem::take(&mut state.fragment);
    buffer.extend_from_slice(&new_bytes);

    let mut lines = Vec::new();
    let mut rest = buffer.as_slice();
    while let Some(newline_at) = rest.iter().position(|b| *b == b'\n') {
        let (line, tail) = rest.split_at(newline_at);
        let line = String::from_utf8_lossy(line).trim_end_matches('\r').to_string();
        if !line.trim().is_empty() {
            lines.push(line);
        }
        rest = &tail[1..];
    }

    state.fragment = rest.to_vec();
    state.offset = len - state.fragment.len() as u64;

    Ok(lines)
}

/// Tails every file matching the configured agent patterns and emits
/// [`FileEvent`] batches until cancelled.
pub struct FileWatcher {
    configs: Vec<WatchConfig>,
    tx: mpsc::Sender<FileEvent>,
    rescan_interval: Duration,
    cancel: CancellationToken,
    tails: HashMap<PathBuf, (AgentKind, TailState)>,
}

impl FileWatcher {
    pub fn new(
        configs: Vec<WatchConfig>,
        tx: mpsc::Sender<FileEvent>,
        rescan_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            configs,
            tx,
            rescan_interval,
            cancel,
            tails: HashMap::new(),
        }
    }

    /// Run discovery and tailing until the cancellation token fires.
    /// A watch-setup failure for one agent's directory never aborts the
    /// others.
    pub async fn run(mut self) {
        let (notify_tx, mut notify_rx) = mpsc::channel::<notify::Result<Event>>(256);

        // Bridge synchronous notify callbacks into async land. The watcher
        // handle must stay alive for the duration of the loop.
        let _watcher: Option<RecommendedWatcher> = {
            let tx = notify_tx.clone();
            match notify::recommended_watcher(move |res| {
                let _ = tx.blocking_send(res);
            }) {
                Ok(mut watcher) => {
                    for config in &self.configs {
                        if !config.base_dir.exists() {
                            warn!(
                                path = %config.base_dir.display(),
                                agent = ?config.agent,
                                "watch directory does not exist, skipping"
                            );
                            continue;
                        }
                        if let Err(e) = watcher.watch(&config.base_dir, RecursiveMode::Recursive) {
                            warn!(
                                path = %config.base_dir.display(),
                                agent = ?config.agent,
                                "failed to watch directory: {e}"
                            );
                        } else {
                            tracing::info!(
                                path = %config.base_dir.display(),
                                agent = ?config.agent,
                                "watching agent directory"
                            );
                        }
                    }
                    Some(watcher)
                }
                Err(e) => {
                    warn!("could not create filesystem watcher, rescan only: {e}");
                    None
                }
            }
        };

        // Initial pass picks up files that already exist.
        self.rescan().await;

        let mut rescan_tick = tokio::time::interval(self.rescan_interval);
        rescan_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        rescan_tick.reset();

        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                maybe_event = notify_rx.recv() => {
                    match maybe_event {
                        Some(Ok(event)) => self.handle_notify_event(&event).await,
                        Some(Err(e)) => warn!("watcher error: {e}"),
                        None => break,
                    }
                }
                _ = rescan_tick.tick() => {
                    self.rescan().await;
                }
                _ = cancel.cancelled() => {
                    debug!("file watcher: cancellation requested");
                    break;
                }
            }
        }

        self.tails.clear();
    }

    fn config_for(&self, path: &Path) -> Option<&WatchConfig> {
        self.configs
            .iter()
            .find(|config| path.starts_with(&config.base_dir) && config.matches(path))
    }

    async fn handle_notify_event(&mut self, event: &Event) {
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {}
            _ => return,
        }

        let paths: Vec<PathBuf> = event.paths.clone();
        for path in paths {
            let Some(config) = self.config_for(&path) else {
                continue;
            };
            let agent = config.agent;
            self.process_path(agent, &path).await;
        }
    }

    /// Read (or discover) one file and emit whatever it yields. ENOENT turns
    /// into a `Removed` event for known files; everything else transient is
    /// logged and self-heals on the next poll.
    async fn process_path(&mut self, agent: AgentKind, path: &Path) {
        let known = self.tails.contains_key(path);

        if !known {
            let mut state = TailState::default();
            // Old transcripts are history, not live sessions: tail from EOF.
            if is_stale(path) {
                if let Ok(metadata) = std::fs::metadata(path) {
                    state.offset = metadata.len();
                    self.tails.insert(path.to_path_buf(), (agent, state));
                }
                return;
            }

            match tail_file(path, &mut state) {
                Ok(lines) => {
                    self.tails.insert(path.to_path_buf(), (agent, state));
                    debug!(path = %path.display(), "tracking new session file");
                    if !lines.is_empty() {
                        let _ = self
                            .tx
                            .send(FileEvent::Changed {
                                agent,
                                path: path.to_path_buf(),
                                lines,
                                is_new: true,
                            })
                            .await;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), "failed to read session file: {e}"),
            }
            return;
        }

        let Some((_, state)) = self.tails.get_mut(path) else {
            return;
        };
        match tail_file(path, state) {
            Ok(lines) => {
                if !lines.is_empty() {
                    let _ = self
                        .tx
                        .send(FileEvent::Changed {
                            agent,
                            path: path.to_path_buf(),
                            lines,
                            is_new: false,
                        })
                        .await;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.tails.remove(path);
                let _ = self
                    .tx
                    .send(FileEvent::Removed {
                        agent,
                        path: path.to_path_buf(),
                    })
                    .await;
            }
            Err(e) => warn!(path = %path.display(), "failed to read session file: {e}"),
        }
    }

    /// Fallback full-tree pass: discovers files the native watch missed and
    /// re-polls known files for appended content.
    async fn rescan(&mut self) {
        let configs = self.configs.clone();
        for config in &configs {
            let mut found = Vec::new();
            collect_matching_files(&config.base_dir, config, 0, &mut found);
            for path in found {
                self.process_path(config.agent, &path).await;
            }
        }

        // Catch deletions the native watch missed.
        let gone: Vec<(PathBuf, AgentKind)> = self
            .tails
            .iter()
            .filter(|(path, _)| !path.exists())
            .map(|(path, (agent, _))| (path.clone(), *agent))
            .collect();
        for (path, agent) in gone {
            self.tails.remove(&path);
            let _ = self.tx.send(FileEvent::Removed { agent, path }).await;
        }
    }
}

fn is_stale(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    let Ok(modified) = metadata.modified() else {
        return false;
    };
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age > STALE_FILE_AGE)
        .unwrap_or(false)
}

/// Depth-bounded recursive walk, skipping dotted directories and
/// `node_modules`.
fn collect_matching_files(
    dir: &Path,
    config: &WatchConfig,
    depth: usize,
    out: &mut Vec<PathBuf>,
) {
    if depth >= MAX_SCAN_DEPTH {
        warn!(path = %dir.display(), "max scan depth reached");
        return;
    }

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            warn!(path = %dir.display(), "failed to scan directory: {e}");
            return;
        }
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || name == "node_modules" {
            continue;
        }

        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            collect_matching_files(&path, config, depth + 1, out);
        } else if file_type.is_file() && config.matches(&path) {
            out.push(path);
        }
    }
}

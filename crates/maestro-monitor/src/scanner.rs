//! OS process-table scanning for running agent CLIs.
//!
//! The scan shells out to `ps` and resolves working directories with
//! platform-specific means, so it always runs as its own task off the
//! event path. Downstream consumers only hear about scans whose pid set
//! actually changed.

use std::collections::HashSet;
use std::time::Duration;

use maestro_core::AgentKind;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One classified agent process.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedProcess {
    pub pid: u32,
    pub name: String,
    pub cmd: String,
    /// Resolution can fail for already-exited or permission-restricted
    /// processes; missing data, not a crash.
    pub cwd: Option<String>,
    pub agent: AgentKind,
}

/// Classify a process by name/command-line heuristics. The JS-based agents
/// run under a generic interpreter, so the command line is what identifies
/// them; Codex ships a dedicated binary.
pub fn classify(name: &str, cmd: &str) -> Option<AgentKind> {
    let name = name.to_lowercase();
    let cmd = cmd.to_lowercase();

    if name == "node" || name == "node.exe" {
        if cmd.contains("claude-code") || cmd.contains("@anthropic-ai/claude-code") {
            return Some(AgentKind::ClaudeCode);
        }
        if cmd.contains("gemini-cli") || cmd.contains("@google/gemini") {
            return Some(AgentKind::Gemini);
        }
    }

    if name == "codex" || name == "codex.exe" {
        return Some(AgentKind::Codex);
    }

    None
}

/// Parse `ps -eo pid,comm,args` output into (pid, comm, args) rows.
pub fn parse_ps_output(stdout: &str) -> Vec<(u32, String, String)> {
    stdout
        .lines()
        .skip(1) // header
        .filter_map(|line| {
            let trimmed = line.trim();
            let mut parts = trimmed.splitn(3, char::is_whitespace);
            let pid = parts.next()?.parse::<u32>().ok()?;
            let name = parts.next()?.trim().to_string();
            let cmd = parts.next().unwrap_or("").trim().to_string();
            Some((pid, name, cmd))
        })
        .collect()
}

/// List and classify agent processes. Errors degrade to an empty scan.
pub async fn scan() -> Vec<DetectedProcess> {
    let output = match tokio::process::Command::new("ps")
        .args(["-eo", "pid,comm,args"])
        .output()
        .await
    {
        Ok(output) => output,
        Err(e) => {
            warn!("process scan failed: {e}");
            return Vec::new();
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut detected = Vec::new();

    for (pid, name, cmd) in parse_ps_output(&stdout) {
        if let Some(agent) = classify(&name, &cmd) {
            let cwd = process_cwd(pid).await;
            detected.push(DetectedProcess {
                pid,
                name,
                cmd,
                cwd,
                agent,
            });
        }
    }

    detected
}

/// Resolve a process's working directory.
#[cfg(target_os = "linux")]
async fn process_cwd(pid: u32) -> Option<String> {
    std::fs::read_link(format!("/proc/{pid}/cwd"))
        .ok()
        .map(|p| p.to_string_lossy().to_string())
}

// TODO: batch cwd resolution into a single `lsof -p pid1,pid2,...` call
// instead of one subprocess per agent pid.
#[cfg(target_os = "macos")]
async fn process_cwd(pid: u32) -> Option<String> {
    let output = tokio::process::Command::new("lsof")
        .args(["-a", "-d", "cwd", "-p", &pid.to_string(), "-Fn"])
        .output()
        .await
        .ok()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .find_map(|line| line.strip_prefix('n'))
        .map(|path| path.to_string())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
async fn process_cwd(_pid: u32) -> Option<String> {
    None
}

/// Poll the process table on a fixed interval, emitting the full current set
/// only when the pid set differs from the previous scan.
pub async fn run_polling(
    interval: Duration,
    tx: mpsc::Sender<Vec<DetectedProcess>>,
    cancel: CancellationToken,
) {
    let mut last_pids: Option<HashSet<u32>> = None;
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let processes = scan().await;
                let pids: HashSet<u32> = processes.iter().map(|p| p.pid).collect();

                if pid_set_changed(&last_pids, &pids) {
                    debug!(count = processes.len(), "agent process set changed");
                    last_pids = Some(pids);
                    if tx.send(processes).await.is_err() {
                        break;
                    }
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}

/// The first scan always reports; after that only a pid-set difference does.
fn pid_set_changed(previous: &Option<HashSet<u32>>, current: &HashSet<u32>) -> bool {
    match previous {
        Some(previous) => previous != current,
        None => true,
    }
}

//! Terminal bridge: couples a pseudo-terminal to zero or more WebSocket
//! viewers.
//!
//! Output is decoupled from network pace by a per-terminal coalescing
//! buffer (flushed at a size cap or a short delay, whichever first) and a
//! capped backlog that lets clients reconnect mid-session without losing
//! history. Input carries a monotonic sequence number so client-side
//! retries are applied at most once.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use maestro_core::protocol::{channel_key, ServerEvent, TerminalFrame};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::ws::WsManager;

/// Flush immediately once this many bytes are pending, and never emit a
/// larger frame.
pub const MAX_FRAME_BYTES: usize = 32 * 1024;
/// Flush this long after the first unflushed byte (~120Hz).
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(8);
/// Per-terminal backlog cap; oldest bytes are trimmed beyond it.
pub const MAX_BACKLOG_BYTES: usize = 1024 * 1024;

/// Events produced by the PTY process abstraction the launcher supplies.
#[derive(Debug, Clone, PartialEq)]
pub enum PtyEvent {
    Data(Vec<u8>),
    Exit(i32),
}

/// Live handle to a pseudo-terminal process. Supplied by the launcher
/// subsystem together with the matching [`PtyEvent`] stream.
pub trait PtyHandle: Send {
    fn write(&mut self, data: &[u8]);
    fn resize(&mut self, cols: u16, rows: u16);
    fn kill(&mut self);
}

struct Backlog {
    chunks: VecDeque<Vec<u8>>,
    total_bytes: usize,
    exited: Option<i32>,
}

impl Backlog {
    fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            total_bytes: 0,
            exited: None,
        }
    }

    fn append(&mut self, data: &[u8]) {
        self.chunks.push_back(data.to_vec());
        self.total_bytes += data.len();
        while self.total_bytes > MAX_BACKLOG_BYTES {
            match self.chunks.pop_front() {
                Some(removed) => self.total_bytes -= removed.len(),
                None => break,
            }
        }
    }

    fn concat(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_bytes);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }
}

struct TermState {
    handle: Option<Box<dyn PtyHandle>>,
    backlog: Backlog,
    buffer: Vec<u8>,
    frame_seq: u64,
    last_input_seq: Option<u64>,
}

/// Owns every terminal's backlog and coalescing buffer. WebSocket clients
/// only ever read broadcasts; all mutation happens here. Cheap to clone;
/// clones share the same state.
#[derive(Clone)]
pub struct TerminalBridge {
    ws: Arc<WsManager>,
    terminals: Arc<Mutex<HashMap<String, TermState>>>,
}

impl TerminalBridge {
    pub fn new(ws: Arc<WsManager>) -> Self {
        Self {
            ws,
            terminals: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TermState>> {
        self.terminals.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Attach a PTY and start pumping its output. The bridge owns the
    /// handle from here; the backlog outlives the process until `remove`.
    pub fn register(
        &self,
        terminal_id: &str,
        handle: Box<dyn PtyHandle>,
        mut events: mpsc::Receiver<PtyEvent>,
    ) {
        info!(terminal = %terminal_id, "terminal registered");
        self.lock().insert(
            terminal_id.to_string(),
            TermState {
                handle: Some(handle),
                backlog: Backlog::new(),
                buffer: Vec::new(),
                frame_seq: 0,
                last_input_seq: None,
            },
        );

        let bridge = self.clone();
        let id = terminal_id.to_string();
        tokio::spawn(async move {
            // One coalescing deadline at a time, armed by the first
            // unflushed byte.
            let mut deadline: Option<Instant> = None;
            let far_future = || Instant::now() + Duration::from_secs(3600);

            loop {
                tokio::select! {
                    maybe = events.recv() => match maybe {
                        Some(PtyEvent::Data(bytes)) => {
                            let over_cap = bridge.append_output(&id, &bytes);
                            if over_cap {
                                bridge.flush(&id);
                                deadline = None;
                            } else if deadline.is_none() {
                                deadline = Some(Instant::now() + FLUSH_INTERVAL);
                            }
                        }
                        Some(PtyEvent::Exit(code)) => {
                            bridge.handle_exit(&id, code);
                            return;
                        }
                        None => {
                            // Event stream dropped without an exit; flush
                            // what we have and stop pumping.
                            bridge.flush(&id);
                            return;
                        }
                    },
                    _ = tokio::time::sleep_until(deadline.unwrap_or_else(far_future)),
                        if deadline.is_some() =>
                    {
                        bridge.flush(&id);
                        deadline = None;
                    }
                }
            }
        });
    }

    /// Returns true once the pending buffer crossed the frame cap.
    fn append_output(&self, terminal_id: &str, data: &[u8]) -> bool {
        let mut terminals = self.lock();
        let Some(state) = terminals.get_mut(terminal_id) else {
            return false;
        };
        state.backlog.append(data);
        state.buffer.extend_from_slice(data);
        state.buffer.len() >= MAX_FRAME_BYTES
    }

    /// Drain the pending buffer as one or more ≤32KB frames, broadcast in
    /// order to the terminal's channel.
    fn flush(&self, terminal_id: &str) {
        let mut terminals = self.lock();
        let Some(state) = terminals.get_mut(terminal_id) else {
            return;
        };
        Self::flush_state(&self.ws, terminal_id, state);
    }

    fn flush_state(ws: &WsManager, terminal_id: &str, state: &mut TermState) {
        if state.buffer.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut state.buffer);
        let key = channel_key("terminal", Some(terminal_id));

        for chunk in pending.chunks(MAX_FRAME_BYTES) {
            state.frame_seq += 1;
            let frame = TerminalFrame {
                id: terminal_id.to_string(),
                seq: state.frame_seq,
                ts: chrono::Utc::now().timestamp_millis(),
                data: base64::engine::general_purpose::STANDARD.encode(chunk),
            };
            ws.broadcast(&key, ServerEvent::TermFrame(frame));
        }
    }

    fn handle_exit(&self, terminal_id: &str, code: i32) {
        info!(terminal = %terminal_id, code, "terminal exited");
        let mut terminals = self.lock();
        let Some(state) = terminals.get_mut(terminal_id) else {
            return;
        };
        Self::flush_state(&self.ws, terminal_id, state);
        state.backlog.exited = Some(code);
        state.handle = None;
        self.ws.broadcast(
            &channel_key("terminal", Some(terminal_id)),
            ServerEvent::TermExit { id: terminal_id.to_string(), code },
        );
    }

    /// Subscribe a client to a terminal channel with backlog replay.
    ///
    /// Runs entirely under the bridge lock: pending output is flushed to
    /// current subscribers first, then the backlog is replayed to this
    /// client, then the subscription key is added — so the client observes
    /// backlog-then-live with no gap and no duplication.
    pub fn subscribe_with_replay(&self, client_id: Uuid, terminal_id: &str) {
        let key = channel_key("terminal", Some(terminal_id));
        let mut terminals = self.lock();

        let Some(state) = terminals.get_mut(terminal_id) else {
            // Nothing registered under this id yet; a plain subscription
            // still receives whatever starts later.
            self.ws.subscribe(client_id, &key);
            return;
        };

        Self::flush_state(&self.ws, terminal_id, state);

        let backlog = state.backlog.concat();
        let mut replay_seq = 0u64;
        for chunk in backlog.chunks(MAX_FRAME_BYTES) {
            self.ws.send_to(
                client_id,
                ServerEvent::TermFrame(TerminalFrame {
                    id: terminal_id.to_string(),
                    seq: replay_seq,
                    ts: chrono::Utc::now().timestamp_millis(),
                    data: base64::engine::general_purpose::STANDARD.encode(chunk),
                }),
            );
            replay_seq += 1;
        }

        // Late joiners still observe the exit.
        if let Some(code) = state.backlog.exited {
            self.ws.send_to(
                client_id,
                ServerEvent::TermExit { id: terminal_id.to_string(), code },
            );
        }

        self.ws.subscribe(client_id, &key);
    }

    /// Apply client input. Inputs at or below the last applied sequence are
    /// discarded; an applied write forces an immediate flush so local echo
    /// feels instantaneous.
    pub fn write(&self, terminal_id: &str, data: &[u8], seq: Option<u64>) -> bool {
        let mut terminals = self.lock();
        let Some(state) = terminals.get_mut(terminal_id) else {
            return false;
        };

        if let Some(seq) = seq {
            if state.last_input_seq.is_some_and(|last| seq <= last) {
                debug!(terminal = %terminal_id, seq, "duplicate input discarded");
                return false;
            }
            state.last_input_seq = Some(seq);
        }

        let Some(handle) = state.handle.as_mut() else {
            return false;
        };
        handle.write(data);
        Self::flush_state(&self.ws, terminal_id, state);
        true
    }

    pub fn resize(&self, terminal_id: &str, cols: u16, rows: u16) {
        let mut terminals = self.lock();
        if let Some(handle) = terminals
            .get_mut(terminal_id)
            .and_then(|s| s.handle.as_mut())
        {
            handle.resize(cols, rows);
        }
    }

    /// Tear one terminal down completely, backlog included. Called by the
    /// owning launcher when the terminal's tab goes away.
    pub fn remove(&self, terminal_id: &str) {
        let mut terminals = self.lock();
        if let Some(mut state) = terminals.remove(terminal_id) {
            if let Some(handle) = state.handle.as_mut() {
                handle.kill();
            }
        }
    }

    pub fn terminal_ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn has_live_terminal(&self, terminal_id: &str) -> bool {
        self.lock()
            .get(terminal_id)
            .map(|s| s.handle.is_some())
            .unwrap_or(false)
    }

    /// Kill every owned PTY and drop all state.
    pub fn shutdown(&self) {
        let mut terminals = self.lock();
        for (id, state) in terminals.iter_mut() {
            if let Some(handle) = state.handle.as_mut() {
                debug!(terminal = %id, "killing terminal on shutdown");
                handle.kill();
            }
        }
        terminals.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakePty {
        written: Arc<Mutex<Vec<u8>>>,
        killed: Arc<AtomicBool>,
        resized: Arc<Mutex<Option<(u16, u16)>>>,
    }

    fn fake_pty() -> (
        Box<dyn PtyHandle>,
        Arc<Mutex<Vec<u8>>>,
        Arc<AtomicBool>,
        Arc<Mutex<Option<(u16, u16)>>>,
    ) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let killed = Arc::new(AtomicBool::new(false));
        let resized = Arc::new(Mutex::new(None));
        let pty = FakePty {
            written: Arc::clone(&written),
            killed: Arc::clone(&killed),
            resized: Arc::clone(&resized),
        };
        (Box::new(pty), written, killed, resized)
    }

    impl PtyHandle for FakePty {
        fn write(&mut self, data: &[u8]) {
            self.written.lock().unwrap().extend_from_slice(data);
        }
        fn resize(&mut self, cols: u16, rows: u16) {
            *self.resized.lock().unwrap() = Some((cols, rows));
        }
        fn kill(&mut self) {
            self.killed.store(true, Ordering::SeqCst);
        }
    }

    fn setup() -> (Arc<WsManager>, Arc<TerminalBridge>) {
        let ws = Arc::new(WsManager::new());
        let bridge = Arc::new(TerminalBridge::new(Arc::clone(&ws)));
        (ws, bridge)
    }

    fn decode_frame(text: &str) -> Option<(u64, Vec<u8>)> {
        let envelope: maestro_core::protocol::Envelope = serde_json::from_str(text).ok()?;
        if envelope.kind != "term:frame" {
            return None;
        }
        let frame: TerminalFrame = serde_json::from_value(envelope.payload).ok()?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(frame.data)
            .ok()?;
        Some((frame.seq, bytes))
    }

    async fn drain_frames(
        rx: &mut mpsc::UnboundedReceiver<String>,
        expect_bytes: usize,
    ) -> Vec<(u64, Vec<u8>)> {
        let mut frames = Vec::new();
        let mut total = 0;
        while total < expect_bytes {
            let text = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timeout")
                .expect("stream open");
            if let Some((seq, bytes)) = decode_frame(&text) {
                total += bytes.len();
                frames.push((seq, bytes));
            }
        }
        frames
    }

    #[tokio::test]
    async fn burst_is_split_into_capped_frames_for_all_subscribers() {
        let (ws, bridge) = setup();
        let (a, mut rx_a) = ws.register("dev-a");
        let (b, mut rx_b) = ws.register("dev-b");
        ws.subscribe(a, "terminal:t1");
        ws.subscribe(b, "terminal:t1");

        let (pty, _, _, _) = fake_pty();
        let (tx, rx) = mpsc::channel(16);
        bridge.register("t1", pty, rx);

        // 40KB in a single burst: exactly two frames, 32KB then 8KB.
        let burst = vec![b'x'; 40 * 1024];
        tx.send(PtyEvent::Data(burst.clone())).await.unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            let frames = drain_frames(rx, 40 * 1024).await;
            assert_eq!(frames.len(), 2);
            assert_eq!(frames[0].1.len(), 32 * 1024);
            assert_eq!(frames[1].1.len(), 8 * 1024);
            assert!(frames[0].0 < frames[1].0, "frames arrive in flush order");

            let rebuilt: Vec<u8> = frames.iter().flat_map(|(_, b)| b.clone()).collect();
            assert_eq!(rebuilt, burst);
        }
    }

    #[tokio::test]
    async fn small_chunks_coalesce_into_one_frame() {
        let (ws, bridge) = setup();
        let (a, mut rx_a) = ws.register("dev");
        ws.subscribe(a, "terminal:t1");

        let (pty, _, _, _) = fake_pty();
        let (tx, rx) = mpsc::channel(16);
        bridge.register("t1", pty, rx);

        tx.send(PtyEvent::Data(b"hel".to_vec())).await.unwrap();
        tx.send(PtyEvent::Data(b"lo".to_vec())).await.unwrap();

        let frames = drain_frames(&mut rx_a, 5).await;
        assert_eq!(frames.len(), 1, "both chunks coalesce within the flush window");
        assert_eq!(frames[0].1, b"hello");
    }

    #[tokio::test]
    async fn replay_then_live_is_byte_exact() {
        let (ws, bridge) = setup();

        let (pty, _, _, _) = fake_pty();
        let (tx, rx) = mpsc::channel(16);
        bridge.register("t1", pty, rx);

        tx.send(PtyEvent::Data(b"before-subscribe ".to_vec()))
            .await
            .unwrap();
        // Let the flush timer fire so the bytes land in the backlog.
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Late joiner subscribes mid-stream.
        let (late, mut rx_late) = ws.register("late");
        bridge.subscribe_with_replay(late, "t1");

        tx.send(PtyEvent::Data(b"after-subscribe".to_vec()))
            .await
            .unwrap();

        let total = b"before-subscribe after-subscribe".len();
        let frames = drain_frames(&mut rx_late, total).await;
        let rebuilt: Vec<u8> = frames.into_iter().flat_map(|(_, b)| b).collect();
        assert_eq!(rebuilt, b"before-subscribe after-subscribe".to_vec());
    }

    #[tokio::test]
    async fn replay_includes_unflushed_pending_bytes_exactly_once() {
        let (ws, bridge) = setup();

        let (pty, _, _, _) = fake_pty();
        let (tx, rx) = mpsc::channel(16);
        bridge.register("t1", pty, rx);

        // Data sits in the coalescing buffer; subscribe before the timer
        // fires. The subscribe path flushes first, so the late client gets
        // these bytes exactly once, via replay.
        tx.send(PtyEvent::Data(b"pending".to_vec())).await.unwrap();
        tokio::task::yield_now().await;

        let (late, mut rx_late) = ws.register("late");
        bridge.subscribe_with_replay(late, "t1");

        let frames = drain_frames(&mut rx_late, b"pending".len()).await;
        let rebuilt: Vec<u8> = frames.into_iter().flat_map(|(_, b)| b).collect();
        assert_eq!(rebuilt, b"pending".to_vec());

        // Nothing further arrives for this client.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx_late.try_recv().is_err());
    }

    #[tokio::test]
    async fn input_sequence_numbers_are_idempotent() {
        let (_ws, bridge) = setup();

        let (pty, written, _, _) = fake_pty();
        let (_tx, rx) = mpsc::channel(16);
        bridge.register("t1", pty, rx);

        assert!(bridge.write("t1", b"ls\n", Some(1)));
        assert!(!bridge.write("t1", b"ls\n", Some(1)), "same seq applies at most once");
        assert!(!bridge.write("t1", b"old\n", Some(0)), "stale seq discarded");
        assert!(bridge.write("t1", b"pwd\n", Some(2)));
        // Unsequenced input always applies.
        assert!(bridge.write("t1", b"echo\n", None));

        assert_eq!(written.lock().unwrap().as_slice(), b"ls\npwd\necho\n");
    }

    #[tokio::test]
    async fn input_forces_immediate_flush_of_pending_output() {
        let (ws, bridge) = setup();
        let (a, mut rx_a) = ws.register("dev");
        ws.subscribe(a, "terminal:t1");

        let (pty, _, _, _) = fake_pty();
        let (tx, rx) = mpsc::channel(16);
        bridge.register("t1", pty, rx);

        tx.send(PtyEvent::Data(b"echo-pending".to_vec())).await.unwrap();
        // Let the pump buffer the chunk without waiting out the timer.
        tokio::task::yield_now().await;

        // The write triggers the flush; no need to wait for the 8ms timer.
        bridge.write("t1", b"\r", Some(1));

        let frames = drain_frames(&mut rx_a, b"echo-pending".len()).await;
        let rebuilt: Vec<u8> = frames.into_iter().flat_map(|(_, b)| b).collect();
        assert_eq!(rebuilt, b"echo-pending");
    }

    #[tokio::test]
    async fn exit_flushes_broadcasts_and_keeps_backlog() {
        let (ws, bridge) = setup();
        let (a, mut rx_a) = ws.register("dev");
        ws.subscribe(a, "terminal:t1");

        let (pty, _, _, _) = fake_pty();
        let (tx, rx) = mpsc::channel(16);
        bridge.register("t1", pty, rx);

        tx.send(PtyEvent::Data(b"bye".to_vec())).await.unwrap();
        tx.send(PtyEvent::Exit(0)).await.unwrap();

        // Frame first, then exit.
        let frames = drain_frames(&mut rx_a, 3).await;
        assert_eq!(frames[0].1, b"bye");
        let exit_text = tokio::time::timeout(Duration::from_secs(5), rx_a.recv())
            .await
            .unwrap()
            .unwrap();
        let envelope: maestro_core::protocol::Envelope =
            serde_json::from_str(&exit_text).unwrap();
        assert_eq!(envelope.kind, "term:exit");
        assert_eq!(envelope.payload["code"], 0);

        assert!(!bridge.has_live_terminal("t1"));

        // A reconnecting client still gets the full history plus the exit.
        let (late, mut rx_late) = ws.register("late");
        bridge.subscribe_with_replay(late, "t1");
        let frames = drain_frames(&mut rx_late, 3).await;
        assert_eq!(frames[0].1, b"bye");
        let replay_exit = rx_late.try_recv().expect("exit replayed");
        assert!(replay_exit.contains("term:exit"));

        // Writes to a dead terminal are refused.
        assert!(!bridge.write("t1", b"x", Some(9)));
    }

    #[tokio::test]
    async fn backlog_trims_oldest_bytes_at_cap() {
        let (ws, bridge) = setup();

        let (pty, _, _, _) = fake_pty();
        let (tx, rx) = mpsc::channel(64);
        bridge.register("t1", pty, rx);

        // Push well past the backlog cap in distinct chunks.
        let chunk = vec![b'a'; 128 * 1024];
        for _ in 0..10 {
            tx.send(PtyEvent::Data(chunk.clone())).await.unwrap();
        }
        let marker = b"END-MARKER".to_vec();
        tx.send(PtyEvent::Data(marker.clone())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (late, mut rx_late) = ws.register("late");
        bridge.subscribe_with_replay(late, "t1");

        let mut replayed = Vec::new();
        while let Ok(text) = rx_late.try_recv() {
            if let Some((_, bytes)) = decode_frame(&text) {
                replayed.extend(bytes);
            }
        }

        assert!(replayed.len() <= MAX_BACKLOG_BYTES);
        assert!(replayed.ends_with(&marker), "newest bytes survive trimming");
    }

    #[tokio::test]
    async fn resize_and_shutdown_reach_the_handle() {
        let (_ws, bridge) = setup();

        let (pty, _, killed, resized) = fake_pty();
        let (_tx, rx) = mpsc::channel(16);
        bridge.register("t1", pty, rx);

        bridge.resize("t1", 120, 40);
        assert_eq!(*resized.lock().unwrap(), Some((120, 40)));

        bridge.shutdown();
        assert!(killed.load(Ordering::SeqCst));
        assert!(bridge.terminal_ids().is_empty());
    }
}

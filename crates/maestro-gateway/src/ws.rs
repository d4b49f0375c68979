//! WebSocket client registry and channel broadcast primitives.
//!
//! Each connected client owns a set of exact-match channel keys. Broadcasts
//! serialize the envelope once and fan it out to every subscriber of that
//! key only — no wildcard matching. A keepalive sweep evicts clients that
//! stopped pinging so half-dead sockets never accumulate.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use maestro_core::protocol::ServerEvent;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Close a client that has not pinged for this long.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);
/// Keepalive sweep cadence.
pub const PING_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

struct ClientEntry {
    device_id: String,
    /// Outbound frames; the connection's writer task drains this. Dropping
    /// the sender is how a client gets force-closed.
    tx: mpsc::UnboundedSender<String>,
    subscriptions: HashSet<String>,
    last_ping: Instant,
}

#[derive(Default)]
pub struct WsManager {
    clients: Mutex<HashMap<Uuid, ClientEntry>>,
}

impl WsManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, ClientEntry>> {
        self.clients.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Admit an authenticated connection. Returns the client id and the
    /// outbound frame stream for the connection's writer task.
    pub fn register(&self, device_id: &str) -> (Uuid, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client_id = Uuid::new_v4();
        self.lock().insert(
            client_id,
            ClientEntry {
                device_id: device_id.to_string(),
                tx,
                subscriptions: HashSet::new(),
                last_ping: Instant::now(),
            },
        );
        debug!(client = %client_id, device = %device_id, "ws client registered");
        (client_id, rx)
    }

    pub fn unregister(&self, client_id: Uuid) {
        self.lock().remove(&client_id);
        debug!(client = %client_id, "ws client unregistered");
    }

    pub fn touch_ping(&self, client_id: Uuid) {
        if let Some(entry) = self.lock().get_mut(&client_id) {
            entry.last_ping = Instant::now();
        }
    }

    pub fn subscribe(&self, client_id: Uuid, key: &str) {
        if let Some(entry) = self.lock().get_mut(&client_id) {
            entry.subscriptions.insert(key.to_string());
        }
    }

    pub fn unsubscribe(&self, client_id: Uuid, key: &str) {
        if let Some(entry) = self.lock().get_mut(&client_id) {
            entry.subscriptions.remove(key);
        }
    }

    pub fn device_of(&self, client_id: Uuid) -> Option<String> {
        self.lock().get(&client_id).map(|e| e.device_id.clone())
    }

    pub fn send_to(&self, client_id: Uuid, event: ServerEvent) -> bool {
        match self.lock().get(&client_id) {
            Some(entry) => entry.tx.send(event.to_json()).is_ok(),
            None => false,
        }
    }

    /// Fan one event out to every client subscribed to `key`.
    pub fn broadcast(&self, key: &str, event: ServerEvent) {
        let text = event.to_json();
        let clients = self.lock();
        for (client_id, entry) in clients.iter() {
            if entry.subscriptions.contains(key) && entry.tx.send(text.clone()).is_err() {
                debug!(client = %client_id, "dropping frame for closed client");
            }
        }
    }

    /// Evict clients whose last ping is older than `max_idle`. Dropping the
    /// outbound sender makes the writer task close the socket.
    pub fn sweep_stale(&self, max_idle: Duration) -> usize {
        let mut clients = self.lock();
        let before = clients.len();
        clients.retain(|client_id, entry| {
            let alive = entry.last_ping.elapsed() <= max_idle;
            if !alive {
                warn!(client = %client_id, "closing client after ping timeout");
            }
            alive
        });
        before - clients.len()
    }

    pub fn client_count(&self) -> usize {
        self.lock().len()
    }

    /// Drop every client. Writer tasks observe their channel closing and
    /// send an explicit close frame before exiting.
    pub fn shutdown(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_core::protocol::Envelope;

    #[test]
    fn broadcast_reaches_only_exact_subscribers() {
        let ws = WsManager::new();
        let (a, mut rx_a) = ws.register("dev-a");
        let (b, mut rx_b) = ws.register("dev-b");
        let (c, mut rx_c) = ws.register("dev-c");

        ws.subscribe(a, "terminal:t1");
        ws.subscribe(b, "terminal:t1");
        // c subscribes to the bare channel name, which must NOT match.
        ws.subscribe(c, "terminal");

        ws.broadcast(
            "terminal:t1",
            ServerEvent::TermExit { id: "t1".into(), code: 0 },
        );

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let ws = WsManager::new();
        let (a, mut rx) = ws.register("dev");
        ws.subscribe(a, "agents");
        ws.unsubscribe(a, "agents");

        ws.broadcast("agents", ServerEvent::Pong);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_to_unknown_client_returns_false() {
        let ws = WsManager::new();
        assert!(!ws.send_to(Uuid::new_v4(), ServerEvent::Pong));
    }

    #[test]
    fn sweep_closes_only_stale_clients() {
        let ws = WsManager::new();
        let (stale, mut stale_rx) = ws.register("old");
        let (fresh, _fresh_rx) = ws.register("new");

        // Backdate the stale client's ping.
        {
            let mut clients = ws.lock();
            clients.get_mut(&stale).unwrap().last_ping =
                Instant::now() - Duration::from_secs(120);
        }

        assert_eq!(ws.sweep_stale(CLIENT_TIMEOUT), 1);
        assert_eq!(ws.client_count(), 1);
        assert!(ws.device_of(fresh).is_some());

        // The evicted client's stream has ended.
        assert!(matches!(
            stale_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn touch_ping_keeps_client_alive() {
        let ws = WsManager::new();
        let (id, _rx) = ws.register("dev");
        ws.touch_ping(id);
        assert_eq!(ws.sweep_stale(CLIENT_TIMEOUT), 0);
    }

    #[test]
    fn broadcast_payload_is_a_protocol_envelope() {
        let ws = WsManager::new();
        let (a, mut rx) = ws.register("dev");
        ws.subscribe(a, "agents");

        ws.broadcast(
            "agents",
            ServerEvent::Error { code: "x".into(), message: "y".into() },
        );

        let text = rx.try_recv().unwrap();
        let envelope: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(envelope.kind, "error");
        assert_eq!(envelope.v, 1);
    }
}

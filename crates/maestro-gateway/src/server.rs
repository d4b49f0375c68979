//! Gateway composition: binds the listener, wires auth/ws/bridge/spaces
//! into the router, and runs the periodic keepalive sweep plus the
//! registry-event fan-out.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use maestro_core::protocol::ServerEvent;
use maestro_monitor::{RegistryEvent, SessionRegistry};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::AuthService;
use crate::routes::{self, AppState, Launcher};
use crate::spaces::{SpaceCache, SpaceCommand};
use crate::terminal::TerminalBridge;
use crate::ws::{WsManager, CLIENT_TIMEOUT, PING_SWEEP_INTERVAL};

pub const DEFAULT_PORT: u16 = 7777;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind: SocketAddr,
    pub data_dir: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("failed to open auth storage in {dir}: {source}")]
    AuthStorage {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Fatal: the gateway must not silently fail to start.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

pub struct Gateway {
    state: AppState,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Gateway {
    /// Bind and start serving. Returns the running gateway plus the space
    /// command stream the host UI consumes.
    pub async fn start(
        config: GatewayConfig,
        registry: Arc<SessionRegistry>,
        launcher: Arc<dyn Launcher>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SpaceCommand>), GatewayError> {
        let auth = Arc::new(AuthService::open(&config.data_dir).map_err(|source| {
            GatewayError::AuthStorage {
                dir: config.data_dir.clone(),
                source,
            }
        })?);

        let ws = Arc::new(WsManager::new());
        let bridge = Arc::new(TerminalBridge::new(Arc::clone(&ws)));
        let (spaces, space_commands) = SpaceCache::new();

        let state = AppState {
            auth,
            registry: Arc::clone(&registry),
            ws: Arc::clone(&ws),
            bridge,
            spaces,
            launcher,
            started_at: Instant::now(),
        };

        let listener = tokio::net::TcpListener::bind(config.bind)
            .await
            .map_err(|source| GatewayError::Bind {
                addr: config.bind,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| GatewayError::Bind {
            addr: config.bind,
            source,
        })?;
        info!(addr = %local_addr, "gateway listening");

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        // HTTP + WebSocket server.
        let router = routes::router(state.clone());
        let serve_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            let shutdown = async move { serve_cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!("gateway server error: {e}");
            }
        }));

        // Keepalive sweep.
        tasks.push(tokio::spawn(keepalive_loop(
            Arc::clone(&ws),
            cancel.clone(),
        )));

        // Registry events → `agents` channel subscribers.
        tasks.push(tokio::spawn(registry_pump(
            registry.subscribe(),
            Arc::clone(&ws),
            cancel.clone(),
        )));

        Ok((
            Self {
                state,
                local_addr,
                cancel,
                tasks,
            },
            space_commands,
        ))
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Close every live socket, kill every owned PTY, and stop serving.
    pub async fn shutdown(self) {
        info!("gateway shutting down");
        self.cancel.cancel();
        self.state.ws.shutdown();
        self.state.bridge.shutdown();
        for task in self.tasks {
            let _ = task.await;
        }
        info!("gateway stopped");
    }
}

async fn keepalive_loop(ws: Arc<WsManager>, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(PING_SWEEP_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let evicted = ws.sweep_stale(CLIENT_TIMEOUT);
                if evicted > 0 {
                    warn!(evicted, "evicted unresponsive ws clients");
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}

/// Mirror session/activity events from the monitor to `agents` subscribers,
/// in registry emission order.
async fn registry_pump(
    mut events: broadcast::Receiver<RegistryEvent>,
    ws: Arc<WsManager>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            result = events.recv() => match result {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "registry event stream lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = cancel.cancelled() => break,
        };

        let outbound = match event {
            RegistryEvent::SessionCreated(session) => ServerEvent::AgentCreated(session),
            RegistryEvent::SessionUpdated(session) => ServerEvent::AgentUpdated(session),
            RegistryEvent::SessionEnded(session) => ServerEvent::AgentEnded(session),
            RegistryEvent::ActivityAdded(activity) => ServerEvent::AgentActivity(activity),
        };
        ws.broadcast("agents", outbound);
    }
}

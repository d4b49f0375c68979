//! Remote access gateway: device pairing and token auth, the HTTP/WebSocket
//! surface, channel-based fan-out to remote clients, and the terminal
//! streaming bridge.

pub mod auth;
pub mod routes;
pub mod server;
pub mod spaces;
pub mod terminal;
pub mod ws;

pub use routes::{AppState, LaunchMode, LaunchedAgent, Launcher, NoopLauncher};
pub use server::{Gateway, GatewayConfig, GatewayError, DEFAULT_PORT};
pub use spaces::{SpaceCache, SpaceCommand, SpaceSnapshot, TabSnapshot};
pub use terminal::{PtyEvent, PtyHandle, TerminalBridge};
pub use ws::WsManager;

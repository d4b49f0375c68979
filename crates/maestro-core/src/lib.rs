//! Shared data model, agent log-format parsers, and WebSocket wire protocol
//! for the Maestro remote daemon.
//!
//! This crate is pure: no tokio, no filesystem access. The monitor and
//! gateway crates drive it with raw text and fan the results out.

pub mod model;
pub mod parsers;
pub mod protocol;

pub use model::{
    ActivityPayload, AgentActivity, AgentKind, AgentSession, ConnectedRepo, SessionSource,
    SessionStatus,
};

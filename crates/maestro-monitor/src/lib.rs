//! Agent monitoring engine: discovers running agent CLIs, tails their
//! session logs, and tracks session lifecycle in an in-memory registry.
//!
//! Producers ([`watcher::FileWatcher`], [`scanner`]) feed the
//! [`registry::SessionRegistry`]; [`service::AgentMonitor`] wires them
//! together and owns the idle-sweep and prune timers.

pub mod paths;
pub mod registry;
pub mod scanner;
pub mod service;
pub mod watcher;

pub use registry::{RegistryEvent, RegistryStats, SessionRegistry};
pub use service::{AgentMonitor, MonitorConfig};

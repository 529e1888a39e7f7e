#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::new_without_default)]

//! dockd library — the building blocks of the node agent.
//!
//! - `tunnel` — outbound supervisor, inbound acceptor, framed sessions
//! - `dispatch` — controller command vocabulary mapped to service scripts
//! - `script` — local script executor (spawn, first JSON value, one outcome)
//! - `relay` — streaming artifact relay to the controller
//! - `routes` — control listener (identification, health, tunnel upgrade)
//! - `config` — TOML + env configuration

pub mod config;
pub mod dispatch;
pub mod relay;
pub mod routes;
pub mod script;
pub mod state;
pub mod tunnel;

// Re-export key types at crate root for convenience.
pub use config::{Config, ConfigError, RemoteEndpoint};
pub use dispatch::{Command, CommandError, Dispatcher};
pub use relay::ArtifactRelay;
pub use script::{Executor, ScriptExecutor};
pub use state::AgentState;
pub use tunnel::supervisor::Supervisor;

//! Control tunnel between this agent and the controller.
//!
//! - **Supervisor** ([`supervisor`]): dials `CONNECT /dock` on the controller,
//!   sends the handshake, serves commands, and reconnects forever.
//! - **Acceptor** ([`acceptor`]): accepts `CONNECT /dock` from a peer on the
//!   control listener and serves commands once the peer has identified itself.
//! - **Session** ([`session`]): one upgraded connection carrying JSON frames,
//!   one per line.
//!
//! ```text
//! {"type":"tunnel.handshake","payload":{"id":"win-node-1","type":"dock","tags":["windows"]}}
//! {"type":"tunnel.command","request_id":"7","name":"restart","args":["web"]}
//! {"type":"tunnel.result","request_id":"7","data":{"status":"Running"}}
//! {"type":"tunnel.ping"}
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod acceptor;
pub mod session;
pub mod supervisor;

/// `Upgrade` token announced when accepting an inbound tunnel.
pub const PROTOCOL_NAME: &str = "hms-protocol";

/// Path used for tunnel upgrades in both directions.
pub const TUNNEL_PATH: &str = "/dock";

/// Identity and capabilities exchanged once per connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Handshake {
    /// The handshake this agent sends: peer type `dock`.
    pub fn dock(id: impl Into<String>, tags: Vec<String>) -> Self {
        Self {
            id: id.into(),
            kind: "dock".to_string(),
            tags,
        }
    }
}

/// One line on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "tunnel.handshake")]
    Handshake { payload: Handshake },
    #[serde(rename = "tunnel.command")]
    Command {
        request_id: String,
        name: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    #[serde(rename = "tunnel.result")]
    Result {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default)]
        data: Value,
    },
    #[serde(rename = "tunnel.ping")]
    Ping,
    #[serde(rename = "tunnel.pong")]
    Pong,
}

impl Frame {
    /// Result frame for a finished command: failures carry no data.
    pub fn result(request_id: String, result: Result<Value, String>) -> Self {
        match result {
            Ok(data) => Frame::Result {
                request_id,
                error: None,
                data,
            },
            Err(error) => Frame::Result {
                request_id,
                error: Some(error),
                data: Value::Null,
            },
        }
    }
}

/// Lifecycle of the outbound tunnel, owned by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TunnelState {
    Disconnected = 0,
    Connecting = 1,
    AwaitingHandshake = 2,
    Ready = 3,
}

impl TunnelState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::AwaitingHandshake => "awaiting_handshake",
            Self::Ready => "ready",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::AwaitingHandshake,
            3 => Self::Ready,
            _ => Self::Disconnected,
        }
    }
}

/// Read-only view of the supervisor's progress for the health endpoint.
///
/// Only the supervisor writes these.
pub struct TunnelStats {
    state: AtomicU8,
    pub connected: AtomicBool,
    pub reconnects: AtomicU64,
}

impl TunnelStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(TunnelState::Disconnected as u8),
            connected: AtomicBool::new(false),
            reconnects: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> TunnelState {
        TunnelState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub(crate) fn set_state(&self, state: TunnelState) {
        self.state.store(state as u8, Ordering::Relaxed);
        self.connected
            .store(state == TunnelState::Ready, Ordering::Relaxed);
    }
}

impl Default for TunnelStats {
    fn default() -> Self {
        Self::new()
    }
}

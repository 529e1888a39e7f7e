//! Shared agent state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::dispatch::Dispatcher;
use crate::tunnel::TunnelStats;

/// Shared state for the control listener.
#[derive(Clone)]
pub struct AgentState {
    /// Identity announced to the controller.
    pub identity: String,
    /// Routes commands arriving on inbound tunnel sessions.
    pub dispatcher: Dispatcher,
    /// Keep-alive interval for tunnel sessions.
    pub heartbeat: Duration,
    /// Outbound tunnel progress, written only by the supervisor.
    pub tunnel_stats: Arc<TunnelStats>,
    /// Monotonic instant when the agent started (for uptime calculation).
    pub start_time: Instant,
}

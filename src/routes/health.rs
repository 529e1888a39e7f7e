//! Unauthenticated health-check endpoint.

use std::sync::atomic::Ordering;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AgentState;

/// `GET /api/health` — liveness probe.
///
/// Reports uptime, identity and the outbound tunnel's state. Purely a reader
/// of the supervisor's stats.
pub async fn health(State(state): State<AgentState>) -> Json<Value> {
    let ts = &state.tunnel_stats;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "identity": state.identity,
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "tunnel": {
            "state": ts.state().as_str(),
            "connected": ts.connected.load(Ordering::Relaxed),
            "reconnects": ts.reconnects.load(Ordering::Relaxed),
        },
    }))
}

//! Control listener routes.
//!
//! | Method  | Path          | Description                              |
//! |---------|---------------|------------------------------------------|
//! | CONNECT | `/dock`       | Inbound tunnel upgrade                   |
//! | GET     | `/api/health` | Liveness probe with tunnel status        |
//! | *       | anything else | Static identification string             |

use axum::{routing::any, routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::state::AgentState;
use crate::tunnel::{acceptor, TUNNEL_PATH};

pub mod health;

/// Body returned to plain requests on the control listener.
pub const IDENTIFICATION: &str = "hms-windows-dock\n";

/// Build the control listener router.
pub fn control_router(state: AgentState) -> Router {
    Router::new()
        .route(TUNNEL_PATH, any(acceptor::accept))
        .route("/api/health", get(health::health))
        .fallback(identify)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Static identification string.
pub async fn identify() -> &'static str {
    IDENTIFICATION
}

//! Inbound tunnel acceptor — `CONNECT /dock` on the control listener.
//!
//! The peer gets a fixed `101 Switching Protocols` reply, then the socket
//! becomes a [`TunnelSession`]. Unlike the outbound path, commands are only
//! routed after the peer's handshake has been received.

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
};
use hyper_util::rt::TokioIo;
use tracing::{info, warn};

use super::session::TunnelSession;
use super::PROTOCOL_NAME;
use crate::state::AgentState;

/// `CONNECT /dock` — upgrade to a tunnel session. Other methods get the
/// identification string.
pub async fn accept(State(state): State<AgentState>, mut request: Request) -> Response {
    if request.method() != Method::CONNECT {
        return crate::routes::identify().await.into_response();
    }

    let origin = request
        .headers()
        .get("origin")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    info!(origin = %origin, "Tunnel: inbound upgrade");

    let on_upgrade = hyper::upgrade::on(&mut request);
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!(origin = %origin, "Tunnel: inbound upgrade failed: {e}");
                return;
            }
        };

        let mut session = TunnelSession::new(TokioIo::new(upgraded), state.heartbeat);
        session.attach_on_handshake(state.dispatcher.clone());
        match session.run().await {
            Ok(()) => info!(origin = %origin, "Tunnel: inbound session closed"),
            Err(e) => warn!(origin = %origin, "Tunnel: inbound session failed: {e}"),
        }
    });

    switching_protocols()
}

/// The fixed protocol-switch reply.
fn switching_protocols() -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(header::UPGRADE, header::HeaderValue::from_static(PROTOCOL_NAME));
    headers.insert(header::CONNECTION, header::HeaderValue::from_static("Upgrade"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switching_protocols_headers() {
        let response = switching_protocols();
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(response.headers()[header::UPGRADE], "hms-protocol");
        assert_eq!(response.headers()[header::CONNECTION], "Upgrade");
    }
}

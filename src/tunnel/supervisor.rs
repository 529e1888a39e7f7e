//! Outbound tunnel supervisor — keeps one session to the controller alive.
//!
//! Each attempt issues `CONNECT /dock` with an `origin` header, sends the
//! handshake over the upgraded stream, attaches the dispatcher and serves
//! until the stream ends. Attempts are strictly sequential; the next one is
//! scheduled by [`Backoff`]:
//!
//! - failures while no attempt has reached `Ready` retry every 5 s
//! - the first failure after a session was up retries after 2.5 s

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::header::{AUTHORIZATION, HOST};
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::session::{SessionError, TunnelSession};
use super::{Handshake, TunnelState, TunnelStats, TUNNEL_PATH};
use crate::config::RemoteEndpoint;
use crate::dispatch::Dispatcher;

/// Retry delay while the tunnel has not been up since the last drop.
pub const COLD_RETRY: Duration = Duration::from_millis(5000);

/// Retry delay right after a live session dropped.
pub const DROP_RETRY: Duration = Duration::from_millis(2500);

/// Reconnect timing driven by the dropped flag.
#[derive(Debug, Clone)]
pub struct Backoff {
    dropped: bool,
}

impl Backoff {
    pub fn new() -> Self {
        Self { dropped: true }
    }

    /// The tunnel came up.
    pub fn on_ready(&mut self) {
        self.dropped = false;
    }

    /// An attempt failed or a session ended; returns the delay before the next attempt.
    pub fn on_failure(&mut self) -> Duration {
        if self.dropped {
            return COLD_RETRY;
        }
        self.dropped = true;
        DROP_RETRY
    }

    pub fn dropped(&self) -> bool {
        self.dropped
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the outbound tunnel's state, backoff and reconnect loop.
pub struct Supervisor {
    remote: RemoteEndpoint,
    handshake: Handshake,
    dispatcher: Dispatcher,
    heartbeat: Duration,
    stats: Arc<TunnelStats>,
    state: TunnelState,
    backoff: Backoff,
}

impl Supervisor {
    pub fn new(
        remote: RemoteEndpoint,
        handshake: Handshake,
        dispatcher: Dispatcher,
        heartbeat: Duration,
        stats: Arc<TunnelStats>,
    ) -> Self {
        Self {
            remote,
            handshake,
            dispatcher,
            heartbeat,
            stats,
            state: TunnelState::Disconnected,
            backoff: Backoff::new(),
        }
    }

    /// Spawn the reconnect loop. Runs until the task is aborted.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Connect, serve, back off, repeat.
    pub async fn run(mut self) {
        loop {
            self.set_state(TunnelState::Connecting);
            info!("Tunnel: connecting to {}", self.remote.authority());

            match self.connect_and_run().await {
                Ok(()) => info!("Tunnel: connection closed by controller"),
                Err(e) => warn!("Tunnel: {e}"),
            }

            let delay = self.backoff.on_failure();
            self.set_state(TunnelState::Disconnected);
            self.stats
                .reconnects
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            info!("Tunnel: reconnecting in {}ms", delay.as_millis());
            tokio::time::sleep(delay).await;
        }
    }

    /// A single attempt: returns once, which makes the failure handling
    /// per-attempt idempotent.
    async fn connect_and_run(&mut self) -> Result<(), ConnectError> {
        let upgraded = open_tunnel(&self.remote, &self.handshake.id).await?;
        self.backoff.on_ready();
        self.set_state(TunnelState::AwaitingHandshake);

        let mut session = TunnelSession::new(TokioIo::new(upgraded), self.heartbeat);
        session.send_handshake(self.handshake.clone()).await?;
        session.attach(self.dispatcher.clone());
        self.set_state(TunnelState::Ready);
        info!(id = %self.handshake.id, tags = ?self.handshake.tags, "Tunnel: ready");

        session.run().await?;
        Ok(())
    }

    fn set_state(&mut self, state: TunnelState) {
        if self.state != state {
            debug!("Tunnel: {} -> {}", self.state.as_str(), state.as_str());
        }
        self.state = state;
        self.stats.set_state(state);
    }
}

/// Dial the controller and upgrade the connection with `CONNECT /dock`.
pub async fn open_tunnel(remote: &RemoteEndpoint, origin: &str) -> Result<Upgraded, ConnectError> {
    let stream = TcpStream::connect(remote.authority()).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!("Tunnel: connect driver ended: {e}");
        }
    });

    let mut request = Request::builder()
        .method(Method::CONNECT)
        .uri(TUNNEL_PATH)
        .header(HOST, remote.authority())
        .header("origin", origin);
    if let Some(ref key) = remote.key {
        request = request.header(AUTHORIZATION, format!("Bearer {key}"));
    }
    let request = request.body(Empty::<Bytes>::new())?;

    let response = sender.send_request(request).await?;
    let status = response.status();
    if !(status.is_success() || status == StatusCode::SWITCHING_PROTOCOLS) {
        return Err(ConnectError::Rejected(status));
    }
    Ok(hyper::upgrade::on(response).await?)
}

/// Why a connection attempt or a live session ended.
#[derive(Debug)]
pub enum ConnectError {
    Io(std::io::Error),
    Http(hyper::Error),
    Request(hyper::http::Error),
    /// The controller answered the CONNECT with a non-success status.
    Rejected(StatusCode),
    Session(SessionError),
}

impl From<std::io::Error> for ConnectError {
    fn from(e: std::io::Error) -> Self {
        ConnectError::Io(e)
    }
}

impl From<hyper::Error> for ConnectError {
    fn from(e: hyper::Error) -> Self {
        ConnectError::Http(e)
    }
}

impl From<hyper::http::Error> for ConnectError {
    fn from(e: hyper::http::Error) -> Self {
        ConnectError::Request(e)
    }
}

impl From<SessionError> for ConnectError {
    fn from(e: SessionError) -> Self {
        ConnectError::Session(e)
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::Io(e) => write!(f, "connect failed: {e}"),
            ConnectError::Http(e) => write!(f, "upgrade failed: {e}"),
            ConnectError::Request(e) => write!(f, "bad CONNECT request: {e}"),
            ConnectError::Rejected(s) => write!(f, "controller rejected tunnel: {s}"),
            ConnectError::Session(e) => write!(f, "session ended: {e}"),
        }
    }
}

impl std::error::Error for ConnectError {}

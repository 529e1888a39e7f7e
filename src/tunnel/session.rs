//! A single tunnel connection as a framed peer.
//!
//! The session reads newline-delimited [`Frame`]s, answers pings, routes
//! commands to the attached [`Dispatcher`], resolves results for requests it
//! emitted, and sends a ping every heartbeat interval. It never reconnects;
//! [`TunnelSession::run`] simply returns when the stream ends or fails.
//!
//! Each command runs in its own task, so completions come back in whatever
//! order the scripts finish.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

use super::{Frame, Handshake};
use crate::dispatch::{Command, Dispatcher};

/// Longest frame accepted from the peer (16 MB).
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Queue depth for frames waiting to be written.
const OUTBOUND_QUEUE: usize = 256;

/// Answer for a request this side emitted: data, or the peer's error text.
pub type RemoteResult = Result<Value, String>;

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<RemoteResult>>>>;

/// When inbound commands start reaching the dispatcher.
enum Attachment {
    None,
    /// Dialed out and already sent our handshake.
    Attached(Dispatcher),
    /// Dialed by a peer; wait for its handshake first.
    AwaitingHandshake(Dispatcher),
}

/// One upgraded connection carrying JSON frames.
pub struct TunnelSession<IO> {
    framed: Framed<IO, LinesCodec>,
    outbound_tx: mpsc::Sender<Frame>,
    outbound_rx: mpsc::Receiver<Frame>,
    pending: PendingMap,
    attachment: Attachment,
    peer: Option<Handshake>,
    heartbeat: Duration,
}

impl<IO> TunnelSession<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(io: IO, heartbeat: Duration) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        Self {
            framed: Framed::new(io, LinesCodec::new_with_max_length(MAX_FRAME_LEN)),
            outbound_tx,
            outbound_rx,
            pending: Arc::new(Mutex::new(HashMap::new())),
            attachment: Attachment::None,
            peer: None,
            heartbeat,
        }
    }

    /// Handle for emitting requests to the peer while the session runs.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            tx: self.outbound_tx.clone(),
            pending: self.pending.clone(),
        }
    }

    /// Write our handshake immediately, ahead of any queued frame.
    pub async fn send_handshake(&mut self, handshake: Handshake) -> Result<(), SessionError> {
        self.write(&Frame::Handshake { payload: handshake }).await
    }

    /// Route commands to `dispatcher` from now on.
    pub fn attach(&mut self, dispatcher: Dispatcher) {
        self.attachment = Attachment::Attached(dispatcher);
    }

    /// Route commands to `dispatcher` once the peer's handshake arrives.
    pub fn attach_on_handshake(&mut self, dispatcher: Dispatcher) {
        self.attachment = match self.peer {
            Some(_) => Attachment::Attached(dispatcher),
            None => Attachment::AwaitingHandshake(dispatcher),
        };
    }

    /// The peer's handshake, once received.
    pub fn peer(&self) -> Option<&Handshake> {
        self.peer.as_ref()
    }

    /// Serve until the stream ends (`Ok`) or fails (`Err`).
    pub async fn run(mut self) -> Result<(), SessionError> {
        let start = tokio::time::Instant::now() + self.heartbeat;
        let mut heartbeat = tokio::time::interval_at(start, self.heartbeat);

        let outcome = loop {
            tokio::select! {
                line = self.framed.next() => match line {
                    None => break Ok(()),
                    Some(Err(e)) => break Err(SessionError::from(e)),
                    Some(Ok(line)) => {
                        if let Err(e) = self.on_line(&line).await {
                            break Err(e);
                        }
                    }
                },
                Some(frame) = self.outbound_rx.recv() => {
                    if let Err(e) = self.write(&frame).await {
                        break Err(e);
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = self.write(&Frame::Ping).await {
                        break Err(e);
                    }
                }
            }
        };

        // Dropping the senders fails every outstanding emit with "session closed".
        self.pending.lock().await.clear();
        outcome
    }

    async fn on_line(&mut self, line: &str) -> Result<(), SessionError> {
        if line.trim().is_empty() {
            return Ok(());
        }
        let frame: Frame = match serde_json::from_str(line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Tunnel: ignoring unreadable frame: {e}");
                return Ok(());
            }
        };

        match frame {
            Frame::Handshake { payload } => self.on_handshake(payload),
            Frame::Command {
                request_id,
                name,
                args,
            } => self.on_command(request_id, name, &args).await?,
            Frame::Result {
                request_id,
                error,
                data,
            } => {
                let waiter = self.pending.lock().await.remove(&request_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(error.map_or(Ok(data), Err));
                    }
                    None => debug!(request_id, "Tunnel: result for unknown request"),
                }
            }
            Frame::Ping => self.write(&Frame::Pong).await?,
            Frame::Pong => debug!("Tunnel: pong"),
        }
        Ok(())
    }

    fn on_handshake(&mut self, payload: Handshake) {
        info!(peer = %payload.id, kind = %payload.kind, tags = ?payload.tags, "Tunnel: peer handshake");
        self.peer = Some(payload);
        self.attachment = match std::mem::replace(&mut self.attachment, Attachment::None) {
            Attachment::AwaitingHandshake(dispatcher) => Attachment::Attached(dispatcher),
            other => other,
        };
    }

    async fn on_command(
        &mut self,
        request_id: String,
        name: String,
        args: &[Value],
    ) -> Result<(), SessionError> {
        let dispatcher = match self.attachment {
            Attachment::Attached(ref d) => d.clone(),
            Attachment::AwaitingHandshake(_) => {
                warn!(command = %name, "Tunnel: command before peer handshake, rejecting");
                let frame = Frame::result(request_id, Err("handshake required".to_string()));
                return self.write(&frame).await;
            }
            Attachment::None => {
                let frame = Frame::result(request_id, Err("no command handler attached".to_string()));
                return self.write(&frame).await;
            }
        };
        let responder = Responder {
            request_id,
            tx: self.outbound_tx.clone(),
        };

        let command = Command::from_args(name, args);
        tokio::spawn(async move {
            let result = dispatcher.dispatch(&command).await;
            responder.finish(result.map_err(|e| e.to_string())).await;
        });
        Ok(())
    }

    async fn write(&mut self, frame: &Frame) -> Result<(), SessionError> {
        let line = serde_json::to_string(frame).map_err(SessionError::Encode)?;
        self.framed.send(line).await.map_err(SessionError::from)
    }
}

/// Sends the one result a command gets. Consumed on use.
struct Responder {
    request_id: String,
    tx: mpsc::Sender<Frame>,
}

impl Responder {
    async fn finish(self, result: RemoteResult) {
        let frame = Frame::result(self.request_id, result);
        if self.tx.send(frame).await.is_err() {
            debug!("Tunnel: session gone before result could be sent");
        }
    }
}

/// Cloneable handle for emitting requests over a running session.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Frame>,
    pending: PendingMap,
}

impl SessionHandle {
    /// Send a named request and wait for the peer's result.
    pub async fn emit(&self, name: &str, args: Vec<Value>) -> RemoteResult {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        let frame = Frame::Command {
            request_id: request_id.clone(),
            name: name.to_string(),
            args,
        };
        if self.tx.send(frame).await.is_err() {
            self.pending.lock().await.remove(&request_id);
            return Err("session closed".to_string());
        }
        rx.await.unwrap_or_else(|_| Err("session closed".to_string()))
    }
}

/// Transport failures that end a session.
#[derive(Debug)]
pub enum SessionError {
    Io(std::io::Error),
    FrameTooLong,
    Encode(serde_json::Error),
}

impl From<LinesCodecError> for SessionError {
    fn from(e: LinesCodecError) -> Self {
        match e {
            LinesCodecError::Io(e) => SessionError::Io(e),
            LinesCodecError::MaxLineLengthExceeded => SessionError::FrameTooLong,
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Io(e) => write!(f, "tunnel I/O error: {e}"),
            SessionError::FrameTooLong => write!(f, "frame exceeds {MAX_FRAME_LEN} bytes"),
            SessionError::Encode(e) => write!(f, "failed to encode frame: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

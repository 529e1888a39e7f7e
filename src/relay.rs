//! Artifact relay — streams controller artifacts to local scripts.
//!
//! Every request on the relay listener becomes `GET <same path>` against the
//! controller with an `origin` header carrying our identity. Status, headers
//! and body are streamed straight back; nothing is buffered.
//!
//! If the upstream request fails, the local connection is closed without a
//! response, and if the upstream body fails mid-stream the local response is
//! aborted. A caller never sees a completed response for a failed fetch.

use std::fmt;
use std::net::SocketAddr;

use http_body_util::Empty;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, AUTHORIZATION, CONNECTION, HOST, TRANSFER_ENCODING};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::RemoteEndpoint;

/// Hop-by-hop headers not forwarded from the upstream response.
const HOP_BY_HOP: &[&str] = &[
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "upgrade",
];

/// Proxies artifact fetches to the controller.
#[derive(Clone)]
pub struct ArtifactRelay {
    remote: RemoteEndpoint,
    identity: String,
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl ArtifactRelay {
    pub fn new(remote: RemoteEndpoint, identity: impl Into<String>) -> Self {
        Self {
            remote,
            identity: identity.into(),
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    /// Accept loop. Runs until the task is aborted.
    pub async fn serve(self, listener: TcpListener) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Relay: accept failed: {e}");
                    continue;
                }
            };
            let relay = self.clone();
            tokio::spawn(async move {
                let service = service_fn(move |request| {
                    let relay = relay.clone();
                    async move { relay.fetch(request).await }
                });
                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!(%peer, "Relay: connection closed: {e}");
                }
            });
        }
    }

    /// Proxy one request. An `Err` makes hyper drop the connection unanswered.
    pub async fn fetch(&self, request: Request<Incoming>) -> Result<Response<Incoming>, RelayError> {
        let path = request
            .uri()
            .path_and_query()
            .map_or("/", |pq| pq.as_str())
            .to_string();
        info!("Relay: fetching {path}");

        let upstream = self.upstream_request(&path)?;
        let response = self.client.request(upstream).await.map_err(|e| {
            warn!("Relay: upstream fetch of {path} failed: {e}");
            RelayError::Upstream(e)
        })?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        debug!(status = %parts.status, "Relay: streaming {path}");
        Ok(Response::from_parts(parts, body))
    }

    fn upstream_request(&self, path: &str) -> Result<Request<Empty<Bytes>>, RelayError> {
        let uri: Uri = format!("http://{}{path}", self.remote.authority())
            .parse()
            .map_err(|_| RelayError::BadPath(path.to_string()))?;
        let mut builder = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(HOST, self.remote.authority())
            .header("origin", &self.identity);
        if let Some(ref key) = self.remote.key {
            builder = builder.header(AUTHORIZATION, format!("Bearer {key}"));
        }
        builder
            .body(Empty::new())
            .map_err(|_| RelayError::BadPath(path.to_string()))
    }
}

/// Bind and serve the relay in a background task.
pub async fn spawn(
    relay: ArtifactRelay,
    addr: SocketAddr,
) -> std::io::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    info!("Relay: listening on {local}");
    Ok((local, tokio::spawn(relay.serve(listener))))
}

fn strip_hop_by_hop(headers: &mut hyper::HeaderMap) {
    // Headers named in `Connection` are hop-by-hop too.
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    headers.remove(CONNECTION);
    headers.remove(TRANSFER_ENCODING);
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Why a relay fetch was abandoned.
#[derive(Debug)]
pub enum RelayError {
    /// The request path cannot be turned into an upstream URI.
    BadPath(String),
    /// Connecting to or reading from the controller failed.
    Upstream(hyper_util::client::legacy::Error),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::BadPath(p) => write!(f, "cannot relay path {p:?}"),
            RelayError::Upstream(e) => write!(f, "upstream fetch failed: {e}"),
        }
    }
}

impl std::error::Error for RelayError {}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn relay(key: Option<&str>) -> ArtifactRelay {
        ArtifactRelay::new(
            RemoteEndpoint {
                host: "hub".into(),
                port: 10002,
                key: key.map(ToString::to_string),
            },
            "win-node-1",
        )
    }

    #[tokio::test]
    async fn test_upstream_request_shape() {
        let req = relay(None).upstream_request("/svc-a?v=2").unwrap();
        assert_eq!(req.method(), Method::GET);
        assert_eq!(req.uri().to_string(), "http://hub:10002/svc-a?v=2");
        assert_eq!(req.headers()["origin"], "win-node-1");
        assert!(req.headers().get(AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn test_upstream_request_with_key() {
        let req = relay(Some("s3cret")).upstream_request("/svc-a").unwrap();
        assert_eq!(req.headers()[AUTHORIZATION], "Bearer s3cret");
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-trace"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert("content-type", HeaderValue::from_static("application/gzip"));
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers["content-type"], "application/gzip");
    }
}

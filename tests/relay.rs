//! Artifact relay over real sockets: a local upstream stands in for the
//! controller.

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::extract::Path;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::StatusCode;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use dockd::relay;
use dockd::{ArtifactRelay, RemoteEndpoint};

fn endpoint(addr: SocketAddr) -> RemoteEndpoint {
    RemoteEndpoint {
        host: addr.ip().to_string(),
        port: addr.port(),
        key: None,
    }
}

async fn start_relay(upstream: SocketAddr) -> SocketAddr {
    let relay = ArtifactRelay::new(endpoint(upstream), "win-node-1");
    let (addr, _task) = relay::spawn(relay, "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    addr
}

fn client() -> Client<hyper_util::client::legacy::connect::HttpConnector, Empty<Bytes>> {
    Client::builder(TokioExecutor::new()).build_http()
}

async fn tarball(Path(service): Path<String>, headers: HeaderMap) -> impl IntoResponse {
    let origin = headers
        .get("origin")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let chunks = vec![
        Ok::<_, std::io::Error>(Bytes::from(format!("{service}:"))),
        Ok(Bytes::from_static(b"part1,")),
        Ok(Bytes::from_static(b"part2")),
    ];
    (
        [("x-seen-origin", origin), ("content-type", "application/gzip".to_string())],
        Body::from_stream(futures::stream::iter(chunks)),
    )
}

#[tokio::test]
async fn test_streams_upstream_response() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = listener.local_addr().unwrap();
    let app = Router::new().route("/{service}", get(tarball));
    tokio::spawn(async move { axum::serve(listener, app).await });

    let relay = start_relay(upstream).await;
    let uri = format!("http://{relay}/svc-a").parse().unwrap();
    let response = client().get(uri).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-seen-origin"], "win-node-1");
    assert_eq!(response.headers()["content-type"], "application/gzip");
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"svc-a:part1,part2");
}

#[tokio::test]
async fn test_upstream_status_is_forwarded() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = listener.local_addr().unwrap();
    let app = Router::new().route("/{service}", get(|| async { StatusCode::NOT_FOUND }));
    tokio::spawn(async move { axum::serve(listener, app).await });

    let relay = start_relay(upstream).await;
    let uri = format!("http://{relay}/missing").parse().unwrap();
    let response = client().get(uri).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_refused_upstream_closes_without_response() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let upstream = listener.local_addr().unwrap();
    drop(listener);

    let relay = start_relay(upstream).await;
    let uri = format!("http://{relay}/svc-a").parse().unwrap();
    assert!(client().get(uri).await.is_err());
}

#[tokio::test]
async fn test_truncated_upstream_body_aborts_response() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        let _ = stream.read(&mut buf).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\npartial")
            .await
            .unwrap();
        stream.flush().await.unwrap();
        // Dropping the socket cuts the body short.
    });

    let relay = start_relay(upstream).await;
    let uri = format!("http://{relay}/svc-a").parse().unwrap();
    let outcome = match client().get(uri).await {
        Ok(response) => response.into_body().collect().await.map(|_| ()).is_ok(),
        Err(_) => false,
    };
    assert!(!outcome, "a truncated upstream body must not complete locally");
}

#[tokio::test]
async fn test_first_chunk_arrives_before_upstream_finishes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = listener.local_addr().unwrap();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        let _ = stream.read(&mut buf).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n5\r\nfirst\r\n")
            .await
            .unwrap();
        stream.flush().await.unwrap();
        let _ = release_rx.await;
        stream.write_all(b"6\r\nsecond\r\n0\r\n\r\n").await.unwrap();
        stream.flush().await.unwrap();
    });

    let relay = start_relay(upstream).await;
    let uri = format!("http://{relay}/svc-a").parse().unwrap();
    let response = client().get(uri).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = response.into_body();

    let first = tokio::time::timeout(Duration::from_secs(2), body.frame())
        .await
        .expect("first chunk held back by the relay")
        .unwrap()
        .unwrap();
    assert_eq!(&first.into_data().unwrap()[..], b"first");

    release_tx.send(()).unwrap();
    let rest = body.collect().await.unwrap().to_bytes();
    assert_eq!(&rest[..], b"second");
}

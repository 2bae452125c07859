//! One-shot HTTP/1.1 client.
//!
//! Opens a connection, sends a single request and collects the whole
//! response body. Used for peer links and for fetching remote files.

use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("{0}")]
    Http(String),
}

impl TransportError {
    fn http(e: impl std::fmt::Display) -> Self {
        Self::Http(e.to_string())
    }
}

/// Send one request to `address` (`host:port`). JSON is assumed when a
/// body is given. Non-2xx statuses are returned, not treated as errors.
pub async fn send_request(
    address: &str,
    method: Method,
    path: &str,
    body: Option<Vec<u8>>,
) -> Result<(StatusCode, Bytes), TransportError> {
    let stream = tokio::net::TcpStream::connect(address)
        .await
        .map_err(TransportError::Connect)?;

    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(TransportError::http)?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let mut builder = http::Request::builder()
        .method(method)
        .uri(path)
        .header(http::header::HOST, address)
        .header(http::header::USER_AGENT, "fleetgrid/0.1");
    if body.is_some() {
        builder = builder.header(http::header::CONTENT_TYPE, "application/json");
    }
    let req = builder
        .body(Full::new(Bytes::from(body.unwrap_or_default())))
        .map_err(TransportError::http)?;

    let resp = sender.send_request(req).await.map_err(TransportError::http)?;
    let status = resp.status();
    let bytes = resp
        .into_body()
        .collect()
        .await
        .map_err(TransportError::http)?
        .to_bytes();
    Ok((status, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, routing::post};

    #[tokio::test]
    async fn body_and_status_come_back() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let app = Router::new().route("/echo", post(|body: Bytes| async move { body }));
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let (status, body) = send_request(&addr, Method::POST, "/echo", Some(b"{\"a\":1}".to_vec()))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"{\"a\":1}");

        let (status, _) = send_request(&addr, Method::GET, "/missing", None).await.unwrap();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn closed_port_is_a_connect_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = send_request(&addr, Method::GET, "/", None).await.unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)), "{err}");
    }
}

//! Peer transport.
//!
//! [`PeerChannel`] is the seam between the propagator and the network.
//! [`HttpPeer`] implements it with one short-lived HTTP/1.1 connection
//! per request.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;
use uuid::Uuid;

use fleetgrid_state::ServiceSnapshot;

use crate::error::{ClusterError, ClusterResult};
use crate::packet::{PacketAck, ServicePacket, SnapshotReply};
use crate::transport::{TransportError, send_request};

/// A connection to one peer node.
#[async_trait]
pub trait PeerChannel: Send + Sync + 'static {
    /// Name of the node on the other end.
    fn node_name(&self) -> &str;

    /// Deliver a published change. Returns whether the peer's cache
    /// changed.
    async fn publish(&self, packet: &ServicePacket) -> ClusterResult<bool>;

    /// Ask the peer for the live snapshot of a service it owns.
    async fn query_snapshot(&self, unique_id: Uuid) -> ClusterResult<Option<ServiceSnapshot>>;

    /// Every snapshot in the peer's cache.
    async fn list_services(&self) -> ClusterResult<Vec<ServiceSnapshot>>;
}

/// HTTP/JSON peer client.
#[derive(Debug, Clone)]
pub struct HttpPeer {
    node_name: String,
    /// `host:port` of the peer's cluster listener.
    address: String,
    timeout: Duration,
}

impl HttpPeer {
    pub fn new(node_name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            address: address.into(),
            timeout: Duration::from_secs(5),
        }
    }

    /// Bound on connect plus request plus response body.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn request(&self, method: http::Method, path: &str, body: Option<Vec<u8>>) -> ClusterResult<Bytes> {
        match tokio::time::timeout(self.timeout, self.exchange(method, path, body)).await {
            Ok(result) => result,
            Err(_) => Err(ClusterError::Timeout {
                peer: self.node_name.clone(),
                timeout: self.timeout,
            }),
        }
    }

    async fn exchange(&self, method: http::Method, path: &str, body: Option<Vec<u8>>) -> ClusterResult<Bytes> {
        let (status, bytes) = send_request(&self.address, method, path, body)
            .await
            .map_err(|e| match e {
                TransportError::Connect(e) => ClusterError::Connect {
                    peer: self.node_name.clone(),
                    reason: e.to_string(),
                },
                TransportError::Http(reason) => ClusterError::Http {
                    peer: self.node_name.clone(),
                    reason,
                },
            })?;

        if !status.is_success() {
            debug!(%status, peer = %self.node_name, path, "peer request non-2xx");
            return Err(ClusterError::Status {
                peer: self.node_name.clone(),
                status: status.as_u16(),
            });
        }
        Ok(bytes)
    }
}

#[async_trait]
impl PeerChannel for HttpPeer {
    fn node_name(&self) -> &str {
        &self.node_name
    }

    async fn publish(&self, packet: &ServicePacket) -> ClusterResult<bool> {
        let body = serde_json::to_vec(packet)?;
        let bytes = self
            .request(http::Method::POST, "/cluster/v1/packets", Some(body))
            .await?;
        let ack: PacketAck = serde_json::from_slice(&bytes)?;
        Ok(ack.applied)
    }

    async fn query_snapshot(&self, unique_id: Uuid) -> ClusterResult<Option<ServiceSnapshot>> {
        let path = format!("/cluster/v1/services/{unique_id}/snapshot");
        let bytes = self.request(http::Method::GET, &path, None).await?;
        let reply: SnapshotReply = serde_json::from_slice(&bytes)?;
        Ok(reply.snapshot)
    }

    async fn list_services(&self) -> ClusterResult<Vec<ServiceSnapshot>> {
        let bytes = self.request(http::Method::GET, "/cluster/v1/services", None).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_peer_is_a_connect_error() {
        // Bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let peer = HttpPeer::new("node-x", addr.to_string());
        let err = peer.query_snapshot(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ClusterError::Connect { .. }), "{err}");
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        // Accepts connections but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let peer = HttpPeer::new("node-x", addr.to_string()).with_timeout(Duration::from_millis(100));
        let err = peer.query_snapshot(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ClusterError::Timeout { .. }), "{err}");
    }
}

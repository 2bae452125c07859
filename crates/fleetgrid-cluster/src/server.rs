//! Server side of the cluster transport.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::debug;
use uuid::Uuid;

use crate::packet::{PacketAck, ServicePacket, SnapshotReply};
use crate::propagator::ClusterPropagator;

/// Build the router that peers talk to.
pub fn cluster_router(propagator: Arc<ClusterPropagator>) -> Router {
    let routes = Router::new()
        .route("/packets", post(receive_packet))
        .route("/services", get(list_services))
        .route("/services/{unique_id}/snapshot", get(live_snapshot))
        .with_state(propagator);

    Router::new().nest("/cluster/v1", routes)
}

/// POST /cluster/v1/packets
async fn receive_packet(
    State(propagator): State<Arc<ClusterPropagator>>,
    Json(packet): Json<ServicePacket>,
) -> impl IntoResponse {
    let from = packet.origin.clone();
    let kind = packet.kind;
    let outcome = propagator.apply(packet);
    debug!(%from, %kind, ?outcome, "packet received");

    let applied = outcome.is_some_and(|o| o.changed());
    (StatusCode::OK, Json(PacketAck { applied }))
}

/// GET /cluster/v1/services
async fn list_services(State(propagator): State<Arc<ClusterPropagator>>) -> impl IntoResponse {
    Json(propagator.cache().list())
}

/// GET /cluster/v1/services/{unique_id}/snapshot
async fn live_snapshot(
    State(propagator): State<Arc<ClusterPropagator>>,
    Path(unique_id): Path<Uuid>,
) -> impl IntoResponse {
    let snapshot = propagator.local_live_snapshot(unique_id).await;
    Json(SnapshotReply { snapshot })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::propagator::SnapshotSource;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use fleetgrid_state::*;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct OneService(ServiceSnapshot);

    #[async_trait]
    impl SnapshotSource for OneService {
        async fn live_snapshot(&self, unique_id: Uuid) -> Option<ServiceSnapshot> {
            (self.0.unique_id() == unique_id).then(|| self.0.clone())
        }
    }

    fn snapshot(owner: &str) -> ServiceSnapshot {
        let id = ServiceId::new("Proxy", 1, owner, "PROXY");
        ServiceSnapshot {
            creation_time: now_millis(),
            sequence: 1,
            address: HostAndPort::new("127.0.0.1", 25565),
            connect_address: HostAndPort::new("127.0.0.1", 25565),
            lifecycle: LifecycleState::Running,
            process: ProcessSnapshot::empty(),
            properties: Properties::new(),
            configuration: ServiceConfiguration::new(id, 25565, 128, vec![]),
        }
    }

    fn propagator() -> Arc<ClusterPropagator> {
        Arc::new(ClusterPropagator::new("node-b", Arc::new(SnapshotCache::new())))
    }

    async fn body_json<T: serde::de::DeserializeOwned>(resp: axum::response::Response) -> T {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn post_packet_applies_to_cache() {
        let prop = propagator();
        let router = cluster_router(Arc::clone(&prop));
        let packet = ServicePacket {
            kind: PublishKind::Register,
            origin: "node-a".into(),
            snapshot: snapshot("node-a"),
        };

        let req = Request::builder()
            .method("POST")
            .uri("/cluster/v1/packets")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&packet).unwrap()))
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let ack: PacketAck = body_json(resp).await;
        assert!(ack.applied);
        assert!(prop.cache().contains(&packet.snapshot.unique_id()));

        // Same packet again changes nothing.
        let req = Request::builder()
            .method("POST")
            .uri("/cluster/v1/packets")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&packet).unwrap()))
            .unwrap();
        let ack: PacketAck = body_json(router.oneshot(req).await.unwrap()).await;
        assert!(!ack.applied);
    }

    #[tokio::test]
    async fn malformed_packet_is_rejected() {
        let router = cluster_router(propagator());
        let req = Request::builder()
            .method("POST")
            .uri("/cluster/v1/packets")
            .header("content-type", "application/json")
            .body(Body::from("{\"kind\":\"REGISTER\"}"))
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn snapshot_query_answers_for_local_services() {
        let prop = propagator();
        let live = snapshot("node-b");
        let source: Arc<dyn SnapshotSource> = Arc::new(OneService(live.clone()));
        prop.set_source(Arc::downgrade(&source));
        let router = cluster_router(prop);

        let req = Request::builder()
            .uri(format!("/cluster/v1/services/{}/snapshot", live.unique_id()))
            .body(Body::empty())
            .unwrap();
        let reply: SnapshotReply = body_json(router.clone().oneshot(req).await.unwrap()).await;
        assert_eq!(reply.snapshot, Some(live));

        let req = Request::builder()
            .uri(format!("/cluster/v1/services/{}/snapshot", Uuid::new_v4()))
            .body(Body::empty())
            .unwrap();
        let reply: SnapshotReply = body_json(router.oneshot(req).await.unwrap()).await;
        assert_eq!(reply.snapshot, None);
    }

    #[tokio::test]
    async fn list_services_returns_cache() {
        let prop = propagator();
        prop.apply(ServicePacket {
            kind: PublishKind::Register,
            origin: "node-a".into(),
            snapshot: snapshot("node-a"),
        });
        let router = cluster_router(prop);

        let req = Request::builder()
            .uri("/cluster/v1/services")
            .body(Body::empty())
            .unwrap();
        let list: Vec<ServiceSnapshot> = body_json(router.oneshot(req).await.unwrap()).await;
        assert_eq!(list.len(), 1);
    }
}

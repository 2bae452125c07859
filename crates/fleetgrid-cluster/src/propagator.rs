//! ClusterPropagator — broadcasts local snapshot changes and applies
//! remote ones.
//!
//! Each peer gets its own outbound queue drained by a dedicated task, so
//! packets reach a given peer in publish order. There is no ordering
//! across peers; receivers resolve that with snapshot sequences.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use fleetgrid_state::{ApplyOutcome, Origin, PublishKind, ServiceSnapshot, SnapshotCache};
use fleetgrid_task::{AsyncTask, CountingTask};

use crate::packet::ServicePacket;
use crate::peer::PeerChannel;

/// Bound on force-refresh queries.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Live view of the services this node owns.
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    /// Freshly sampled snapshot of a local service, `None` if the
    /// service is not owned by this node.
    async fn live_snapshot(&self, unique_id: Uuid) -> Option<ServiceSnapshot>;
}

struct Outbound {
    packet: Arc<ServicePacket>,
    ack: CountingTask<usize>,
}

struct PeerLink {
    channel: Arc<dyn PeerChannel>,
    queue: mpsc::UnboundedSender<Outbound>,
}

pub struct ClusterPropagator {
    node_name: String,
    cache: Arc<SnapshotCache>,
    peers: DashMap<String, PeerLink>,
    source: RwLock<Option<Weak<dyn SnapshotSource>>>,
    query_timeout: Duration,
}

impl ClusterPropagator {
    pub fn new(node_name: impl Into<String>, cache: Arc<SnapshotCache>) -> Self {
        Self {
            node_name: node_name.into(),
            cache,
            peers: DashMap::new(),
            source: RwLock::new(None),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Attach the owner of local services. Held weakly: the source
    /// usually owns this propagator.
    pub fn set_source(&self, source: Weak<dyn SnapshotSource>) {
        *self.source.write() = Some(source);
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    fn source(&self) -> Option<Arc<dyn SnapshotSource>> {
        self.source.read().as_ref().and_then(Weak::upgrade)
    }

    // ── Peers ──────────────────────────────────────────────────────

    /// Connect a peer, queue every local snapshot to it as REGISTER and
    /// pull the snapshots the peer owns from its cache. Replaces an
    /// existing peer of the same name. Must be called from within a tokio
    /// runtime.
    ///
    /// The returned task completes once the push has been answered and
    /// the pull has finished; its value is the number of snapshots pushed.
    pub fn add_peer(&self, channel: Arc<dyn PeerChannel>) -> CountingTask<usize> {
        let name = channel.node_name().to_string();
        let (queue, rx) = mpsc::unbounded_channel();
        tokio::spawn(drain_queue(Arc::clone(&channel), rx));

        // The link goes in before the local cache is read, so a publish
        // racing this call is either queued or part of the push.
        let link = PeerLink {
            channel: Arc::clone(&channel),
            queue: queue.clone(),
        };
        if self.peers.insert(name.clone(), link).is_some() {
            debug!(peer = %name, "peer replaced");
        }

        let local = self.cache.by_node(&self.node_name);
        let sync = CountingTask::new(local.len(), local.len() as i64 + 1);
        for snapshot in local {
            let packet = Arc::new(ServicePacket {
                kind: PublishKind::Register,
                origin: self.node_name.clone(),
                snapshot,
            });
            if queue
                .send(Outbound {
                    packet,
                    ack: sync.clone(),
                })
                .is_err()
            {
                sync.count_down();
            }
        }

        tokio::spawn(pull_owned(
            Arc::clone(&self.cache),
            channel,
            self.query_timeout,
            sync.clone(),
        ));
        info!(peer = %name, pushed = sync.payload(), "peer connected");
        sync
    }

    /// Disconnect a peer and evict every snapshot it owned.
    pub fn remove_peer(&self, node_name: &str) -> bool {
        let removed = self.peers.remove(node_name).is_some();
        if removed {
            let evicted = self.cache.evict_node(node_name);
            info!(peer = %node_name, evicted, "peer disconnected");
        }
        removed
    }

    pub fn peer_names(&self) -> Vec<String> {
        self.peers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    // ── Publishing ─────────────────────────────────────────────────

    /// Apply a local change to the cache and send it to every peer.
    ///
    /// The returned task completes once every addressed peer has
    /// answered, successfully or not; its value is the number of peers
    /// addressed. With no peers it is already complete.
    pub fn publish(&self, kind: PublishKind, snapshot: ServiceSnapshot) -> CountingTask<usize> {
        let id = snapshot.unique_id();
        let outcome = self.cache.apply(kind, snapshot.clone(), Origin::Local);

        let packet = Arc::new(ServicePacket {
            kind,
            origin: self.node_name.clone(),
            snapshot,
        });

        let links: Vec<mpsc::UnboundedSender<Outbound>> =
            self.peers.iter().map(|e| e.value().queue.clone()).collect();
        let ack = CountingTask::new(links.len(), links.len() as i64);
        for queue in links {
            let outbound = Outbound {
                packet: Arc::clone(&packet),
                ack: ack.clone(),
            };
            if queue.send(outbound).is_err() {
                // Worker gone; count it as answered.
                ack.count_down();
            }
        }

        debug!(%id, %kind, ?outcome, peers = ack.payload(), "snapshot published");
        ack
    }

    /// Apply a packet received from a peer. Packets this node published
    /// itself are ignored and yield `None`.
    pub fn apply(&self, packet: ServicePacket) -> Option<ApplyOutcome> {
        if packet.origin == self.node_name {
            debug!(id = %packet.snapshot.unique_id(), "ignoring own packet");
            return None;
        }
        let origin = Origin::Remote(packet.origin);
        let outcome = self.cache.apply(packet.kind, packet.snapshot, origin);
        Some(outcome)
    }

    // ── Queries ────────────────────────────────────────────────────

    /// Live snapshot of a service owned by this node.
    pub async fn local_live_snapshot(&self, unique_id: Uuid) -> Option<ServiceSnapshot> {
        match self.source() {
            Some(source) => source.live_snapshot(unique_id).await,
            None => None,
        }
    }

    /// Fetch the live snapshot of a service from its owner, bypassing the
    /// cache. The cache is updated when a snapshot comes back; the task
    /// yields `None` when the owner is unknown, unreachable or does not
    /// answer within the query timeout.
    pub fn force_refresh(self: &Arc<Self>, unique_id: Uuid) -> AsyncTask<Option<ServiceSnapshot>> {
        let task = AsyncTask::new();
        let result = task.clone();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let snapshot = this.query_owner(unique_id).await;
            result.complete(snapshot);
        });
        task
    }

    /// [`force_refresh`](Self::force_refresh) waited with the query
    /// timeout.
    pub async fn refresh_snapshot(self: &Arc<Self>, unique_id: Uuid) -> Option<ServiceSnapshot> {
        self.force_refresh(unique_id)
            .wait_or(self.query_timeout, None)
            .await
    }

    async fn query_owner(&self, unique_id: Uuid) -> Option<ServiceSnapshot> {
        if let Some(live) = self.local_live_snapshot(unique_id).await {
            return Some(live);
        }

        let owner = self.cache.get(&unique_id)?.node_name().to_string();
        if owner == self.node_name {
            return None;
        }
        let Some(channel) = self.peers.get(&owner).map(|e| Arc::clone(&e.value().channel)) else {
            debug!(%unique_id, %owner, "owner is not a connected peer");
            return None;
        };

        match tokio::time::timeout(self.query_timeout, channel.query_snapshot(unique_id)).await {
            Ok(Ok(Some(snapshot))) => {
                self.cache
                    .upsert(PublishKind::Update, snapshot.clone(), Origin::Remote(owner));
                Some(snapshot)
            }
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                warn!(%unique_id, %owner, error = %e, "force refresh failed");
                None
            }
            Err(_) => {
                warn!(%unique_id, %owner, "force refresh timed out");
                None
            }
        }
    }
}

/// Take over every snapshot the peer reports as its own.
async fn pull_owned(
    cache: Arc<SnapshotCache>,
    channel: Arc<dyn PeerChannel>,
    timeout: Duration,
    done: CountingTask<usize>,
) {
    let peer = channel.node_name().to_string();
    match tokio::time::timeout(timeout, channel.list_services()).await {
        Ok(Ok(snapshots)) => {
            let mut pulled = 0usize;
            for snapshot in snapshots.into_iter().filter(|s| s.node_name() == peer) {
                let outcome = cache.upsert(PublishKind::Register, snapshot, Origin::Remote(peer.clone()));
                if outcome.changed() {
                    pulled += 1;
                }
            }
            debug!(%peer, pulled, "peer snapshots pulled");
        }
        Ok(Err(e)) => warn!(%peer, error = %e, "listing peer services failed"),
        Err(_) => warn!(%peer, "listing peer services timed out"),
    }
    done.count_down();
}

async fn drain_queue(channel: Arc<dyn PeerChannel>, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(Outbound { packet, ack }) = rx.recv().await {
        if let Err(e) = channel.publish(&packet).await {
            warn!(
                peer = %channel.node_name(),
                id = %packet.snapshot.unique_id(),
                kind = %packet.kind,
                error = %e,
                "packet delivery failed"
            );
        }
        ack.count_down();
    }
    debug!(peer = %channel.node_name(), "peer queue closed");
}

//! fleetgrid-cluster — keeps every node's snapshot cache in sync.
//!
//! Each node runs one [`ClusterPropagator`]. Local lifecycle transitions
//! are published through it: the change is applied to the local
//! [`SnapshotCache`](fleetgrid_state::SnapshotCache) and sent as a
//! [`ServicePacket`] to every connected peer. Peers apply incoming
//! packets to their own cache.
//!
//! # Transport
//!
//! Peers talk HTTP/1.1 with JSON bodies:
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/cluster/v1/packets` | Apply a published snapshot change |
//! | GET | `/cluster/v1/services` | List the receiving node's cache |
//! | GET | `/cluster/v1/services/{unique_id}/snapshot` | Live snapshot of a service owned by the receiving node |
//!
//! [`HttpPeer`] is the client side, [`cluster_router`] the server side.
//! When a peer connects, its cache is listed once and the snapshots it
//! owns are taken over, so a node that boots late still learns about
//! services created before it came up.
//! Anything implementing [`PeerChannel`] can stand in for HTTP.

pub mod error;
pub mod packet;
pub mod peer;
pub mod propagator;
pub mod server;
pub mod transport;

pub use error::{ClusterError, ClusterResult};
pub use packet::{PacketAck, ServicePacket, SnapshotReply};
pub use peer::{HttpPeer, PeerChannel};
pub use propagator::{ClusterPropagator, SnapshotSource, DEFAULT_QUERY_TIMEOUT};
pub use server::cluster_router;
pub use transport::{TransportError, send_request};

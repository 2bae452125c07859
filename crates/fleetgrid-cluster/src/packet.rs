//! Wire messages exchanged between nodes.

use serde::{Deserialize, Serialize};

use fleetgrid_state::{PublishKind, ServiceSnapshot};

/// A published snapshot change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServicePacket {
    pub kind: PublishKind,
    /// Name of the node that published the change.
    pub origin: String,
    pub snapshot: ServiceSnapshot,
}

/// Answer to `POST /cluster/v1/packets`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PacketAck {
    /// Whether the packet changed the receiver's cache.
    pub applied: bool,
}

/// Answer to a force-refresh query. `snapshot` is `null` when the
/// receiving node does not own the service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotReply {
    pub snapshot: Option<ServiceSnapshot>,
}

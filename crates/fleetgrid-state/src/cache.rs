//! SnapshotCache — latest snapshot of every service in the cluster.
//!
//! Local transitions and peer packets both land here. Updates are ordered
//! per service by [`ServiceSnapshot::sequence`]: an older snapshot never
//! replaces a newer one, and a removed service cannot be revived by a
//! late packet carrying an older sequence. Removal records expire after
//! [`TOMBSTONE_TTL`].

use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::types::{PublishKind, ServiceSnapshot};

const EVENT_CAPACITY: usize = 256;

/// How long a removal record blocks late packets for its service.
pub const TOMBSTONE_TTL: Duration = Duration::from_secs(600);

/// Removal record: highest removed sequence and when it was written.
#[derive(Debug, Clone, Copy)]
struct Tombstone {
    sequence: u64,
    buried_at: Instant,
}

/// Where a cache change came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Local,
    /// A peer node, by name.
    Remote(String),
}

/// Emitted to subscribers for every change that altered the cache.
#[derive(Debug, Clone)]
pub struct RegistryEvent {
    pub kind: PublishKind,
    pub snapshot: ServiceSnapshot,
    pub origin: Origin,
}

/// Result of applying a change to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    Updated,
    /// Identical to the cached snapshot; nothing changed.
    Unchanged,
    /// Older than the cached snapshot or the removal record.
    Stale,
    Removed,
    /// Removal of an id the cache never held.
    Missing,
}

impl ApplyOutcome {
    pub fn changed(self) -> bool {
        matches!(self, Self::Inserted | Self::Updated | Self::Removed)
    }
}

pub struct SnapshotCache {
    entries: DashMap<Uuid, ServiceSnapshot>,
    tombstones: DashMap<Uuid, Tombstone>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotCache {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: DashMap::new(),
            tombstones: DashMap::new(),
            events,
        }
    }

    /// Apply a change of the given kind. `Unregister` removes, every
    /// other kind inserts or replaces.
    pub fn apply(&self, kind: PublishKind, snapshot: ServiceSnapshot, origin: Origin) -> ApplyOutcome {
        match kind {
            PublishKind::Unregister => self.remove(snapshot, origin),
            _ => self.upsert(kind, snapshot, origin),
        }
    }

    /// Insert or replace a snapshot unless a newer one is already known.
    pub fn upsert(&self, kind: PublishKind, snapshot: ServiceSnapshot, origin: Origin) -> ApplyOutcome {
        let id = snapshot.unique_id();
        let outcome = match self.entries.entry(id) {
            Entry::Occupied(mut cached) => {
                if snapshot.sequence < cached.get().sequence {
                    ApplyOutcome::Stale
                } else if *cached.get() == snapshot {
                    ApplyOutcome::Unchanged
                } else {
                    cached.insert(snapshot.clone());
                    ApplyOutcome::Updated
                }
            }
            Entry::Vacant(slot) => {
                let buried = self
                    .tombstones
                    .get(&id)
                    .is_some_and(|t| snapshot.sequence <= t.sequence);
                if buried {
                    ApplyOutcome::Stale
                } else {
                    slot.insert(snapshot.clone());
                    ApplyOutcome::Inserted
                }
            }
        };

        trace!(%id, %kind, ?outcome, ?origin, "cache upsert");
        if outcome.changed() {
            self.emit(kind, snapshot, origin);
        }
        outcome
    }

    /// Remove a service, remembering the removal so that older packets
    /// cannot bring it back.
    pub fn remove(&self, snapshot: ServiceSnapshot, origin: Origin) -> ApplyOutcome {
        let id = snapshot.unique_id();
        let outcome = match self.entries.entry(id) {
            Entry::Occupied(cached) => {
                if snapshot.sequence < cached.get().sequence {
                    ApplyOutcome::Stale
                } else {
                    self.bury(id, snapshot.sequence);
                    cached.remove();
                    ApplyOutcome::Removed
                }
            }
            Entry::Vacant(_) => {
                self.bury(id, snapshot.sequence);
                ApplyOutcome::Missing
            }
        };

        debug!(%id, ?outcome, ?origin, "cache remove");
        if outcome.changed() {
            self.emit(PublishKind::Unregister, snapshot, origin);
        }
        outcome
    }

    /// Drop every snapshot owned by `node_name`. Returns how many were
    /// evicted. Used when a peer leaves.
    ///
    /// No removal record is kept: the services still exist on their
    /// node, and its snapshots must be accepted again when it
    /// reconnects.
    pub fn evict_node(&self, node_name: &str) -> usize {
        let owned: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|e| e.value().node_name() == node_name)
            .map(|e| *e.key())
            .collect();

        let origin = Origin::Remote(node_name.to_string());
        let mut evicted = 0;
        for id in owned {
            if let Some((_, snapshot)) = self.entries.remove_if(&id, |_, s| s.node_name() == node_name) {
                evicted += 1;
                self.emit(PublishKind::Unregister, snapshot, origin.clone());
            }
        }
        debug!(node = %node_name, evicted, "node evicted from cache");
        evicted
    }

    fn bury(&self, id: Uuid, sequence: u64) {
        let now = Instant::now();
        self.tombstones
            .entry(id)
            .and_modify(|t| {
                t.sequence = t.sequence.max(sequence);
                t.buried_at = now;
            })
            .or_insert(Tombstone {
                sequence,
                buried_at: now,
            });
    }

    /// Forget removal records older than `max_age`. Returns how many
    /// were dropped.
    pub fn prune_tombstones(&self, max_age: Duration) -> usize {
        let before = self.tombstones.len();
        self.tombstones.retain(|_, t| t.buried_at.elapsed() < max_age);
        let pruned = before.saturating_sub(self.tombstones.len());
        if pruned > 0 {
            debug!(pruned, "tombstones pruned");
        }
        pruned
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    fn emit(&self, kind: PublishKind, snapshot: ServiceSnapshot, origin: Origin) {
        // No subscribers is fine.
        let _ = self.events.send(RegistryEvent {
            kind,
            snapshot,
            origin,
        });
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn get(&self, id: &Uuid) -> Option<ServiceSnapshot> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.entries.contains_key(id)
    }

    pub fn list(&self) -> Vec<ServiceSnapshot> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    pub fn by_name(&self, name: &str) -> Option<ServiceSnapshot> {
        self.entries
            .iter()
            .find(|e| e.value().name() == name)
            .map(|e| e.value().clone())
    }

    pub fn by_task(&self, task_name: &str) -> Vec<ServiceSnapshot> {
        self.filter(|s| s.service_id().task_name == task_name)
    }

    pub fn by_node(&self, node_name: &str) -> Vec<ServiceSnapshot> {
        self.filter(|s| s.node_name() == node_name)
    }

    pub fn by_environment(&self, environment: &str) -> Vec<ServiceSnapshot> {
        self.filter(|s| s.service_id().environment == environment)
    }

    fn filter(&self, predicate: impl Fn(&ServiceSnapshot) -> bool) -> Vec<ServiceSnapshot> {
        self.entries
            .iter()
            .filter(|e| predicate(e.value()))
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Subscribe to cache changes. Slow subscribers lose the oldest
    /// events (`RecvError::Lagged`).
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }
}

//! fleetgrid-state — service snapshots and the registries that hold them.
//!
//! # Architecture
//!
//! A [`ServiceSnapshot`] is an immutable value describing one service at
//! one point in its lifecycle. Every node keeps:
//!
//! - a [`SnapshotCache`] with the latest snapshot of every service known
//!   cluster-wide, updated by local transitions and by peer packets;
//! - a [`ServiceRegistry`] pairing that cache with the live service
//!   objects owned by this node;
//! - a [`StateStore`] (redb) persisting the latest snapshot of each local
//!   service, so leftovers of a crashed run can be found at boot.
//!
//! The cache and registry are `Send + Sync` and shared by `Arc`.

pub mod cache;
pub mod error;
pub mod registry;
pub mod store;
pub mod tables;
pub mod types;

pub use cache::{ApplyOutcome, Origin, RegistryEvent, SnapshotCache, TOMBSTONE_TTL};
pub use error::{StateError, StateResult};
pub use registry::{LocalService, ServiceRegistry};
pub use store::StateStore;
pub use types::*;

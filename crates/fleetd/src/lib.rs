//! fleetd — one node of a fleetgrid service fleet.
//!
//! [`Node`] assembles the subsystems:
//! - State store (redb), pruned at boot
//! - Service manager with admission control and the process monitor
//! - Cluster propagator and its HTTP listener
//! - Retry worker for starts deferred by admission control

pub mod node;

pub use node::{Node, open_store, run};

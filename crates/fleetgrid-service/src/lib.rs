//! fleetgrid-service — local service lifecycle for a fleetgrid node.
//!
//! [`ServiceManager`] is the entry point. It creates
//! [`ManagedService`]s, each an explicit state machine
//! (`DEFINED → PREPARED → RUNNING → STOPPED → DELETED`) that stages its
//! working directory, passes [`AdmissionControl`] before starting, runs
//! its process and publishes a snapshot on every transition through the
//! node's cluster propagator.
//!
//! Collaborators are bundled in a [`NodeContext`] shared by `Arc`;
//! transitions are customized through a [`LifecycleHandler`].

pub mod admission;
pub mod config;
pub mod context;
pub mod error;
pub mod handler;
pub mod manager;
pub mod process;
pub mod service;
pub mod staging;

pub use admission::{AdmissionControl, AdmissionDenial, CpuProbe, StaticCpuProbe, SystemCpuProbe};
pub use config::{BlockedStartPolicy, NodeConfig, PeerConfig, ServiceRequest, SslConfig};
pub use context::NodeContext;
pub use error::{ServiceError, ServiceResult};
pub use handler::{DefaultHandler, LifecycleHandler};
pub use manager::ServiceManager;
pub use service::{
    DeleteOutcome, ManagedService, PrepareOutcome, RefreshOutcome, StartOutcome, StopOutcome,
};

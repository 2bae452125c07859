//! fleetgrid-task — deferred values shared across threads and nodes.
//!
//! Every cross-node query and multi-step orchestration in fleetgrid is
//! expressed as an [`AsyncTask`]: a cloneable handle to a value that is
//! produced later, can be cancelled, and notifies registered listeners
//! exactly once.
//!
//! # Waiting
//!
//! Suspension is explicit at the call site:
//!
//! - `wait*` methods are `async` and never block a runtime thread.
//! - `blocking_get*` methods park the calling OS thread. They are meant for
//!   dedicated worker threads (for example inside `spawn_blocking`) and must
//!   not be called from a thread that drives network I/O.
//!
//! # Joining
//!
//! [`CountingTask`] completes with a fixed payload once a number of
//! independent signals have arrived, which is how a broadcast waits for
//! the acknowledgement of every peer node.

pub mod counting;
pub mod error;
pub mod task;

pub use counting::CountingTask;
pub use error::{TaskError, TaskResult};
pub use task::{AsyncTask, TaskOutcome};

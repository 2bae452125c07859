//! redb table definitions for the fleetgrid state store.
//!
//! Keys are service unique ids in hyphenated form; values are
//! JSON-serialized [`ServiceSnapshot`](crate::types::ServiceSnapshot)s.

use redb::TableDefinition;

/// Latest snapshot of every service owned by this node.
pub const SNAPSHOTS: TableDefinition<&str, &[u8]> = TableDefinition::new("snapshots");

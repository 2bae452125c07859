//! Domain types shared by every fleetgrid crate.
//!
//! All types serialize to JSON: they travel between nodes in cluster
//! packets and are stored in redb value columns.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Free-form JSON property bag attached to services.
pub type Properties = serde_json::Map<String, serde_json::Value>;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ── Identity ───────────────────────────────────────────────────────

/// Immutable identity of a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ServiceId {
    pub unique_id: Uuid,
    pub task_name: String,
    pub task_service_id: u32,
    /// `{task_name}-{task_service_id}`.
    pub name: String,
    /// Node that owns the service process.
    pub node_name: String,
    /// Opaque environment type tag.
    pub environment: String,
}

impl ServiceId {
    pub fn new(
        task_name: impl Into<String>,
        task_service_id: u32,
        node_name: impl Into<String>,
        environment: impl Into<String>,
    ) -> Self {
        let task_name = task_name.into();
        Self {
            unique_id: Uuid::new_v4(),
            name: format!("{task_name}-{task_service_id}"),
            task_name,
            task_service_id,
            node_name: node_name.into(),
            environment: environment.into(),
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

// ── Configuration ──────────────────────────────────────────────────

/// Immutable launch description of a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfiguration {
    pub service_id: ServiceId,
    /// Static services keep their working directory forever.
    #[serde(default)]
    pub static_service: bool,
    #[serde(default)]
    pub auto_delete_on_stop: bool,
    pub port: u16,
    /// Configured heap ceiling in megabytes.
    pub max_heap_memory: u64,
    #[serde(default)]
    pub process: ProcessConfiguration,
    #[serde(default)]
    pub templates: Vec<ServiceTemplate>,
    #[serde(default)]
    pub inclusions: Vec<ServiceRemoteInclusion>,
    #[serde(default)]
    pub deployments: Vec<ServiceDeployment>,
    /// Relative paths removed from the working directory after each stop.
    #[serde(default)]
    pub deleted_files_after_stop: Vec<String>,
    #[serde(default)]
    pub properties: Properties,
}

impl ServiceConfiguration {
    /// Minimal configuration running `command` with no staging.
    pub fn new(service_id: ServiceId, port: u16, max_heap_memory: u64, command: Vec<String>) -> Self {
        Self {
            service_id,
            static_service: false,
            auto_delete_on_stop: false,
            port,
            max_heap_memory,
            process: ProcessConfiguration {
                command,
                environment: BTreeMap::new(),
            },
            templates: Vec::new(),
            inclusions: Vec::new(),
            deployments: Vec::new(),
            deleted_files_after_stop: Vec::new(),
            properties: Properties::new(),
        }
    }
}

/// How the service process is launched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessConfiguration {
    /// Program followed by its arguments.
    pub command: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

/// A template copied into the working directory before start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceTemplate {
    pub prefix: String,
    pub name: String,
    #[serde(default = "default_storage")]
    pub storage: String,
    #[serde(default)]
    pub always_copy_to_static_services: bool,
}

fn default_storage() -> String {
    "local".to_string()
}

impl ServiceTemplate {
    pub fn new(prefix: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            name: name.into(),
            storage: default_storage(),
            always_copy_to_static_services: false,
        }
    }

    /// Relative location inside the template storage: `{prefix}/{name}`.
    pub fn path(&self) -> String {
        format!("{}/{}", self.prefix, self.name)
    }
}

impl fmt::Display for ServiceTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.storage, self.prefix, self.name)
    }
}

/// A remote file fetched into the working directory before start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceRemoteInclusion {
    /// `http://` or `file://` URL.
    pub url: String,
    /// Path relative to the working directory.
    pub destination: String,
}

/// Copies the working directory back into a template on delete.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceDeployment {
    pub template: ServiceTemplate,
    /// Relative paths that are not copied back.
    #[serde(default)]
    pub excludes: Vec<String>,
}

// ── Runtime state ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct HostAndPort {
    pub host: String,
    pub port: u16,
}

impl HostAndPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Resource sample of the service process.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProcessSnapshot {
    /// `None` while no process is alive.
    pub pid: Option<u32>,
    /// Percent of one core.
    pub cpu_usage: f32,
    pub memory_bytes: u64,
    /// Configured heap ceiling in megabytes.
    pub max_heap_memory: u64,
}

impl ProcessSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pid.is_none()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Defined,
    Prepared,
    Running,
    Stopped,
    Deleted,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Defined => "DEFINED",
            Self::Prepared => "PREPARED",
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
            Self::Deleted => "DELETED",
        };
        f.write_str(s)
    }
}

/// Kind of a published snapshot change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PublishKind {
    Register,
    Update,
    Started,
    Stopped,
    Unregister,
}

impl fmt::Display for PublishKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Register => "REGISTER",
            Self::Update => "UPDATE",
            Self::Started => "STARTED",
            Self::Stopped => "STOPPED",
            Self::Unregister => "UNREGISTER",
        };
        f.write_str(s)
    }
}

/// Immutable view of a service at one point of its lifecycle.
///
/// A new snapshot is built on every transition; `sequence` increases
/// with each snapshot of the same service and orders them across nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSnapshot {
    /// Milliseconds since the Unix epoch.
    pub creation_time: u64,
    pub sequence: u64,
    pub address: HostAndPort,
    pub connect_address: HostAndPort,
    pub lifecycle: LifecycleState,
    pub process: ProcessSnapshot,
    #[serde(default)]
    pub properties: Properties,
    pub configuration: ServiceConfiguration,
}

impl ServiceSnapshot {
    pub fn service_id(&self) -> &ServiceId {
        &self.configuration.service_id
    }

    pub fn unique_id(&self) -> Uuid {
        self.configuration.service_id.unique_id
    }

    pub fn name(&self) -> &str {
        &self.configuration.service_id.name
    }

    pub fn node_name(&self) -> &str {
        &self.configuration.service_id.node_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_id_name_is_task_and_index() {
        let id = ServiceId::new("Lobby", 3, "node-1", "JAVA_SERVER");
        assert_eq!(id.name, "Lobby-3");
        assert_eq!(id.to_string(), "Lobby-3");
        assert_ne!(id.unique_id, ServiceId::new("Lobby", 3, "node-1", "JAVA_SERVER").unique_id);
    }

    #[test]
    fn lifecycle_wire_form_is_upper_case() {
        let json = serde_json::to_string(&LifecycleState::Prepared).unwrap();
        assert_eq!(json, "\"PREPARED\"");
        let kind: PublishKind = serde_json::from_str("\"UNREGISTER\"").unwrap();
        assert_eq!(kind, PublishKind::Unregister);
    }

    #[test]
    fn configuration_defaults_fill_missing_fields() {
        let id = ServiceId::new("Proxy", 1, "node-1", "PROXY");
        let json = serde_json::json!({
            "service_id": id,
            "port": 25565,
            "max_heap_memory": 256,
        });
        let config: ServiceConfiguration = serde_json::from_value(json).unwrap();
        assert!(!config.static_service);
        assert!(config.templates.is_empty());
        assert!(config.process.command.is_empty());
        assert!(config.properties.is_empty());
    }

    #[test]
    fn template_defaults_to_local_storage() {
        let template: ServiceTemplate =
            serde_json::from_str(r#"{"prefix":"Lobby","name":"default"}"#).unwrap();
        assert_eq!(template.storage, "local");
        assert_eq!(template.path(), "Lobby/default");
        assert_eq!(template.to_string(), "local:Lobby/default");
    }

    #[test]
    fn empty_process_snapshot_has_no_pid() {
        assert!(ProcessSnapshot::empty().is_empty());
        let live = ProcessSnapshot {
            pid: Some(42),
            ..ProcessSnapshot::empty()
        };
        assert!(!live.is_empty());
    }
}

//! Node configuration (`fleetd.toml`).
//!
//! Every field has a default, so an empty file is a valid single-node
//! configuration. Durations are written as `"500ms"`, `"5s"` or `"2m"`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fleetgrid_state::{
    Properties, ServiceDeployment, ServiceRemoteInclusion, ServiceTemplate,
};

use crate::error::{ServiceError, ServiceResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Unique name of this node in the cluster.
    pub node_name: String,
    /// Address services bind to.
    pub host_address: String,
    /// Address clients use to reach services.
    pub connect_host_address: String,
    /// `host:port` of the cluster listener.
    pub cluster_listen: String,
    /// Heap budget for RUNNING services, in megabytes.
    pub max_memory: u64,
    /// Starts are refused while system CPU usage is at or above this
    /// percentage.
    pub max_cpu_usage: f32,
    /// When false, starts are serialized node-wide.
    pub parallel_start: bool,
    pub blocked_start_policy: BlockedStartPolicy,
    pub retry_delay: String,
    pub stop_timeout: String,
    pub monitor_interval: String,
    pub query_timeout: String,
    /// Working directories of ephemeral services.
    pub temp_dir: PathBuf,
    /// Working directories of static services.
    pub persistent_dir: PathBuf,
    /// Local template storage.
    pub template_dir: PathBuf,
    /// redb file for the state store.
    pub state_path: PathBuf,
    pub ssl: SslConfig,
    pub peers: Vec<PeerConfig>,
    /// Services started at boot.
    pub services: Vec<ServiceRequest>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: "node-1".to_string(),
            host_address: "127.0.0.1".to_string(),
            connect_host_address: "127.0.0.1".to_string(),
            cluster_listen: "127.0.0.1:1420".to_string(),
            max_memory: 2048,
            max_cpu_usage: 100.0,
            parallel_start: false,
            blocked_start_policy: BlockedStartPolicy::RetryLater,
            retry_delay: "30s".to_string(),
            stop_timeout: "10s".to_string(),
            monitor_interval: "5s".to_string(),
            query_timeout: "5s".to_string(),
            temp_dir: PathBuf::from("temp/services"),
            persistent_dir: PathBuf::from("local/services"),
            template_dir: PathBuf::from("local/templates"),
            state_path: PathBuf::from("local/state.redb"),
            ssl: SslConfig::default(),
            peers: Vec::new(),
            services: Vec::new(),
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> ServiceResult<Self> {
        let content = std::fs::read_to_string(path).map_err(crate::error::io_err(path))?;
        let config = Self::from_toml(&content)?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> ServiceResult<Self> {
        let config: NodeConfig =
            toml::from_str(content).map_err(|e| ServiceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the node misbehave silently.
    pub fn validate(&self) -> ServiceResult<()> {
        if self.node_name.trim().is_empty() {
            return Err(ServiceError::Config("node_name must not be empty".into()));
        }
        for (field, value) in [
            ("retry_delay", &self.retry_delay),
            ("stop_timeout", &self.stop_timeout),
            ("monitor_interval", &self.monitor_interval),
            ("query_timeout", &self.query_timeout),
        ] {
            if parse_duration(value).is_none() {
                return Err(ServiceError::Config(format!("{field}: invalid duration {value:?}")));
            }
        }
        if let Some(peer) = self.peers.iter().find(|p| p.node_name == self.node_name) {
            return Err(ServiceError::Config(format!(
                "peer {} has this node's own name",
                peer.node_name
            )));
        }
        if let Some(request) = self.services.iter().find(|s| s.command.is_empty()) {
            return Err(ServiceError::Config(format!(
                "service {} has no command",
                request.task_name
            )));
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        parse_duration(&self.retry_delay).unwrap_or(Duration::from_secs(30))
    }

    pub fn stop_timeout(&self) -> Duration {
        parse_duration(&self.stop_timeout).unwrap_or(Duration::from_secs(10))
    }

    pub fn monitor_interval(&self) -> Duration {
        parse_duration(&self.monitor_interval).unwrap_or(Duration::from_secs(5))
    }

    pub fn query_timeout(&self) -> Duration {
        parse_duration(&self.query_timeout).unwrap_or(Duration::from_secs(5))
    }
}

/// What to do with a start refused by admission control.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BlockedStartPolicy {
    /// Queue the start and try again after `retry_delay`.
    RetryLater,
    /// Drop the start with a warning.
    Reject,
}

/// TLS material copied into every service's `.wrapper` directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SslConfig {
    pub enabled: bool,
    pub certificate_path: Option<PathBuf>,
    pub private_key_path: Option<PathBuf>,
    pub trust_certificate_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerConfig {
    pub node_name: String,
    /// `host:port` of the peer's cluster listener.
    pub address: String,
}

/// A request to create one service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceRequest {
    pub task_name: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    pub port: u16,
    /// Megabytes.
    pub max_heap_memory: u64,
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub static_service: bool,
    #[serde(default)]
    pub auto_delete_on_stop: bool,
    #[serde(default)]
    pub templates: Vec<ServiceTemplate>,
    #[serde(default)]
    pub inclusions: Vec<ServiceRemoteInclusion>,
    #[serde(default)]
    pub deployments: Vec<ServiceDeployment>,
    #[serde(default)]
    pub deleted_files_after_stop: Vec<String>,
    #[serde(default)]
    pub properties: Properties,
    /// Fixed index within the task; allocated when absent.
    #[serde(default)]
    pub task_service_id: Option<u32>,
}

fn default_environment() -> String {
    "PROCESS".to_string()
}

impl ServiceRequest {
    pub fn new(task_name: impl Into<String>, port: u16, max_heap_memory: u64, command: Vec<String>) -> Self {
        Self {
            task_name: task_name.into(),
            environment: default_environment(),
            port,
            max_heap_memory,
            command,
            env: BTreeMap::new(),
            static_service: false,
            auto_delete_on_stop: false,
            templates: Vec::new(),
            inclusions: Vec::new(),
            deployments: Vec::new(),
            deleted_files_after_stop: Vec::new(),
            properties: Properties::new(),
            task_service_id: None,
        }
    }
}

/// Parse a duration string like "5s", "500ms", "1m".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_valid() {
        let config = NodeConfig::from_toml("").unwrap();
        assert_eq!(config.node_name, "node-1");
        assert_eq!(config.blocked_start_policy, BlockedStartPolicy::RetryLater);
        assert_eq!(config.stop_timeout(), Duration::from_secs(10));
        assert!(!config.parallel_start);
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
node_name = "node-a"
max_memory = 1024
max_cpu_usage = 90.0
parallel_start = true
blocked_start_policy = "reject"
retry_delay = "500ms"

[ssl]
enabled = true
certificate_path = "/etc/fleet/cert.pem"

[[peers]]
node_name = "node-b"
address = "10.0.0.2:1420"

[[services]]
task_name = "Lobby"
port = 30001
max_heap_memory = 512
command = ["sleep", "30"]
static_service = true

[[services.templates]]
prefix = "Lobby"
name = "default"
"#;
        let config = NodeConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.node_name, "node-a");
        assert_eq!(config.max_memory, 1024);
        assert_eq!(config.blocked_start_policy, BlockedStartPolicy::Reject);
        assert_eq!(config.retry_delay(), Duration::from_millis(500));
        assert!(config.ssl.enabled);
        assert_eq!(config.peers[0].address, "10.0.0.2:1420");

        let lobby = &config.services[0];
        assert_eq!(lobby.environment, "PROCESS");
        assert!(lobby.static_service);
        assert_eq!(lobby.templates[0].storage, "local");
    }

    #[test]
    fn invalid_duration_is_rejected() {
        let err = NodeConfig::from_toml("stop_timeout = \"soon\"").unwrap_err();
        assert!(err.to_string().contains("stop_timeout"));
    }

    #[test]
    fn self_peer_is_rejected() {
        let toml_str = r#"
node_name = "node-a"
[[peers]]
node_name = "node-a"
address = "127.0.0.1:1"
"#;
        assert!(NodeConfig::from_toml(toml_str).is_err());
    }

    #[test]
    fn service_without_command_is_rejected() {
        let toml_str = r#"
[[services]]
task_name = "Lobby"
port = 1
max_heap_memory = 1
command = []
"#;
        assert!(NodeConfig::from_toml(toml_str).is_err());
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration(" 5s "), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("5"), None);
        assert_eq!(parse_duration("xs"), None);
    }
}

//! Node assembly — wires the state store, service manager, cluster
//! listener and background loops of one fleetgrid node.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use fleetgrid_cluster::{HttpPeer, cluster_router};
use fleetgrid_service::{DefaultHandler, NodeConfig, PeerConfig, ServiceManager, SystemCpuProbe};
use fleetgrid_state::StateStore;
use fleetgrid_task::CountingTask;

/// Open the redb state store at `state_path`, creating parent
/// directories as needed.
pub fn open_store(config: &NodeConfig) -> anyhow::Result<StateStore> {
    if let Some(parent) = config.state_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let store = StateStore::open(&config.state_path)?;
    info!(path = ?config.state_path, "state store opened");
    Ok(store)
}

/// A running node. Dropping it without [`Node::shutdown`] leaves the
/// background tasks running until the runtime stops.
pub struct Node {
    manager: Arc<ServiceManager>,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Start serving cluster traffic on `listener` and connect to every
    /// configured peer. Configured services are not started here.
    pub async fn start(config: NodeConfig, store: StateStore, listener: TcpListener) -> anyhow::Result<Self> {
        for snapshot in store.prune()? {
            warn!(
                service = %snapshot.service_id(),
                unique_id = %snapshot.unique_id(),
                lifecycle = %snapshot.lifecycle,
                "pruned snapshot left by a previous run"
            );
        }

        let node_name = config.node_name.clone();
        let peers = config.peers.clone();
        let manager = ServiceManager::new(
            config,
            store,
            Arc::new(DefaultHandler),
            Arc::new(SystemCpuProbe::new()),
        );

        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // ── Cluster listener ───────────────────────────────────────
        let router = cluster_router(Arc::clone(manager.propagator()));
        let mut server_shutdown = shutdown_rx.clone();
        let server = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = server_shutdown.changed().await;
                })
                .await;
            if let Err(e) = result {
                error!(error = %e, "cluster listener failed");
            }
        });
        info!(node = %node_name, addr = %local_addr, "cluster listener started");

        // ── Background loops ───────────────────────────────────────
        let monitor = tokio::spawn(Arc::clone(&manager).run_monitor(shutdown_rx.clone()));
        let retry = tokio::spawn(Arc::clone(&manager).run_retry_worker(shutdown_rx));

        let node = Self {
            manager,
            local_addr,
            shutdown_tx,
            tasks: vec![server, monitor, retry],
        };
        for peer in &peers {
            node.connect(peer);
        }
        Ok(node)
    }

    pub fn manager(&self) -> &Arc<ServiceManager> {
        &self.manager
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Add a peer, push every local snapshot to it and pull the ones it
    /// owns.
    pub fn connect(&self, peer: &PeerConfig) -> CountingTask<usize> {
        info!(peer = %peer.node_name, address = %peer.address, "connecting peer");
        let channel = HttpPeer::new(peer.node_name.clone(), peer.address.clone())
            .with_timeout(self.manager.config().query_timeout());
        self.manager.propagator().add_peer(Arc::new(channel))
    }

    /// Delete every local service, then stop the listener and the
    /// background loops.
    pub async fn shutdown(self) {
        info!(services = self.manager.services().len(), "node shutting down");
        self.manager.shutdown_all().await;
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!("node stopped");
    }
}

/// Run a node until Ctrl-C.
pub async fn run(config: NodeConfig) -> anyhow::Result<()> {
    info!(node = %config.node_name, "fleetgrid node starting");
    let store = open_store(&config)?;
    let listener = TcpListener::bind(&config.cluster_listen).await?;
    let node = Node::start(config, store, listener).await?;

    let started = node.manager().start_configured_services().await;
    info!(started, "configured services started");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    node.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(root: &std::path::Path) -> NodeConfig {
        NodeConfig {
            temp_dir: root.join("temp"),
            persistent_dir: root.join("persistent"),
            template_dir: root.join("templates"),
            state_path: root.join("state/nested/node.redb"),
            ..NodeConfig::default()
        }
    }

    #[test]
    fn open_store_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        open_store(&config).unwrap();
        assert!(config.state_path.is_file());
    }

    #[tokio::test]
    async fn start_prunes_leftovers_and_stops_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let store = open_store(&config).unwrap();

        let id = fleetgrid_state::ServiceId::new("Lobby", 1, "node-1", "PROCESS");
        let configuration = fleetgrid_state::ServiceConfiguration::new(id, 30000, 64, vec!["true".into()]);
        let snapshot = fleetgrid_state::ServiceSnapshot {
            creation_time: 0,
            sequence: 3,
            address: fleetgrid_state::HostAndPort::new("127.0.0.1", 30000),
            connect_address: fleetgrid_state::HostAndPort::new("127.0.0.1", 30000),
            lifecycle: fleetgrid_state::LifecycleState::Running,
            process: fleetgrid_state::ProcessSnapshot::empty(),
            properties: Default::default(),
            configuration,
        };
        store.put_snapshot(&snapshot).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let node = Node::start(config, store, listener).await.unwrap();
        assert!(node.manager().context().store.list_snapshots().unwrap().is_empty());
        assert_ne!(node.local_addr().port(), 0);
        node.shutdown().await;
    }
}

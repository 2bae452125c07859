//! Node-wide collaborators shared by every service.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use fleetgrid_cluster::ClusterPropagator;
use fleetgrid_state::{ServiceRegistry, SnapshotCache, StateStore};

use crate::admission::{AdmissionControl, CpuProbe};
use crate::config::NodeConfig;
use crate::handler::LifecycleHandler;
use crate::process::ProcessSampler;
use crate::service::ManagedService;

pub struct NodeContext {
    pub config: NodeConfig,
    pub registry: ServiceRegistry<ManagedService>,
    pub propagator: Arc<ClusterPropagator>,
    pub store: StateStore,
    pub admission: AdmissionControl,
    pub handler: Arc<dyn LifecycleHandler>,
    pub sampler: ProcessSampler,
    /// Serializes starts when `parallel_start` is off.
    pub(crate) start_sequence: Mutex<()>,
    /// Starts deferred by admission control.
    pub(crate) retry_queue: mpsc::UnboundedSender<Uuid>,
}

impl NodeContext {
    pub(crate) fn new(
        config: NodeConfig,
        store: StateStore,
        handler: Arc<dyn LifecycleHandler>,
        cpu: Arc<dyn CpuProbe>,
        retry_queue: mpsc::UnboundedSender<Uuid>,
    ) -> Self {
        let cache = Arc::new(SnapshotCache::new());
        let propagator = Arc::new(
            ClusterPropagator::new(config.node_name.clone(), Arc::clone(&cache))
                .with_query_timeout(config.query_timeout()),
        );
        let admission = AdmissionControl::new(config.max_memory, config.max_cpu_usage, cpu);
        Self {
            registry: ServiceRegistry::new(cache),
            propagator,
            store,
            admission,
            handler,
            sampler: ProcessSampler::new(),
            start_sequence: Mutex::new(()),
            retry_queue,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<SnapshotCache> {
        self.registry.cache()
    }
}

//! ServiceManager — entry point for lifecycle requests on one node.
//!
//! Owns the [`NodeContext`], creates services, routes requests to them
//! by unique id, runs the process monitor and the retry queue for starts
//! deferred by admission control, and answers force-refresh queries as
//! the propagator's [`SnapshotSource`].

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use fleetgrid_cluster::{ClusterPropagator, SnapshotSource};
use fleetgrid_state::{
    LocalService, Properties, ServiceConfiguration, ServiceId, ServiceSnapshot, SnapshotCache,
    StateStore, TOMBSTONE_TTL,
};

use crate::admission::CpuProbe;
use crate::config::{NodeConfig, ServiceRequest};
use crate::context::NodeContext;
use crate::error::{ServiceError, ServiceResult};
use crate::handler::LifecycleHandler;
use crate::service::{
    DeleteOutcome, ManagedService, PrepareOutcome, RefreshOutcome, StartOutcome, StopOutcome,
};

pub struct ServiceManager {
    ctx: Arc<NodeContext>,
    retry_rx: Mutex<Option<mpsc::UnboundedReceiver<Uuid>>>,
}

impl ServiceManager {
    pub fn new(
        config: NodeConfig,
        store: StateStore,
        handler: Arc<dyn LifecycleHandler>,
        cpu: Arc<dyn CpuProbe>,
    ) -> Arc<Self> {
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(NodeContext::new(config, store, handler, cpu, retry_tx));
        let manager = Arc::new(Self {
            ctx,
            retry_rx: Mutex::new(Some(retry_rx)),
        });

        let source: Weak<dyn SnapshotSource> = Arc::downgrade(&manager) as Weak<dyn SnapshotSource>;
        manager.ctx.propagator.set_source(source);
        manager
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    pub fn config(&self) -> &NodeConfig {
        &self.ctx.config
    }

    pub fn propagator(&self) -> &Arc<ClusterPropagator> {
        &self.ctx.propagator
    }

    pub fn cache(&self) -> &Arc<SnapshotCache> {
        self.ctx.cache()
    }

    pub fn used_heap_memory(&self) -> u64 {
        self.ctx.registry.used_heap_memory()
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn service(&self, unique_id: &Uuid) -> Option<Arc<ManagedService>> {
        self.ctx.registry.get_local(unique_id)
    }

    pub fn service_by_name(&self, name: &str) -> Option<Arc<ManagedService>> {
        self.ctx.registry.local_by_name(name)
    }

    pub fn services(&self) -> Vec<Arc<ManagedService>> {
        self.ctx.registry.locals()
    }

    fn require(&self, unique_id: &Uuid) -> ServiceResult<Arc<ManagedService>> {
        self.service(unique_id)
            .ok_or(ServiceError::UnknownService(*unique_id))
    }

    // ── Lifecycle requests ─────────────────────────────────────────

    /// Create a service from a request and prepare it. The service is
    /// registered as DEFINED before any side effect; a vetoed prepare
    /// leaves it DEFINED. A requested `task_service_id` that is already
    /// in use is refused with [`ServiceError::NameTaken`].
    pub async fn create_service(&self, request: ServiceRequest) -> ServiceResult<Arc<ManagedService>> {
        let task_service_id = self
            .ctx
            .registry
            .reserve_task_service_id(&request.task_name, request.task_service_id)
            .ok_or_else(|| {
                let index = request.task_service_id.unwrap_or_default();
                ServiceError::NameTaken(format!("{}-{index}", request.task_name))
            })?;
        let id = ServiceId::new(
            request.task_name.clone(),
            task_service_id,
            self.ctx.config.node_name.clone(),
            request.environment.clone(),
        );

        let mut configuration =
            ServiceConfiguration::new(id, request.port, request.max_heap_memory, request.command);
        configuration.process.environment = request.env;
        configuration.static_service = request.static_service;
        configuration.auto_delete_on_stop = request.auto_delete_on_stop;
        configuration.templates = request.templates;
        configuration.inclusions = request.inclusions;
        configuration.deployments = request.deployments;
        configuration.deleted_files_after_stop = request.deleted_files_after_stop;
        configuration.properties = request.properties;

        self.create_reserved(configuration).await
    }

    /// Create and prepare a service from a complete configuration. Its
    /// name must be free.
    pub async fn create_from_configuration(
        &self,
        configuration: ServiceConfiguration,
    ) -> ServiceResult<Arc<ManagedService>> {
        let id = &configuration.service_id;
        if self
            .ctx
            .registry
            .reserve_task_service_id(&id.task_name, Some(id.task_service_id))
            .is_none()
        {
            return Err(ServiceError::NameTaken(id.name.clone()));
        }
        self.create_reserved(configuration).await
    }

    /// Build, register and prepare a service whose index is already
    /// reserved. On failure nothing stays registered.
    async fn create_reserved(&self, configuration: ServiceConfiguration) -> ServiceResult<Arc<ManagedService>> {
        let id = configuration.service_id.clone();
        let service = match ManagedService::new(&self.ctx.config, configuration) {
            Ok(service) => Arc::new(service),
            Err(e) => {
                self.ctx
                    .registry
                    .release_task_service_id(&id.task_name, id.task_service_id);
                error!(service = %id, error = %e, "failed to create service");
                return Err(e);
            }
        };
        self.ctx
            .registry
            .insert_local(Arc::clone(&service), service.snapshot());
        info!(service = %service.id(), unique_id = %service.unique_id(), "service created");

        match service.prepare(&self.ctx).await {
            Ok(PrepareOutcome::InvalidState(state)) => {
                warn!(service = %service.id(), %state, "fresh service not preparable");
            }
            Ok(_) => {}
            Err(e) => {
                error!(service = %service.id(), error = %e, "prepare failed, discarding service");
                service.discard(&self.ctx).await;
                return Err(e);
            }
        }
        Ok(service)
    }

    /// Start a service, preparing it first if it is still DEFINED.
    pub async fn start_service(&self, unique_id: &Uuid) -> ServiceResult<StartOutcome> {
        let service = self.require(unique_id)?;
        if service.lifecycle() == fleetgrid_state::LifecycleState::Defined {
            match service.prepare(&self.ctx).await? {
                PrepareOutcome::Prepared => {}
                PrepareOutcome::Vetoed => return Ok(StartOutcome::Vetoed),
                PrepareOutcome::InvalidState(state) => return Ok(StartOutcome::InvalidState(state)),
            }
        }

        let outcome = service.start(&self.ctx).await;
        if let Err(e) = &outcome {
            error!(service = %service.id(), error = %e, "start failed");
        }
        outcome
    }

    pub async fn stop_service(&self, unique_id: &Uuid) -> ServiceResult<StopOutcome> {
        let service = self.require(unique_id)?;
        let outcome = service.stop(&self.ctx).await;
        self.after_stop(&service, outcome).await;
        Ok(outcome)
    }

    pub async fn kill_service(&self, unique_id: &Uuid) -> ServiceResult<StopOutcome> {
        let service = self.require(unique_id)?;
        let outcome = service.kill(&self.ctx).await;
        self.after_stop(&service, outcome).await;
        Ok(outcome)
    }

    /// Stop (if running) and start again.
    pub async fn restart_service(&self, unique_id: &Uuid) -> ServiceResult<StartOutcome> {
        let service = self.require(unique_id)?;
        let stopped = service.stop(&self.ctx).await;
        if stopped == StopOutcome::Vetoed {
            return Ok(StartOutcome::Vetoed);
        }
        self.start_service(unique_id).await
    }

    pub async fn delete_service(&self, unique_id: &Uuid) -> ServiceResult<DeleteOutcome> {
        let service = self.require(unique_id)?;
        let outcome = service.delete(&self.ctx).await;
        if let Err(e) = &outcome {
            error!(service = %service.id(), error = %e, "delete failed");
        }
        outcome
    }

    pub async fn update_properties(
        &self,
        unique_id: &Uuid,
        properties: Properties,
    ) -> ServiceResult<ServiceSnapshot> {
        let service = self.require(unique_id)?;
        Ok(service.update_properties(&self.ctx, properties).await)
    }

    async fn after_stop(&self, service: &ManagedService, outcome: StopOutcome) {
        if matches!(outcome, StopOutcome::Stopped { .. }) && service.configuration().auto_delete_on_stop {
            self.auto_delete(service).await;
        }
    }

    async fn auto_delete(&self, service: &ManagedService) {
        match service.delete(&self.ctx).await {
            Ok(outcome) => debug!(service = %service.id(), ?outcome, "auto delete after stop"),
            Err(e) => error!(service = %service.id(), error = %e, "auto delete failed"),
        }
    }

    // ── Background loops ───────────────────────────────────────────

    /// Refresh every local service once.
    pub async fn refresh_all(&self) {
        for service in self.services() {
            if let RefreshOutcome::Exited { exit_code } = service.refresh(&self.ctx) {
                debug!(service = %service.id(), exit_code, "monitor observed exit");
                if service.configuration().auto_delete_on_stop {
                    self.auto_delete(&service).await;
                }
            }
        }
    }

    /// Periodically sample local processes and expire old removal
    /// records until shutdown.
    pub async fn run_monitor(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = self.ctx.config.monitor_interval();
        debug!(?interval, "process monitor starting");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.refresh_all().await;
                    self.cache().prune_tombstones(TOMBSTONE_TTL);
                }
                _ = shutdown.changed() => {
                    debug!("process monitor shutting down");
                    break;
                }
            }
        }
    }

    /// Retry starts deferred by admission control, each after
    /// `retry_delay`, until shutdown. Only one worker can run.
    pub async fn run_retry_worker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let Some(mut queue) = self.retry_rx.lock().take() else {
            warn!("retry worker already running");
            return;
        };
        let delay = self.ctx.config.retry_delay();
        debug!(?delay, "retry worker starting");

        loop {
            tokio::select! {
                next = queue.recv() => {
                    let Some(unique_id) = next else { break };
                    let manager = Arc::clone(&self);
                    let mut stop = shutdown.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {
                                match manager.start_service(&unique_id).await {
                                    Ok(outcome) => debug!(%unique_id, ?outcome, "deferred start retried"),
                                    Err(e) => debug!(%unique_id, error = %e, "deferred start dropped"),
                                }
                            }
                            _ = stop.changed() => {}
                        }
                    });
                }
                _ = shutdown.changed() => {
                    debug!("retry worker shutting down");
                    break;
                }
            }
        }
    }

    /// Create and start every `[[services]]` entry of the configuration.
    pub async fn start_configured_services(&self) -> usize {
        let mut started = 0;
        for request in self.ctx.config.services.clone() {
            let task = request.task_name.clone();
            let service = match self.create_service(request).await {
                Ok(service) => service,
                Err(e) => {
                    error!(%task, error = %e, "failed to create configured service");
                    continue;
                }
            };
            match self.start_service(&service.id().unique_id).await {
                Ok(outcome) if outcome.is_started() => started += 1,
                Ok(outcome) => info!(service = %service.id(), ?outcome, "configured service not started"),
                Err(_) => {}
            }
        }
        started
    }

    /// Stop and delete every local service. Used at node shutdown.
    pub async fn shutdown_all(&self) {
        for service in self.services() {
            let id = service.id().unique_id;
            match self.delete_service(&id).await {
                Ok(DeleteOutcome::Deleted) => {}
                Ok(outcome) => warn!(service = %service.id(), ?outcome, "service left behind at shutdown"),
                Err(_) => {}
            }
        }
    }
}

#[async_trait]
impl SnapshotSource for ServiceManager {
    async fn live_snapshot(&self, unique_id: Uuid) -> Option<ServiceSnapshot> {
        let service = self.service(&unique_id)?;
        if let RefreshOutcome::Exited { .. } = service.refresh(&self.ctx) {
            if service.configuration().auto_delete_on_stop {
                self.auto_delete(&service).await;
            }
        }
        Some(service.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::StaticCpuProbe;
    use crate::handler::DefaultHandler;

    fn manager(dir: &std::path::Path) -> Arc<ServiceManager> {
        let config = NodeConfig {
            temp_dir: dir.join("temp"),
            persistent_dir: dir.join("persistent"),
            template_dir: dir.join("templates"),
            ..NodeConfig::default()
        };
        ServiceManager::new(
            config,
            StateStore::open_in_memory().unwrap(),
            Arc::new(DefaultHandler),
            Arc::new(StaticCpuProbe::new(0.0)),
        )
    }

    #[tokio::test]
    async fn unknown_service_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let err = manager.stop_service(&Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ServiceError::UnknownService(_)));
    }

    #[tokio::test]
    async fn create_allocates_task_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let cmd = vec!["true".to_string()];

        let a = manager
            .create_service(ServiceRequest::new("Lobby", 30001, 64, cmd.clone()))
            .await
            .unwrap();
        let b = manager
            .create_service(ServiceRequest::new("Lobby", 30002, 64, cmd))
            .await
            .unwrap();

        assert_eq!(a.id().name, "Lobby-1");
        assert_eq!(b.id().name, "Lobby-2");
        assert_eq!(manager.services().len(), 2);
        assert!(manager.service_by_name("Lobby-2").is_some());
    }

    #[tokio::test]
    async fn created_service_is_prepared_and_cached() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let service = manager
            .create_service(ServiceRequest::new("Proxy", 25565, 128, vec!["true".into()]))
            .await
            .unwrap();

        let cached = manager.cache().get(&service.unique_id()).unwrap();
        assert_eq!(cached.lifecycle, fleetgrid_state::LifecycleState::Prepared);
        assert_eq!(cached.node_name(), "node-1");
        assert!(service.directory().join(".wrapper").is_dir());
    }

    #[tokio::test]
    async fn live_snapshot_of_foreign_id_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        assert!(manager.live_snapshot(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn retry_worker_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let (tx, rx) = watch::channel(false);

        let first = tokio::spawn(Arc::clone(&manager).run_retry_worker(rx.clone()));
        while manager.retry_rx.lock().is_some() {
            tokio::task::yield_now().await;
        }
        // The second worker finds the queue taken and returns at once.
        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            Arc::clone(&manager).run_retry_worker(rx),
        )
        .await
        .unwrap();

        tx.send(true).unwrap();
        first.await.unwrap();
    }
}

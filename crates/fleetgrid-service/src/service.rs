//! ManagedService — the lifecycle state machine of one local service.
//!
//! ```text
//! DEFINED ──prepare──▶ PREPARED ──start──▶ RUNNING ──stop/kill──▶ STOPPED
//!    │                    │                                   │   │
//!    │                    │                  start ◀──────────┘   │
//!    └────────────────────┴──────────delete──────────▶ DELETED ◀──┘
//! ```
//!
//! Every transition runs under the service's lifecycle lock, consults
//! the node's [`LifecycleHandler`](crate::handler::LifecycleHandler),
//! produces a fresh snapshot with the next sequence number and publishes
//! it to the cluster. Snapshots are only advanced while that lock is
//! held.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use fleetgrid_state::{
    now_millis, HostAndPort, LifecycleState, LocalService, ProcessSnapshot, Properties, PublishKind,
    ServiceConfiguration, ServiceId, ServiceSnapshot,
};
use fleetgrid_task::CountingTask;

use crate::admission::AdmissionDenial;
use crate::config::{BlockedStartPolicy, NodeConfig};
use crate::context::NodeContext;
use crate::error::{io_err, ServiceResult};
use crate::process::{ServiceProcess, UNKNOWN_EXIT_CODE};
use crate::staging;

// ── Outcomes ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareOutcome {
    Prepared,
    InvalidState(LifecycleState),
    Vetoed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StartOutcome {
    Started { pid: u32 },
    InvalidState(LifecycleState),
    Vetoed,
    /// Refused by admission control and queued for a later retry.
    Deferred(AdmissionDenial),
    /// Refused by admission control and dropped.
    Rejected(AdmissionDenial),
}

impl StartOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped { exit_code: i32 },
    /// Another stop or kill of this service is in progress.
    AlreadyStopping,
    NotRunning(LifecycleState),
    Vetoed,
}

impl StopOutcome {
    /// Exit code of the process, `-1` when nothing was stopped.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Stopped { exit_code } => *exit_code,
            _ => UNKNOWN_EXIT_CODE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    InvalidState(LifecycleState),
    Vetoed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// The process is alive; a sampled snapshot was published.
    Sampled(ServiceSnapshot),
    /// The process had exited on its own and the service is now STOPPED.
    Exited { exit_code: i32 },
    /// Not running.
    Idle,
    /// A transition holds the lifecycle lock.
    Busy,
}

/// Clears the shutdown flag when the stop finishes or is abandoned.
struct ShutdownFlag<'a>(&'a AtomicBool);

impl Drop for ShutdownFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ── ManagedService ─────────────────────────────────────────────────

pub struct ManagedService {
    configuration: ServiceConfiguration,
    directory: PathBuf,
    address: HostAndPort,
    connect_address: HostAndPort,
    /// Static service whose directory did not exist before this run.
    first_static_startup: AtomicBool,
    sequence: AtomicU64,
    snapshot: RwLock<ServiceSnapshot>,
    shutting_down: AtomicBool,
    /// Lifecycle lock; holds the process while RUNNING.
    process: Mutex<Option<ServiceProcess>>,
}

impl std::fmt::Debug for ManagedService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedService")
            .field("id", &self.configuration.service_id.name)
            .field("lifecycle", &self.lifecycle())
            .field("directory", &self.directory)
            .finish()
    }
}

impl ManagedService {
    /// Create a DEFINED service and its working directory.
    ///
    /// Static services live in `{persistent_dir}/{name}`, ephemeral ones
    /// in `{temp_dir}/{name}_{unique_id}`.
    pub fn new(node: &NodeConfig, configuration: ServiceConfiguration) -> ServiceResult<Self> {
        let id = &configuration.service_id;
        let directory = if configuration.static_service {
            node.persistent_dir.join(&id.name)
        } else {
            node.temp_dir.join(format!("{}_{}", id.name, id.unique_id))
        };
        let first_static_startup = configuration.static_service && !directory.exists();
        std::fs::create_dir_all(&directory).map_err(io_err(&directory))?;

        let address = HostAndPort::new(node.host_address.clone(), configuration.port);
        let connect_address = HostAndPort::new(node.connect_host_address.clone(), configuration.port);
        let snapshot = ServiceSnapshot {
            creation_time: now_millis(),
            sequence: 1,
            address: address.clone(),
            connect_address: connect_address.clone(),
            lifecycle: LifecycleState::Defined,
            process: ProcessSnapshot::empty(),
            properties: configuration.properties.clone(),
            configuration: configuration.clone(),
        };

        debug!(service = %id, ?directory, "service defined");
        Ok(Self {
            configuration,
            directory,
            address,
            connect_address,
            first_static_startup: AtomicBool::new(first_static_startup),
            sequence: AtomicU64::new(1),
            snapshot: RwLock::new(snapshot),
            shutting_down: AtomicBool::new(false),
            process: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &ServiceId {
        &self.configuration.service_id
    }

    pub fn configuration(&self) -> &ServiceConfiguration {
        &self.configuration
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        self.snapshot.read().clone()
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.snapshot.read().lifecycle
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Build, store and return the next snapshot. Callers hold the
    /// lifecycle lock.
    fn advance(
        &self,
        lifecycle: LifecycleState,
        process: ProcessSnapshot,
        properties: Option<Properties>,
    ) -> ServiceSnapshot {
        let mut current = self.snapshot.write();
        let next = ServiceSnapshot {
            creation_time: now_millis(),
            sequence: self.sequence.fetch_add(1, Ordering::AcqRel) + 1,
            address: self.address.clone(),
            connect_address: self.connect_address.clone(),
            lifecycle,
            process,
            properties: properties.unwrap_or_else(|| current.properties.clone()),
            configuration: self.configuration.clone(),
        };
        *current = next.clone();
        next
    }

    /// Persist a snapshot and publish it to the cluster.
    fn announce(&self, ctx: &NodeContext, kind: PublishKind, snapshot: ServiceSnapshot) -> CountingTask<usize> {
        if let Err(e) = ctx.store.put_snapshot(&snapshot) {
            warn!(service = %self.id(), error = %e, "failed to persist snapshot");
        }
        ctx.propagator.publish(kind, snapshot)
    }

    fn running_process_snapshot(&self, pid: u32, cpu_usage: f32, memory_bytes: u64) -> ProcessSnapshot {
        ProcessSnapshot {
            pid: Some(pid),
            cpu_usage,
            memory_bytes,
            max_heap_memory: self.configuration.max_heap_memory,
        }
    }

    // ── Prepare ────────────────────────────────────────────────────

    /// `DEFINED | STOPPED → PREPARED`.
    pub async fn prepare(&self, ctx: &NodeContext) -> ServiceResult<PrepareOutcome> {
        let _lock = self.process.lock().await;

        let state = self.lifecycle();
        if !matches!(state, LifecycleState::Defined | LifecycleState::Stopped) {
            return Ok(PrepareOutcome::InvalidState(state));
        }
        if !ctx.handler.pre_prepare(self) {
            debug!(service = %self.id(), "prepare vetoed");
            return Ok(PrepareOutcome::Vetoed);
        }

        let wrapper = staging::prepare_directory(&self.directory)?;
        if let Err(e) = staging::stage_ssl(&ctx.config.ssl, &wrapper) {
            warn!(service = %self.id(), error = %e, "failed to stage ssl material");
        }

        let snapshot = self.advance(LifecycleState::Prepared, ProcessSnapshot::empty(), None);
        self.announce(ctx, PublishKind::Register, snapshot);
        ctx.handler.post_prepare(self);
        Ok(PrepareOutcome::Prepared)
    }

    // ── Start ──────────────────────────────────────────────────────

    /// `PREPARED | STOPPED → RUNNING`, gated by admission control.
    pub async fn start(&self, ctx: &NodeContext) -> ServiceResult<StartOutcome> {
        let _sequence = match ctx.config.parallel_start {
            true => None,
            false => Some(ctx.start_sequence.lock().await),
        };
        let mut slot = self.process.lock().await;

        let state = self.lifecycle();
        if !matches!(state, LifecycleState::Prepared | LifecycleState::Stopped) {
            return Ok(StartOutcome::InvalidState(state));
        }

        let used = ctx.registry.used_heap_memory();
        if let Err(denial) = ctx.admission.check(used, self.configuration.max_heap_memory) {
            return Ok(self.blocked(ctx, denial));
        }

        if !ctx.handler.pre_prepare_start(self) {
            debug!(service = %self.id(), "prepare-start vetoed");
            return Ok(StartOutcome::Vetoed);
        }
        self.prepare_start(ctx).await?;
        ctx.handler.post_prepare_start(self);

        if !ctx.handler.pre_start(self) {
            debug!(service = %self.id(), "start vetoed");
            return Ok(StartOutcome::Vetoed);
        }

        let process = ServiceProcess::spawn(&self.configuration, &self.directory)?;
        let pid = process.pid();
        *slot = Some(process);
        self.first_static_startup.store(false, Ordering::Release);

        let snapshot = self.advance(
            LifecycleState::Running,
            self.running_process_snapshot(pid, 0.0, 0),
            None,
        );
        self.announce(ctx, PublishKind::Started, snapshot);
        ctx.handler.post_start(self);
        Ok(StartOutcome::Started { pid })
    }

    fn blocked(&self, ctx: &NodeContext, denial: AdmissionDenial) -> StartOutcome {
        match ctx.config.blocked_start_policy {
            BlockedStartPolicy::RetryLater => {
                info!(service = %self.id(), %denial, retry_in = ?ctx.config.retry_delay(), "start deferred");
                if ctx.retry_queue.send(self.id().unique_id).is_err() {
                    warn!(service = %self.id(), "retry queue closed, start dropped");
                }
                StartOutcome::Deferred(denial)
            }
            BlockedStartPolicy::Reject => {
                warn!(service = %self.id(), %denial, "start refused");
                StartOutcome::Rejected(denial)
            }
        }
    }

    /// Stage inclusions and templates, publish the PREPARED snapshot and
    /// write the process configuration.
    async fn prepare_start(&self, ctx: &NodeContext) -> ServiceResult<()> {
        for inclusion in &self.configuration.inclusions {
            staging::fetch_inclusion(inclusion, &self.directory).await?;
        }

        let first_startup = self.first_static_startup.load(Ordering::Acquire);
        for template in &self.configuration.templates {
            let copy = !self.configuration.static_service
                || first_startup
                || template.always_copy_to_static_services;
            if copy {
                staging::copy_template(&ctx.config.template_dir, template, &self.directory)?;
            }
        }

        let snapshot = self.advance(LifecycleState::Prepared, ProcessSnapshot::empty(), None);
        self.announce(ctx, PublishKind::Update, snapshot.clone());
        staging::write_wrapper_config(&self.directory, &snapshot)?;
        Ok(())
    }

    // ── Stop ───────────────────────────────────────────────────────

    /// `RUNNING → STOPPED` via SIGTERM, killing after `stop_timeout`.
    pub async fn stop(&self, ctx: &NodeContext) -> StopOutcome {
        self.shutdown(ctx, false).await
    }

    /// `RUNNING → STOPPED` via immediate kill.
    pub async fn kill(&self, ctx: &NodeContext) -> StopOutcome {
        self.shutdown(ctx, true).await
    }

    async fn shutdown(&self, ctx: &NodeContext, force: bool) -> StopOutcome {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            debug!(service = %self.id(), "stop already in progress");
            return StopOutcome::AlreadyStopping;
        }
        let _flag = ShutdownFlag(&self.shutting_down);
        let mut slot = self.process.lock().await;

        let state = self.lifecycle();
        if state != LifecycleState::Running {
            return StopOutcome::NotRunning(state);
        }
        if !ctx.handler.pre_stop(self) {
            debug!(service = %self.id(), "stop vetoed");
            return StopOutcome::Vetoed;
        }

        let exit_code = match slot.take() {
            Some(process) => process.terminate(force, ctx.config.stop_timeout()).await,
            None => UNKNOWN_EXIT_CODE,
        };
        self.finish_stop(ctx, exit_code);
        StopOutcome::Stopped { exit_code }
    }

    fn finish_stop(&self, ctx: &NodeContext, exit_code: i32) {
        let removed =
            staging::delete_after_stop(&self.directory, &self.configuration.deleted_files_after_stop);
        if removed > 0 {
            debug!(service = %self.id(), removed, "files deleted after stop");
        }

        let snapshot = self.advance(LifecycleState::Stopped, ProcessSnapshot::empty(), None);
        self.announce(ctx, PublishKind::Stopped, snapshot);
        ctx.handler.post_stop(self, exit_code);
    }

    // ── Delete ─────────────────────────────────────────────────────

    /// `DEFINED | PREPARED | STOPPED → DELETED`. A RUNNING service is
    /// stopped first.
    pub async fn delete(&self, ctx: &NodeContext) -> ServiceResult<DeleteOutcome> {
        if self.lifecycle() == LifecycleState::Running
            && self.stop(ctx).await == StopOutcome::Vetoed
        {
            return Ok(DeleteOutcome::Vetoed);
        }
        let _lock = self.process.lock().await;

        let state = self.lifecycle();
        if !matches!(
            state,
            LifecycleState::Defined | LifecycleState::Prepared | LifecycleState::Stopped
        ) {
            return Ok(DeleteOutcome::InvalidState(state));
        }
        if !ctx.handler.pre_delete(self) {
            debug!(service = %self.id(), "delete vetoed");
            return Ok(DeleteOutcome::Vetoed);
        }

        for deployment in &self.configuration.deployments {
            if let Err(e) = staging::deploy(&self.directory, &ctx.config.template_dir, deployment) {
                warn!(service = %self.id(), template = %deployment.template, error = %e, "deployment failed");
            }
        }
        if !self.configuration.static_service {
            staging::remove_directory(&self.directory)?;
        }

        self.unregister(ctx);
        ctx.handler.post_delete(self);
        Ok(DeleteOutcome::Deleted)
    }

    /// Drop a service whose creation failed half way: unregister it and
    /// remove an ephemeral directory, without consulting the handler.
    pub(crate) async fn discard(&self, ctx: &NodeContext) {
        let _lock = self.process.lock().await;
        if self.lifecycle() == LifecycleState::Deleted {
            return;
        }
        if !self.configuration.static_service {
            if let Err(e) = staging::remove_directory(&self.directory) {
                warn!(service = %self.id(), error = %e, "failed to remove directory of discarded service");
            }
        }
        self.unregister(ctx);
        debug!(service = %self.id(), "service discarded");
    }

    /// DELETED bookkeeping: forget the service locally, free its name and
    /// publish UNREGISTER. Callers hold the lifecycle lock.
    fn unregister(&self, ctx: &NodeContext) {
        let id = self.id();
        ctx.registry.remove_local(&id.unique_id);
        if let Err(e) = ctx.store.delete_snapshot(&id.unique_id) {
            warn!(service = %id, error = %e, "failed to remove stored snapshot");
        }

        let snapshot = self.advance(LifecycleState::Deleted, ProcessSnapshot::empty(), None);
        ctx.propagator.publish(PublishKind::Unregister, snapshot);
        ctx.registry.release_task_service_id(&id.task_name, id.task_service_id);
    }

    // ── Monitoring ─────────────────────────────────────────────────

    /// Sample the process and publish an UPDATE snapshot, or move the
    /// service to STOPPED if its process has exited on its own.
    pub fn refresh(&self, ctx: &NodeContext) -> RefreshOutcome {
        let Ok(mut slot) = self.process.try_lock() else {
            return RefreshOutcome::Busy;
        };
        if self.lifecycle() != LifecycleState::Running {
            return RefreshOutcome::Idle;
        }
        let Some(process) = slot.as_mut() else {
            return RefreshOutcome::Idle;
        };

        if let Some(exit_code) = process.try_exit_code() {
            info!(service = %self.id(), exit_code, "process exited on its own");
            slot.take();
            self.finish_stop(ctx, exit_code);
            return RefreshOutcome::Exited { exit_code };
        }

        let pid = process.pid();
        let (cpu_usage, memory_bytes) = ctx.sampler.sample(pid).unwrap_or_default();
        let snapshot = self.advance(
            LifecycleState::Running,
            self.running_process_snapshot(pid, cpu_usage, memory_bytes),
            None,
        );
        self.announce(ctx, PublishKind::Update, snapshot.clone());
        RefreshOutcome::Sampled(snapshot)
    }

    /// Replace the property bag and publish the result.
    pub async fn update_properties(&self, ctx: &NodeContext, properties: Properties) -> ServiceSnapshot {
        let _lock = self.process.lock().await;
        let current = self.snapshot();
        let snapshot = self.advance(current.lifecycle, current.process, Some(properties));
        if current.lifecycle == LifecycleState::Deleted {
            return snapshot;
        }
        self.announce(ctx, PublishKind::Update, snapshot.clone());
        snapshot
    }
}

impl LocalService for ManagedService {
    fn unique_id(&self) -> Uuid {
        self.configuration.service_id.unique_id
    }

    fn name(&self) -> String {
        self.configuration.service_id.name.clone()
    }

    fn lifecycle(&self) -> LifecycleState {
        ManagedService::lifecycle(self)
    }

    fn max_heap_memory(&self) -> u64 {
        self.configuration.max_heap_memory
    }
}

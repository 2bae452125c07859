//! Lifecycle hooks.
//!
//! A [`LifecycleHandler`] is consulted around every transition. `pre_*`
//! hooks can veto the transition by returning `false`; `post_*` hooks are
//! notifications. Hooks run while the service's lifecycle lock is held
//! and must not call back into lifecycle operations of the same service.

use tracing::{debug, info};

use crate::service::ManagedService;

pub trait LifecycleHandler: Send + Sync + 'static {
    fn pre_prepare(&self, _service: &ManagedService) -> bool {
        true
    }

    fn post_prepare(&self, _service: &ManagedService) {}

    fn pre_prepare_start(&self, _service: &ManagedService) -> bool {
        true
    }

    fn post_prepare_start(&self, _service: &ManagedService) {}

    fn pre_start(&self, _service: &ManagedService) -> bool {
        true
    }

    fn post_start(&self, _service: &ManagedService) {}

    fn pre_stop(&self, _service: &ManagedService) -> bool {
        true
    }

    fn post_stop(&self, _service: &ManagedService, _exit_code: i32) {}

    fn pre_delete(&self, _service: &ManagedService) -> bool {
        true
    }

    fn post_delete(&self, _service: &ManagedService) {}
}

/// Allows every transition and logs the notable ones.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHandler;

impl LifecycleHandler for DefaultHandler {
    fn post_prepare(&self, service: &ManagedService) {
        debug!(service = %service.id(), dir = ?service.directory(), "service prepared");
    }

    fn post_start(&self, service: &ManagedService) {
        info!(service = %service.id(), pid = ?service.snapshot().process.pid, "service started");
    }

    fn post_stop(&self, service: &ManagedService, exit_code: i32) {
        info!(service = %service.id(), exit_code, "service stopped");
    }

    fn post_delete(&self, service: &ManagedService) {
        info!(service = %service.id(), "service deleted");
    }
}

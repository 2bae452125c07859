//! ServiceRegistry — live services owned by this node plus the
//! cluster-wide snapshot cache.
//!
//! Every local service also has an entry in the cache; the cache is the
//! source of truth for queries, the local map is how lifecycle
//! operations find the live object. Task indexes are reserved here so
//! that concurrent creates never share a name.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::cache::{Origin, SnapshotCache};
use crate::types::{LifecycleState, PublishKind, ServiceSnapshot};

/// What the registry needs to know about a live service object.
pub trait LocalService: Send + Sync + 'static {
    fn unique_id(&self) -> Uuid;

    fn name(&self) -> String;

    fn lifecycle(&self) -> LifecycleState;

    /// Configured heap ceiling in megabytes.
    fn max_heap_memory(&self) -> u64;
}

pub struct ServiceRegistry<S> {
    local: DashMap<Uuid, Arc<S>>,
    /// `task_service_id`s held by local services, per task.
    reserved: DashMap<String, BTreeSet<u32>>,
    cache: Arc<SnapshotCache>,
}

impl<S: LocalService> ServiceRegistry<S> {
    pub fn new(cache: Arc<SnapshotCache>) -> Self {
        Self {
            local: DashMap::new(),
            reserved: DashMap::new(),
            cache,
        }
    }

    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    /// Track a newly created service and seed the cache with its first
    /// snapshot.
    pub fn insert_local(&self, service: Arc<S>, snapshot: ServiceSnapshot) {
        let id = service.unique_id();
        self.cache.upsert(PublishKind::Register, snapshot, Origin::Local);
        self.local.insert(id, service);
        debug!(%id, "local service registered");
    }

    /// Stop tracking a local service. The cache entry is removed by the
    /// UNREGISTER publish that accompanies deletion.
    pub fn remove_local(&self, id: &Uuid) -> Option<Arc<S>> {
        let removed = self.local.remove(id).map(|(_, service)| service);
        if removed.is_some() {
            debug!(%id, "local service unregistered");
        }
        removed
    }

    pub fn get_local(&self, id: &Uuid) -> Option<Arc<S>> {
        self.local.get(id).map(|e| Arc::clone(e.value()))
    }

    pub fn local_by_name(&self, name: &str) -> Option<Arc<S>> {
        self.local
            .iter()
            .find(|e| e.value().name() == name)
            .map(|e| Arc::clone(e.value()))
    }

    pub fn locals(&self) -> Vec<Arc<S>> {
        self.local.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn local_count(&self) -> usize {
        self.local.len()
    }

    pub fn is_local(&self, id: &Uuid) -> bool {
        self.local.contains_key(id)
    }

    /// Sum of configured heap of local services that are RUNNING.
    pub fn used_heap_memory(&self) -> u64 {
        self.local
            .iter()
            .filter(|e| e.value().lifecycle() == LifecycleState::Running)
            .map(|e| e.value().max_heap_memory())
            .sum()
    }

    /// Reserve a `task_service_id` for `task_name`.
    ///
    /// `requested` is granted when no local reservation or cached
    /// service holds it, otherwise `None` is returned. Without a request
    /// the lowest free index from 1 is picked. The reservation holds
    /// until [`release_task_service_id`](Self::release_task_service_id).
    pub fn reserve_task_service_id(&self, task_name: &str, requested: Option<u32>) -> Option<u32> {
        let cached: BTreeSet<u32> = self
            .cache
            .by_task(task_name)
            .iter()
            .map(|s| s.service_id().task_service_id)
            .collect();

        let mut reserved = self.reserved.entry(task_name.to_string()).or_default();
        let index = {
            let free = |n: &u32| !reserved.contains(n) && !cached.contains(n);
            match requested {
                Some(n) => Some(n).filter(free),
                None => (1..=u32::MAX).find(free),
            }
        };
        if let Some(n) = index {
            reserved.insert(n);
            debug!(task = %task_name, index = n, "task index reserved");
        }
        index
    }

    pub fn release_task_service_id(&self, task_name: &str, index: u32) {
        if let Some(mut reserved) = self.reserved.get_mut(task_name) {
            reserved.remove(&index);
        }
        self.reserved.remove_if(task_name, |_, set| set.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use std::sync::Mutex;

    struct FakeService {
        id: ServiceId,
        heap: u64,
        state: Mutex<LifecycleState>,
    }

    impl LocalService for FakeService {
        fn unique_id(&self) -> Uuid {
            self.id.unique_id
        }
        fn name(&self) -> String {
            self.id.name.clone()
        }
        fn lifecycle(&self) -> LifecycleState {
            *self.state.lock().unwrap()
        }
        fn max_heap_memory(&self) -> u64 {
            self.heap
        }
    }

    fn add(registry: &ServiceRegistry<FakeService>, index: u32, heap: u64, state: LifecycleState) -> Arc<FakeService> {
        let id = ServiceId::new("Lobby", index, "node-1", "JVM");
        let config = ServiceConfiguration::new(id.clone(), 40000, heap, vec![]);
        let snapshot = ServiceSnapshot {
            creation_time: now_millis(),
            sequence: 1,
            address: HostAndPort::new("127.0.0.1", 40000),
            connect_address: HostAndPort::new("127.0.0.1", 40000),
            lifecycle: state,
            process: ProcessSnapshot::empty(),
            properties: Properties::new(),
            configuration: config,
        };
        let service = Arc::new(FakeService {
            id,
            heap,
            state: Mutex::new(state),
        });
        registry.insert_local(Arc::clone(&service), snapshot);
        service
    }

    #[test]
    fn local_services_are_in_cache() {
        let registry = ServiceRegistry::new(Arc::new(SnapshotCache::new()));
        let svc = add(&registry, 1, 256, LifecycleState::Defined);

        assert!(registry.is_local(&svc.unique_id()));
        assert!(registry.cache().contains(&svc.unique_id()));
        assert_eq!(registry.local_by_name("Lobby-1").unwrap().unique_id(), svc.unique_id());
    }

    #[test]
    fn used_heap_counts_running_only() {
        let registry = ServiceRegistry::new(Arc::new(SnapshotCache::new()));
        add(&registry, 1, 512, LifecycleState::Running);
        add(&registry, 2, 388, LifecycleState::Running);
        let prepared = add(&registry, 3, 1000, LifecycleState::Prepared);

        assert_eq!(registry.used_heap_memory(), 900);
        *prepared.state.lock().unwrap() = LifecycleState::Running;
        assert_eq!(registry.used_heap_memory(), 1900);
    }

    #[test]
    fn remove_local_forgets_service() {
        let registry = ServiceRegistry::new(Arc::new(SnapshotCache::new()));
        let svc = add(&registry, 1, 256, LifecycleState::Stopped);

        assert!(registry.remove_local(&svc.unique_id()).is_some());
        assert!(registry.remove_local(&svc.unique_id()).is_none());
        assert_eq!(registry.local_count(), 0);
    }

    #[test]
    fn reserve_fills_gaps_left_by_cached_services() {
        let registry = ServiceRegistry::new(Arc::new(SnapshotCache::new()));
        add(&registry, 1, 256, LifecycleState::Defined);
        add(&registry, 3, 256, LifecycleState::Defined);

        assert_eq!(registry.reserve_task_service_id("Lobby", None), Some(2));
        assert_eq!(registry.reserve_task_service_id("Lobby", None), Some(4));
        assert_eq!(registry.reserve_task_service_id("Proxy", None), Some(1));
    }

    #[test]
    fn requested_index_must_be_free() {
        let registry = ServiceRegistry::new(Arc::new(SnapshotCache::new()));
        add(&registry, 1, 256, LifecycleState::Defined);

        assert_eq!(registry.reserve_task_service_id("Lobby", Some(1)), None);
        assert_eq!(registry.reserve_task_service_id("Lobby", Some(7)), Some(7));
        assert_eq!(registry.reserve_task_service_id("Lobby", Some(7)), None);

        registry.release_task_service_id("Lobby", 7);
        assert_eq!(registry.reserve_task_service_id("Lobby", Some(7)), Some(7));
    }

    #[test]
    fn concurrent_reservations_are_distinct() {
        let registry = Arc::new(ServiceRegistry::<FakeService>::new(Arc::new(SnapshotCache::new())));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    (0..50)
                        .map(|_| registry.reserve_task_service_id("Lobby", None).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let all: BTreeSet<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(all.len(), 400);
        assert_eq!(all.last(), Some(&400));
    }
}

//! DeviceContext spawns workers bound to one backend and keeps a registry of the live ones.
//!
//! Callers own the workers they receive. A worker borrows its context, so it cannot outlive it,
//! and removes itself from the registry when dropped.

use crate::backend::{Backend, DeviceLimits};
use crate::idmap::IdMap;
use crate::worker::Worker;
use crate::{Error, Result};
use std::{
    fmt,
    sync::{Arc, Mutex},
};

/// Registry id of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Snapshot a worker publishes to its context after every state change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStatus {
    /// Registered buffer pairs
    pub pairs: usize,
    /// Device bytes held by the worker
    pub device_bytes: usize,
    /// Launches whose completion was not observed yet
    pub in_flight: usize,
}

/// Entry point: wraps a backend and spawns workers on it.
pub struct DeviceContext {
    backend: Arc<dyn Backend>,
    subscribers: Mutex<IdMap<WorkerStatus>>,
}

impl DeviceContext {
    /// Create a DeviceContext on `backend`.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        log::debug!("Device context on {}", backend.name());
        DeviceContext {
            backend,
            subscribers: Mutex::new(IdMap::new()),
        }
    }

    /// Spawn a worker bound to this context and register it.
    pub fn new_subscriber(&self) -> Result<Worker<'_>> {
        let id = {
            let mut subscribers = self.subscribers.lock().unwrap();
            subscribers
                .try_insert(WorkerStatus::default())
                .map_err(|_| Error::Allocation(std::mem::size_of::<WorkerStatus>()))?
        };
        log::debug!("{} subscribed", WorkerId(id));
        Ok(Worker::new(self, WorkerId(id)))
    }

    /// Live workers and their last published status, ordered by id.
    pub fn subscribers(&self) -> Vec<(WorkerId, WorkerStatus)> {
        let subscribers = self.subscribers.lock().unwrap();
        let mut list = subscribers
            .iter()
            .map(|(&id, &status)| (WorkerId(id), status))
            .collect::<Vec<_>>();
        list.sort_unstable_by_key(|(id, _)| *id);
        list
    }

    /// Number of live workers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Device bytes held by all live workers.
    pub fn device_bytes_in_use(&self) -> usize {
        let subscribers = self.subscribers.lock().unwrap();
        subscribers
            .iter()
            .map(|(_, status)| status.device_bytes)
            .sum()
    }

    /// Backend shared by every worker of this context.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Dispatch limits of the backend.
    pub fn limits(&self) -> DeviceLimits {
        self.backend.limits()
    }

    pub(crate) fn publish(&self, id: WorkerId, status: WorkerStatus) {
        let mut subscribers = self.subscribers.lock().unwrap();
        if let Some(entry) = subscribers.get_mut(id.0) {
            *entry = status;
        }
    }

    pub(crate) fn unsubscribe(&self, id: WorkerId) {
        let mut subscribers = self.subscribers.lock().unwrap();
        if subscribers.remove(id.0).is_some() {
            log::debug!("{} unsubscribed", id);
        }
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("backend", &self.backend.name())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::emulated::EmulatedDevice;

    #[test]
    fn test_registry_tracks_lifetime() {
        let context = DeviceContext::new(Arc::new(EmulatedDevice::new()));
        let first = context.new_subscriber().unwrap();
        let second = context.new_subscriber().unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(context.subscriber_count(), 2);
        drop(first);
        let ids: Vec<_> = context.subscribers().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![second.id()]);
        drop(second);
        assert_eq!(context.subscriber_count(), 0);
    }

    #[test]
    fn test_status_published() {
        let context = DeviceContext::new(Arc::new(EmulatedDevice::new()));
        let mut worker = context.new_subscriber().unwrap();
        worker.size_init(64).unwrap();
        worker.device_init(0).unwrap();
        worker.device_init(1).unwrap();
        let (_, status) = context.subscribers()[0];
        assert_eq!(status.pairs, 2);
        assert_eq!(status.device_bytes, 128);
        assert_eq!(context.device_bytes_in_use(), 128);
        worker.cleanup();
        assert_eq!(context.device_bytes_in_use(), 0);
    }

    #[test]
    fn test_concurrent_subscribe() {
        let context = DeviceContext::new(Arc::new(EmulatedDevice::new()));
        crossbeam::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|_| {
                    let mut worker = context.new_subscriber().unwrap();
                    worker.size_init(16).unwrap();
                    worker.host_init(0).unwrap();
                    worker.id()
                });
            }
        })
        .unwrap();
        assert_eq!(context.subscriber_count(), 0);
        let worker = context.new_subscriber().unwrap();
        assert_eq!(worker.id(), WorkerId(8));
    }
}

//! Kernel dispatch for workers.
//!
//! Synchronous launches run on the caller's thread. Asynchronous launches run on an executor
//! thread and report through a channel; the buffer indices they reference stay busy until the
//! owning worker observes completion.

use crate::backend::{Backend, KernelArgument};
use crate::context::WorkerId;
use crate::idmap::IdMap;
use crate::{Error, FunctionId, LaunchDim, Result};
use crossbeam::channel;
use std::{
    collections::HashMap,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// Completion handle of an asynchronous launch.
///
/// Pass it back to [`Worker::wait`](crate::Worker::wait) to observe the result and free the
/// buffers it uses.
#[derive(Debug)]
#[must_use = "buffers of a launch stay busy until it is waited on"]
pub struct LaunchHandle {
    id: usize,
    worker: WorkerId,
    indices: Vec<usize>,
    done: channel::Receiver<Result<Duration>>,
}

impl LaunchHandle {
    /// Launch id, unique within its worker.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Worker that issued the launch.
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Buffer indices held by this launch.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Whether the kernel has completed; does not release the buffers.
    ///
    /// Returns false once `cleanup` has collected the result, `wait` still reports it.
    pub fn is_finished(&self) -> bool {
        !self.done.is_empty()
    }
}

struct Pending {
    indices: Vec<usize>,
    done: channel::Receiver<Result<Duration>>,
    thread: JoinHandle<()>,
}

/// Launches of one worker whose completion was not observed yet.
pub(crate) struct InFlight {
    owner: WorkerId,
    launches: IdMap<Pending>,
    busy: HashMap<usize, usize>,
    // failures collected by drain, kept until their handle is waited on
    faults: HashMap<usize, Error>,
}

pub(crate) fn run(
    backend: &dyn Backend,
    function: FunctionId,
    args: &[KernelArgument],
    dim: &LaunchDim,
) -> Result<Duration> {
    let now = Instant::now();
    backend.launch(function, args, dim)?;
    Ok(now.elapsed())
}

impl InFlight {
    pub fn new(owner: WorkerId) -> Self {
        InFlight {
            owner,
            launches: IdMap::new(),
            busy: HashMap::new(),
            faults: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.launches.len()
    }

    /// Fails with BufferBusy when `index` belongs to an in-flight launch.
    pub fn check(&self, index: usize) -> Result<()> {
        if self.busy.contains_key(&index) {
            Err(Error::BufferBusy(index))
        } else {
            Ok(())
        }
    }

    pub fn spawn(
        &mut self,
        backend: Arc<dyn Backend>,
        function: FunctionId,
        args: Vec<KernelArgument>,
        dim: LaunchDim,
        indices: Vec<usize>,
    ) -> LaunchHandle {
        let (tx, rx) = channel::bounded(1);
        let thread = thread::spawn(move || {
            let result = run(backend.as_ref(), function, &args, &dim);
            if tx.send(result).is_err() {
                log::warn!("Launch result of {:?} dropped", function);
            }
        });
        let id = self.launches.insert(Pending {
            indices: indices.clone(),
            done: rx.clone(),
            thread,
        });
        for &index in &indices {
            self.busy.insert(index, id);
        }
        LaunchHandle {
            id,
            worker: self.owner,
            indices,
            done: rx,
        }
    }

    /// Block until the launch behind `handle` completes and release its indices.
    ///
    /// A launch already collected by `drain` reports its fault, or `None` if it succeeded.
    pub fn wait(&mut self, handle: &LaunchHandle) -> Result<Option<Duration>> {
        if handle.worker != self.owner {
            return Err(Error::ForeignLaunch {
                launch: handle.id,
                owner: handle.worker,
                worker: self.owner,
            });
        }
        match self.complete(handle.id) {
            Some(result) => result.map(Some),
            None => match self.faults.remove(&handle.id) {
                Some(e) => Err(e),
                None => Ok(None),
            },
        }
    }

    fn complete(&mut self, id: usize) -> Option<Result<Duration>> {
        let pending = self.launches.remove(id)?;
        let result = pending
            .done
            .recv()
            .unwrap_or_else(|_| Err(Error::KernelFault("executor thread exited".to_string())));
        if pending.thread.join().is_err() {
            log::warn!("Executor thread of launch {} panicked", id);
        }
        for index in pending.indices {
            self.busy.remove(&index);
        }
        Some(result)
    }

    /// Wait for every in-flight launch and keep failures for a later `wait`.
    pub fn drain(&mut self) {
        let mut ids = self.launches.iter().map(|(&id, _)| id).collect::<Vec<_>>();
        ids.sort_unstable();
        for id in ids {
            if let Some(Err(e)) = self.complete(id) {
                log::warn!("{} launch {} failed during cleanup: {}", self.owner, id, e);
                self.faults.insert(id, e);
            }
        }
    }
}

// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::QdiscError;
use crate::handle::Handle;
use crate::loom::sync::atomic::{AtomicBool, Ordering};
use crate::loom::sync::{Arc, Mutex, Weak};
use crate::park::{ParkingLot, ThreadParker};
use crate::qdisc::{FifoLeaf, ParentLink, Qdisc};
use crate::workload::{DispatchTarget, Workload};
use core::fmt;
use std::sync::PoisonError;
use std::thread::JoinHandle;
use util::Backoff;

/// Idle scan rounds a worker spins through before parking.
const IDLE_ROUNDS_BEFORE_PARK: usize = 4;

/// The worker pool driving a qdisc tree.
///
/// A fixed-size pool of OS threads dequeues workloads from the root qdisc
/// and executes them. Workers park on a work-available signal when the tree
/// runs dry; the root's upward notification chain terminates here and wakes
/// one of them per enqueue.
pub struct Scheduler {
    core: Arc<SchedulerCore>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

/// Configures and builds a [`Scheduler`].
#[derive(Debug)]
pub struct SchedulerBuilder {
    workers: usize,
}

pub(crate) struct SchedulerCore {
    root: Arc<dyn Qdisc>,
    lot: ParkingLot,
    stop: AtomicBool,
    workers: usize,
}

// === impl SchedulerBuilder ===

impl SchedulerBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self { workers: 1 }
    }

    /// Pool size; this is the scheduler's maximum concurrency.
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Builds a scheduler owning `root`.
    ///
    /// The root's parent link is pointed at the scheduler, terminating the
    /// `on_work_scheduled` chain at the worker pool's wake-up signal.
    pub fn build(self, root: Arc<dyn Qdisc>) -> Scheduler {
        let core = Arc::new(SchedulerCore {
            root,
            lot: ParkingLot::new(),
            stop: AtomicBool::new(false),
            workers: self.workers,
        });
        core.root
            .bind_parent(Arc::downgrade(&core) as Weak<dyn ParentLink>, 0);
        Scheduler {
            core,
            threads: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// === impl Scheduler ===

impl Scheduler {
    #[must_use]
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    /// Convenience: a scheduler over a single anonymous-policy FIFO root.
    ///
    /// Returns the scheduler together with the root leaf for submissions.
    ///
    /// # Panics
    ///
    /// Never panics in practice; the internally chosen root handle is valid.
    #[must_use]
    pub fn with_fifo_root(workers: usize) -> (Self, Arc<FifoLeaf>) {
        let root = FifoLeaf::new(Handle::new(1)).expect("the fixed root handle is non-zero");
        let scheduler = Self::builder()
            .workers(workers)
            .build(root.clone() as Arc<dyn Qdisc>);
        (scheduler, root)
    }

    /// The root qdisc; submissions go through its enqueue operations.
    #[must_use]
    pub fn root(&self) -> &Arc<dyn Qdisc> {
        &self.core.root
    }

    /// Spawns the worker pool. Idempotent; only the first call spawns.
    ///
    /// # Panics
    ///
    /// Panics if the OS refuses to spawn a worker thread.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
        for worker_id in 0..self.core.workers {
            let core = self.core.clone();
            let handle = std::thread::Builder::new()
                .name(format!("workq-worker-{worker_id}"))
                .spawn(move || worker_main(&core, worker_id))
                .expect("failed to spawn worker thread");
            threads.push(handle);
        }
        tracing::debug!(workers = self.core.workers, "scheduler started");
    }

    /// Signals every worker to terminate and joins them. Idempotent.
    ///
    /// Queued workloads that no worker picked up before observing the stop
    /// signal remain in the tree.
    pub fn stop(&self) {
        self.core.stop.store(true, Ordering::Release);
        self.core.lot.unpark_all();
        let threads = {
            let mut guard = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
            core::mem::take(&mut *guard)
        };
        for handle in threads {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
        tracing::debug!("scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.core.workers)
            .field("parked", &self.core.lot.num_parked())
            .field("root", &self.core.root.handle())
            .finish_non_exhaustive()
    }
}

// === impl SchedulerCore ===

impl ParentLink for SchedulerCore {
    fn on_work_scheduled(&self, _child_index: usize) {
        if !self.stop.load(Ordering::Acquire) {
            self.lot.unpark_one();
        }
    }
}

impl DispatchTarget for SchedulerCore {
    fn dispatch(&self, f: Box<dyn FnOnce() + Send>) {
        // keep the action recoverable so a rejected enqueue can fall back to
        // inline execution
        let slot = Arc::new(Mutex::new(Some(f)));
        let workload = Workload::new({
            let slot = slot.clone();
            move |_ctx| {
                if let Some(f) = slot.lock().unwrap_or_else(PoisonError::into_inner).take() {
                    f();
                }
                Ok(())
            }
        });
        if let Err(err) = self.root.enqueue_direct(workload) {
            tracing::warn!(%err, "dispatch continuation rejected, running inline");
            if let Some(f) = slot.lock().unwrap_or_else(PoisonError::into_inner).take() {
                f();
            }
        }
    }
}

/// The per-worker scheduling loop.
fn worker_main(core: &Arc<SchedulerCore>, worker_id: usize) {
    let _span = tracing::debug_span!("worker main loop", worker = worker_id).entered();
    let parker = Arc::new(ThreadParker::new());
    let mut backoff = Backoff::new();
    let mut idle_rounds = 0_usize;

    loop {
        if core.stop.load(Ordering::Acquire) {
            tracing::debug!(worker = worker_id, "stop signal received, shutting down");
            break;
        }

        if let Some(workload) = core.root.try_dequeue(worker_id, true) {
            idle_rounds = 0;
            backoff.reset();
            let outcome = workload.try_run(worker_id, Some(&**core as &dyn DispatchTarget));
            tracing::trace!(worker = worker_id, workload = workload.id(), ?outcome, "tick");
            continue;
        }

        // out of work: back off briefly, then park on the work-available
        // signal
        idle_rounds += 1;
        if idle_rounds <= IDLE_ROUNDS_BEFORE_PARK {
            backoff.spin();
            continue;
        }
        idle_rounds = 0;
        backoff.reset();

        core.root.on_worker_terminated(worker_id);
        core.lot.prepare_park(&parker);
        if core.stop.load(Ordering::Acquire) || !core.root.is_empty() {
            // work (or shutdown) raced our decision to sleep; consume the
            // park immediately
            parker.unpark();
        }
        tracing::trace!(worker = worker_id, "going to sleep");
        parker.park();
        core.lot.finish_park();
        tracing::trace!(worker = worker_id, "woke up");
    }
}

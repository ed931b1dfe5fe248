// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::QdiscError;
use crate::handle::Handle;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::loom::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use crate::qdisc::{ParentLink, Qdisc, RoutingPath};
use crate::workload::Workload;
use core::any::Any;
use core::fmt;
use std::collections::VecDeque;
use std::sync::PoisonError;

/// A classless FIFO leaf.
///
/// Workloads are dequeued in enqueue order. Entries that turned terminal
/// while queued (canceled workloads the leaf could not remove eagerly) are
/// soft-deleted: the dequeue loop discards them silently.
pub struct FifoLeaf {
    handle: Handle,
    queue: Mutex<LeafQueue>,
    parent: RwLock<Option<Weak<dyn ParentLink>>>,
    self_index: AtomicUsize,
    weak_self: Weak<FifoLeaf>,
}

struct LeafQueue {
    entries: VecDeque<Arc<Workload>>,
    /// Set under the queue lock so a completion cannot race an enqueue into
    /// a drained queue.
    completed: bool,
}

// === impl FifoLeaf ===

impl FifoLeaf {
    /// Creates a leaf with the given user handle.
    ///
    /// # Errors
    ///
    /// Returns [`QdiscError::ZeroHandle`] for the reserved anonymous handle.
    pub fn new(handle: Handle) -> Result<Arc<Self>, QdiscError> {
        if handle.is_anon() {
            return Err(QdiscError::ZeroHandle);
        }
        Ok(Self::with_handle(handle))
    }

    /// The anonymous local queue of a classful node.
    pub(crate) fn local() -> Arc<Self> {
        Self::with_handle(Handle::ANON)
    }

    fn with_handle(handle: Handle) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            handle,
            queue: Mutex::new(LeafQueue {
                entries: VecDeque::new(),
                completed: false,
            }),
            parent: RwLock::new(None),
            self_index: AtomicUsize::new(0),
            weak_self: weak_self.clone(),
        })
    }

    /// Re-admits drained workloads without re-running the state machine.
    ///
    /// Used when a removed child's residue is poured into its parent's local
    /// queue: the workloads are already `Scheduled` and only need rebinding.
    pub(crate) fn restore(&self, batch: Vec<Arc<Workload>>) {
        if batch.is_empty() {
            return;
        }
        {
            let mut queue = self.lock_queue();
            for workload in batch {
                workload.rebind(self.weak_self.clone());
                queue.entries.push_back(workload);
            }
        }
        self.notify_parent();
    }

    fn lock_queue(&self) -> MutexGuard<'_, LeafQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_parent(&self) {
        let parent = {
            let guard = self.parent.read().unwrap_or_else(PoisonError::into_inner);
            guard.clone()
        };
        if let Some(parent) = parent.and_then(|weak| weak.upgrade()) {
            parent.on_work_scheduled(self.self_index.load(Ordering::Acquire));
        }
    }
}

impl Qdisc for FifoLeaf {
    fn handle(&self) -> Handle {
        self.handle
    }

    fn enqueue_direct(&self, workload: Arc<Workload>) -> Result<(), QdiscError> {
        {
            let mut queue = self.lock_queue();
            if queue.completed {
                return Err(QdiscError::Completed);
            }
            workload.mark_scheduled(self.weak_self.clone())?;
            queue.entries.push_back(workload);
        }
        // the workload is visible; only now may the notification climb
        self.notify_parent();
        Ok(())
    }

    fn try_enqueue(&self, _state: &dyn Any, _workload: Arc<Workload>) -> Result<(), QdiscError> {
        // leaves carry no classification predicate
        Err(QdiscError::Unclassifiable)
    }

    fn try_enqueue_by_handle(
        &self,
        handle: Handle,
        workload: Arc<Workload>,
    ) -> Result<(), QdiscError> {
        if handle.is_anon() {
            return Err(QdiscError::ZeroHandle);
        }
        if handle == self.handle {
            self.enqueue_direct(workload)
        } else {
            Err(QdiscError::NoRoute(handle))
        }
    }

    fn try_dequeue(&self, _worker_id: usize, _back_track: bool) -> Option<Arc<Workload>> {
        let mut queue = self.lock_queue();
        while let Some(workload) = queue.entries.pop_front() {
            if workload.is_terminal() {
                // soft-deleted entry, discard and keep looking
                tracing::trace!(workload = workload.id(), "skipping soft-deleted workload");
                continue;
            }
            return Some(workload);
        }
        None
    }

    fn try_peek(&self) -> Option<Arc<Workload>> {
        let queue = self.lock_queue();
        queue
            .entries
            .iter()
            .find(|w| !w.is_terminal())
            .cloned()
    }

    fn try_remove(&self, workload: &Arc<Workload>) -> bool {
        let mut queue = self.lock_queue();
        let Some(index) = queue
            .entries
            .iter()
            .position(|w| Arc::ptr_eq(w, workload))
        else {
            return false;
        };
        queue.entries.remove(index);
        true
    }

    fn is_empty(&self) -> bool {
        let queue = self.lock_queue();
        !queue.entries.iter().any(|w| !w.is_terminal())
    }

    fn best_effort_count(&self) -> usize {
        let queue = self.lock_queue();
        queue.entries.iter().filter(|w| !w.is_terminal()).count()
    }

    fn can_classify(&self, _state: &dyn Any) -> bool {
        false
    }

    fn try_find_route(&self, _handle: Handle, _path: &mut RoutingPath) -> bool {
        false
    }

    fn will_enqueue_from_routing_path(&self, _child_index: usize) {}

    fn complete(&self) {
        self.lock_queue().completed = true;
    }

    fn drain(&self) -> Vec<Arc<Workload>> {
        let mut queue = self.lock_queue();
        queue
            .entries
            .drain(..)
            .filter(|w| !w.is_terminal())
            .collect()
    }

    fn on_worker_terminated(&self, _worker_id: usize) {}

    fn bind_parent(&self, parent: Weak<dyn ParentLink>, child_index: usize) {
        self.self_index.store(child_index, Ordering::Release);
        *self.parent.write().unwrap_or_else(PoisonError::into_inner) = Some(parent);
    }

    fn set_child_index(&self, index: usize) {
        self.self_index.store(index, Ordering::Release);
    }
}

impl fmt::Debug for FifoLeaf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FifoLeaf")
            .field("handle", &self.handle)
            .field("len", &self.best_effort_count())
            .finish_non_exhaustive()
    }
}

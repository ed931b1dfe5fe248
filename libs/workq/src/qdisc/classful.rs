// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::QdiscError;
use crate::handle::Handle;
use crate::loom::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use crate::loom::sync::{Arc, RwLock, Weak};
use crate::qdisc::tracking::Tracking;
use crate::qdisc::{FifoLeaf, ParentLink, Qdisc, RoutingPath};
use crate::workload::Workload;
use core::any::Any;
use core::fmt;
use std::sync::PoisonError;
use std::time::{Duration, Instant};
use util::{Backoff, CachePadded};

/// A classification predicate over caller-supplied state.
pub type Predicate = Box<dyn Fn(&dyn Any) -> bool + Send + Sync>;

/// Builds a [`Predicate`] from a typed closure; state of any other type is
/// rejected.
pub fn classify_fn<S, F>(f: F) -> Predicate
where
    S: 'static,
    F: Fn(&S) -> bool + Send + Sync + 'static,
{
    Box::new(move |state| state.downcast_ref::<S>().is_some_and(&f))
}

/// Child-visiting order of a classful node.
///
/// Round-robin rotates a shared index across pick calls; strict priority
/// scans children in registration (priority) order.
pub trait Policy: Send + Sync + 'static {
    /// Short name for diagnostics.
    const KIND: &'static str;

    fn new() -> Self;

    /// Index of the child to visit for attempt `attempt` of a scan over `n`
    /// children.
    fn pick(&self, attempt: usize, n: usize) -> usize;
}

/// A classful inner node: an ordered set of children behind a scheduling
/// policy, with per-child emptiness tracking.
///
/// Child index 0 is always the node's own anonymous local queue; it is the
/// sole target for workloads matching the node's classification predicate
/// and carries the node's handle identity for routing.
pub struct Classful<P: Policy, T: Tracking> {
    handle: Handle,
    predicate: Option<Predicate>,
    /// The anonymous local queue, also present as child index 0.
    local: Arc<FifoLeaf>,
    /// Copy-on-write child snapshot: readers clone the `Arc` and scan
    /// without holding the lock; mutations rebuild under the write lock.
    children: RwLock<Arc<[ChildEntry]>>,
    tracking: T,
    policy: P,
    /// Per-worker "last dequeued child" cache; value is index + 1, zero
    /// meaning none. Each cell is exclusively owned by its worker, padded so
    /// neighbouring workers do not share a cache line.
    last_dequeued: Box<[CachePadded<AtomicUsize>]>,
    parent: RwLock<Option<Weak<dyn ParentLink>>>,
    self_index: AtomicUsize,
    completed: AtomicBool,
    weak_self: Weak<Classful<P, T>>,
}

#[derive(Clone)]
pub(crate) struct ChildEntry {
    node: Arc<dyn Qdisc>,
    /// Caller priority under strict-priority policies; insertion order
    /// elsewhere. The local queue carries no priority.
    priority: u32,
}

// === impl Classful ===

impl<P: Policy, T: Tracking> Classful<P, T> {
    /// Creates a classful node without a classification predicate; it is
    /// reachable only by handle.
    ///
    /// `max_concurrency` sizes the per-worker backtracking cache and should
    /// match the worker-pool size of the owning scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`QdiscError::ZeroHandle`] for the reserved anonymous handle.
    pub fn new(handle: Handle, max_concurrency: usize) -> Result<Arc<Self>, QdiscError> {
        Self::with_predicate(handle, max_concurrency, None)
    }

    /// Creates a classful node with an optional classification predicate.
    ///
    /// # Errors
    ///
    /// Returns [`QdiscError::ZeroHandle`] for the reserved anonymous handle.
    pub fn with_predicate(
        handle: Handle,
        max_concurrency: usize,
        predicate: Option<Predicate>,
    ) -> Result<Arc<Self>, QdiscError> {
        if handle.is_anon() {
            return Err(QdiscError::ZeroHandle);
        }
        Ok(Arc::new_cyclic(|weak_self| {
            let local = FifoLeaf::local();
            local.bind_parent(weak_self.clone() as Weak<dyn ParentLink>, 0);

            let tracking = T::new();
            tracking.insert_child(0);

            let entry = ChildEntry {
                node: local.clone() as Arc<dyn Qdisc>,
                priority: 0,
            };
            Self {
                handle,
                predicate,
                local,
                children: RwLock::new(Arc::from(vec![entry])),
                tracking,
                policy: P::new(),
                last_dequeued: (0..max_concurrency)
                    .map(|_| CachePadded::new(AtomicUsize::new(0)))
                    .collect(),
                parent: RwLock::new(None),
                self_index: AtomicUsize::new(0),
                completed: AtomicBool::new(false),
                weak_self: weak_self.clone(),
            }
        }))
    }

    /// Detaches `child`, draining any residual workloads into this node's
    /// local queue.
    ///
    /// The call first waits up to `timeout` for the child to run empty, then
    /// completes it (no further enqueues), drains the residue, and unlinks
    /// it.
    ///
    /// # Errors
    ///
    /// Returns [`QdiscError::ChildNotFound`] if `child` is not attached to
    /// this node.
    pub fn try_remove_child(
        &self,
        child: &Arc<dyn Qdisc>,
        timeout: Duration,
    ) -> Result<(), QdiscError> {
        // grace period: give in-flight workloads a chance to be consumed
        let deadline = Instant::now() + timeout;
        let mut backoff = Backoff::new();
        while !child.is_empty() && Instant::now() < deadline {
            backoff.spin();
        }

        // no further enqueues into the departing subtree
        child.complete();

        {
            let mut children = self.write_children();
            let Some(index) = children
                .iter()
                .position(|e| Arc::ptr_eq(&e.node, child))
            else {
                return Err(QdiscError::ChildNotFound(child.handle()));
            };
            debug_assert_ne!(index, 0, "the local queue is not removable");

            let mut rebuilt = children.to_vec();
            rebuilt.remove(index);
            *children = Arc::from(rebuilt);
            self.tracking.remove_child(index);
            for (i, entry) in children.iter().enumerate().skip(index) {
                entry.node.set_child_index(i);
            }
        }

        let residue = child.drain();
        if !residue.is_empty() {
            tracing::debug!(
                node = %self.handle,
                child = %child.handle(),
                count = residue.len(),
                "draining residual workloads into the local queue"
            );
            self.local.restore(residue);
        }
        Ok(())
    }

    /// Core child registration; `place` chooses the insertion index from the
    /// current (locked) child set and performs policy-specific checks.
    pub(crate) fn add_child_with(
        &self,
        child: Arc<dyn Qdisc>,
        priority: u32,
        place: impl FnOnce(&[ChildEntry]) -> Result<usize, QdiscError>,
    ) -> Result<(), QdiscError> {
        if child.handle().is_anon() {
            return Err(QdiscError::ZeroHandle);
        }
        if self.completed.load(Ordering::Acquire) {
            return Err(QdiscError::Completed);
        }

        let index = {
            let mut children = self.write_children();
            if children.iter().any(|e| e.node.handle() == child.handle()) {
                return Err(QdiscError::DuplicateHandle(child.handle()));
            }
            let index = place(&children)?;
            debug_assert!(index >= 1 && index <= children.len());

            let mut rebuilt = children.to_vec();
            rebuilt.insert(
                index,
                ChildEntry {
                    node: child.clone(),
                    priority,
                },
            );
            *children = Arc::from(rebuilt);
            self.tracking.insert_child(index);
            child.bind_parent(self.weak_self.clone() as Weak<dyn ParentLink>, index);
            for (i, entry) in children.iter().enumerate().skip(index + 1) {
                entry.node.set_child_index(i);
            }
            index
        };

        // adopt pre-existing work
        if !child.is_empty() {
            self.on_work_scheduled(index);
        }
        tracing::debug!(node = %self.handle, child = %child.handle(), index, "child attached");
        Ok(())
    }

    fn snapshot(&self) -> Arc<[ChildEntry]> {
        self.children
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn write_children(
        &self,
    ) -> crate::loom::sync::RwLockWriteGuard<'_, Arc<[ChildEntry]>> {
        self.children.write().unwrap_or_else(PoisonError::into_inner)
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

    fn remember_dequeue(&self, worker_id: usize, child_index: usize) {
        if let Some(cell) = self.last_dequeued.get(worker_id) {
            cell.store(child_index + 1, Ordering::Relaxed);
        }
    }

    /// Backtracking: retry the child that last yielded work for this worker
    /// before consulting the policy, so same-child bursts are consumed
    /// contiguously.
    fn try_backtrack(&self, worker_id: usize) -> Option<Arc<Workload>> {
        let cell = self.last_dequeued.get(worker_id)?;
        let cached = cell.load(Ordering::Relaxed);
        if cached == 0 {
            return None;
        }
        let index = cached - 1;
        let snapshot = self.snapshot();
        if let Some(entry) = snapshot.get(index) {
            if let Some(workload) = entry.node.try_dequeue(worker_id, true) {
                return Some(workload);
            }
        }
        cell.store(0, Ordering::Relaxed);
        None
    }

    /// One guarded visit of child `index`: dequeue if the emptiness bit is
    /// set, clearing the bit (guarded) when the child turns out empty.
    fn visit_child(
        &self,
        snapshot: &[ChildEntry],
        index: usize,
        worker_id: usize,
        back_track: bool,
    ) -> Option<Arc<Workload>> {
        let (mut marked, mut token) = self.tracking.observe(index)?;
        loop {
            if !marked {
                return None;
            }
            if let Some(workload) = snapshot[index].node.try_dequeue(worker_id, back_track) {
                self.remember_dequeue(worker_id, index);
                return Some(workload);
            }
            // the child looked non-empty but yielded nothing: clear the bit,
            // unless a writer marked it again in the meantime, in which case
            // re-sample and retry the child
            if self.tracking.try_clear(index, token) {
                return None;
            }
            (marked, token) = self.tracking.observe(index)?;
        }
    }
}

impl<P: Policy, T: Tracking> Qdisc for Classful<P, T> {
    fn handle(&self) -> Handle {
        self.handle
    }

    fn enqueue_direct(&self, workload: Arc<Workload>) -> Result<(), QdiscError> {
        if self.completed.load(Ordering::Acquire) {
            return Err(QdiscError::Completed);
        }
        // lands in the local queue, whose notification marks our bit 0
        self.local.enqueue_direct(workload)
    }

    fn try_enqueue(&self, state: &dyn Any, workload: Arc<Workload>) -> Result<(), QdiscError> {
        if self.predicate.as_ref().is_some_and(|p| p(state)) {
            return self.enqueue_direct(workload);
        }
        let snapshot = self.snapshot();
        for entry in snapshot.iter().skip(1) {
            if entry.node.can_classify(state) {
                return entry.node.try_enqueue(state, workload);
            }
        }
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
            return self.enqueue_direct(workload);
        }

        let snapshot = self.snapshot();
        // a directly attached child?
        for (index, entry) in snapshot.iter().enumerate().skip(1) {
            if entry.node.handle() == handle {
                self.will_enqueue_from_routing_path(index);
                return entry.node.enqueue_direct(workload);
            }
        }
        // otherwise ask each child for a route and commit along it
        let mut path = RoutingPath::new();
        for (index, entry) in snapshot.iter().enumerate().skip(1) {
            path.reset();
            if entry.node.try_find_route(handle, &mut path) {
                path.push_hop(self.self_arc(), index, handle);
                return path.commit(workload);
            }
        }
        Err(QdiscError::NoRoute(handle))
    }

    fn try_dequeue(&self, worker_id: usize, back_track: bool) -> Option<Arc<Workload>> {
        if back_track {
            if let Some(workload) = self.try_backtrack(worker_id) {
                return Some(workload);
            }
        }

        loop {
            let snapshot = self.snapshot();
            let n = snapshot.len();
            if n == 0 || !self.tracking.any_marked() {
                return None;
            }
            for attempt in 0..n {
                let index = self.policy.pick(attempt, n);
                if index >= n {
                    // racing structural change, the next round re-snapshots
                    continue;
                }
                if let Some(workload) = self.visit_child(&snapshot, index, worker_id, back_track)
                {
                    return Some(workload);
                }
            }
            if !self.tracking.any_marked() {
                return None;
            }
            // bits were set while we scanned, run another round
        }
    }

    fn try_peek(&self) -> Option<Arc<Workload>> {
        let snapshot = self.snapshot();
        snapshot.iter().find_map(|entry| entry.node.try_peek())
    }

    fn try_remove(&self, workload: &Arc<Workload>) -> bool {
        let snapshot = self.snapshot();
        snapshot.iter().any(|entry| entry.node.try_remove(workload))
    }

    fn is_empty(&self) -> bool {
        let snapshot = self.snapshot();
        snapshot.iter().all(|entry| entry.node.is_empty())
    }

    fn best_effort_count(&self) -> usize {
        let snapshot = self.snapshot();
        snapshot
            .iter()
            .map(|entry| entry.node.best_effort_count())
            .sum()
    }

    fn can_classify(&self, state: &dyn Any) -> bool {
        if self.predicate.as_ref().is_some_and(|p| p(state)) {
            return true;
        }
        let snapshot = self.snapshot();
        snapshot
            .iter()
            .skip(1)
            .any(|entry| entry.node.can_classify(state))
    }

    fn try_find_route(&self, handle: Handle, path: &mut RoutingPath) -> bool {
        let snapshot = self.snapshot();
        for (index, entry) in snapshot.iter().enumerate().skip(1) {
            if entry.node.handle() == handle {
                path.set_target(entry.node.clone());
                path.push_hop(self.self_arc(), index, handle);
                return true;
            }
        }
        for (index, entry) in snapshot.iter().enumerate().skip(1) {
            if entry.node.try_find_route(handle, path) {
                path.push_hop(self.self_arc(), index, handle);
                return true;
            }
        }
        false
    }

    fn will_enqueue_from_routing_path(&self, child_index: usize) {
        // pre-arm: over-estimating emptiness is always safe
        self.tracking.mark(child_index);
    }

    fn complete(&self) {
        self.completed.store(true, Ordering::Release);
        let snapshot = self.snapshot();
        for entry in snapshot.iter() {
            entry.node.complete();
        }
    }

    fn drain(&self) -> Vec<Arc<Workload>> {
        let snapshot = self.snapshot();
        snapshot
            .iter()
            .flat_map(|entry| entry.node.drain())
            .collect()
    }

    fn on_worker_terminated(&self, worker_id: usize) {
        if let Some(cell) = self.last_dequeued.get(worker_id) {
            cell.store(0, Ordering::Relaxed);
        }
        let snapshot = self.snapshot();
        for entry in snapshot.iter() {
            entry.node.on_worker_terminated(worker_id);
        }
    }

    fn bind_parent(&self, parent: Weak<dyn ParentLink>, child_index: usize) {
        self.self_index.store(child_index, Ordering::Release);
        *self.parent.write().unwrap_or_else(PoisonError::into_inner) = Some(parent);
    }

    fn set_child_index(&self, index: usize) {
        self.self_index.store(index, Ordering::Release);
    }
}

impl<P: Policy, T: Tracking> ParentLink for Classful<P, T> {
    fn on_work_scheduled(&self, child_index: usize) {
        self.tracking.mark(child_index);
        self.notify_parent();
    }
}

impl<P: Policy, T: Tracking> Classful<P, T> {
    fn self_arc(&self) -> Arc<dyn Qdisc> {
        self.weak_self
            .upgrade()
            .expect("a live node is reachable through its own methods")
    }
}

impl<P: Policy, T: Tracking> fmt::Debug for Classful<P, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Classful")
            .field("kind", &P::KIND)
            .field("handle", &self.handle)
            .field("children", &self.snapshot().len())
            .field("tracking", &self.tracking)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for ChildEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildEntry")
            .field("handle", &self.node.handle())
            .field("priority", &self.priority)
            .finish()
    }
}

impl ChildEntry {
    pub(crate) fn priority(&self) -> u32 {
        self.priority
    }
}

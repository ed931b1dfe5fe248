// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::QdiscError;
use crate::loom::sync::Arc;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::qdisc::classful::{Classful, Policy};
use crate::qdisc::tracking::{BitmapTracking, LockedTracking, Tracking};
use crate::qdisc::Qdisc;
use util::CachePadded;

/// Round-robin child rotation.
///
/// A monotonic index, advanced by fetch-and-increment modulo the child
/// count, picks the next child per dequeue attempt; under steady load every
/// non-empty child is visited once per rotation.
pub struct RrPolicy {
    rr_index: CachePadded<AtomicUsize>,
}

/// Round-robin qdisc over the lock-free emptiness bitmap.
pub type RoundRobinBitmap = Classful<RrPolicy, BitmapTracking>;

/// Round-robin qdisc over the coarse-locked bit vector, for low-contention
/// deployments.
pub type RoundRobinLocked = Classful<RrPolicy, LockedTracking>;

// === impl RrPolicy ===

impl Policy for RrPolicy {
    const KIND: &'static str = "round-robin";

    fn new() -> Self {
        Self {
            rr_index: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    fn pick(&self, _attempt: usize, n: usize) -> usize {
        debug_assert!(n > 0);
        self.rr_index.fetch_add(1, Ordering::Relaxed) % n
    }
}

impl<T: Tracking> Classful<RrPolicy, T> {
    /// Appends `child` to the rotation.
    ///
    /// # Errors
    ///
    /// Returns [`QdiscError::ZeroHandle`] for the reserved handle,
    /// [`QdiscError::DuplicateHandle`] if a sibling carries the same handle,
    /// and [`QdiscError::Completed`] if this node was completed.
    pub fn try_add_child(&self, child: Arc<dyn Qdisc>) -> Result<(), QdiscError> {
        self.add_child_with(child, 0, |entries| Ok(entries.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Handle;
    use crate::qdisc::FifoLeaf;
    use crate::workload::Workload;

    fn noop() -> Arc<Workload> {
        Workload::new(|_ctx| Ok(()))
    }

    fn setup<T: Tracking>() -> (Arc<Classful<RrPolicy, T>>, Arc<dyn Qdisc>, Arc<dyn Qdisc>) {
        let root = Classful::<RrPolicy, T>::new(Handle::new(1), 2).unwrap();
        let a: Arc<dyn Qdisc> = FifoLeaf::new(Handle::new(10)).unwrap();
        let b: Arc<dyn Qdisc> = FifoLeaf::new(Handle::new(11)).unwrap();
        root.try_add_child(a.clone()).unwrap();
        root.try_add_child(b.clone()).unwrap();
        (root, a, b)
    }

    fn alternates_between_children<T: Tracking>() {
        let (root, a, b) = setup::<T>();
        for _ in 0..3 {
            a.enqueue_direct(noop()).unwrap();
        }
        for _ in 0..3 {
            b.enqueue_direct(noop()).unwrap();
        }

        // six dequeues alternate A, B, A, B, A, B (backtracking off)
        let mut sources = Vec::new();
        for _ in 0..6 {
            let before_a = a.best_effort_count();
            let w = root.try_dequeue(0, false).expect("work is queued");
            assert!(!w.is_terminal());
            sources.push(if a.best_effort_count() < before_a {
                'a'
            } else {
                'b'
            });
        }
        assert_eq!(sources, vec!['a', 'b', 'a', 'b', 'a', 'b']);
        assert!(root.try_dequeue(0, false).is_none());
        assert!(root.is_empty());
    }

    #[test]
    fn bitmap_variant_alternates() {
        alternates_between_children::<BitmapTracking>();
    }

    #[test]
    fn locked_variant_alternates() {
        alternates_between_children::<LockedTracking>();
    }

    #[test]
    fn fairness_window() {
        let (root, a, b) = setup::<BitmapTracking>();
        for _ in 0..20 {
            a.enqueue_direct(noop()).unwrap();
            b.enqueue_direct(noop()).unwrap();
        }

        // over any window of k*n dequeues the per-child counts differ by at
        // most n-1
        let mut from_a = 0_i64;
        let mut from_b = 0_i64;
        for _ in 0..40 {
            let before_a = a.best_effort_count();
            root.try_dequeue(0, false).expect("work is queued");
            if a.best_effort_count() < before_a {
                from_a += 1;
            } else {
                from_b += 1;
            }
            assert!((from_a - from_b).abs() <= 1);
        }
    }

    #[test]
    fn backtracking_prefers_the_last_child() {
        let (root, a, b) = setup::<BitmapTracking>();
        for _ in 0..3 {
            a.enqueue_direct(noop()).unwrap();
        }
        b.enqueue_direct(noop()).unwrap();

        // first dequeue establishes the cache, subsequent backtracking
        // dequeues stay on the same child while it has work
        let first_from_a = {
            let before_a = a.best_effort_count();
            root.try_dequeue(0, true).unwrap();
            a.best_effort_count() < before_a
        };
        if first_from_a {
            let before_a = a.best_effort_count();
            root.try_dequeue(0, true).unwrap();
            assert!(a.best_effort_count() < before_a, "burst consumed contiguously");
        }
    }

    #[test]
    fn duplicate_handles_are_rejected() {
        let (root, _a, _b) = setup::<BitmapTracking>();
        let dup: Arc<dyn Qdisc> = FifoLeaf::new(Handle::new(10)).unwrap();
        assert!(matches!(
            root.try_add_child(dup),
            Err(QdiscError::DuplicateHandle(_))
        ));
    }

    #[test]
    fn enqueue_by_handle_reaches_nested_nodes() {
        let root = Classful::<RrPolicy, BitmapTracking>::new(Handle::new(1), 2).unwrap();
        let mid = Classful::<RrPolicy, BitmapTracking>::new(Handle::new(2), 2).unwrap();
        let leaf: Arc<dyn Qdisc> = FifoLeaf::new(Handle::new(3)).unwrap();
        mid.try_add_child(leaf.clone()).unwrap();
        root.try_add_child(mid.clone() as Arc<dyn Qdisc>).unwrap();

        root.try_enqueue_by_handle(Handle::new(3), noop()).unwrap();
        assert_eq!(leaf.best_effort_count(), 1);

        // routing to the classful node itself lands in its local queue
        root.try_enqueue_by_handle(Handle::new(2), noop()).unwrap();
        assert_eq!(root.best_effort_count(), 2);

        assert!(matches!(
            root.try_enqueue_by_handle(Handle::new(99), noop()),
            Err(QdiscError::NoRoute(_))
        ));

        // both workloads drain through the root
        assert!(root.try_dequeue(0, false).is_some());
        assert!(root.try_dequeue(0, false).is_some());
        assert!(root.try_dequeue(0, false).is_none());
    }

    #[test]
    fn classification_routes_to_the_matching_subtree() {
        use crate::qdisc::classify_fn;

        #[derive(Debug)]
        struct Tag(u32);

        let root = Classful::<RrPolicy, BitmapTracking>::new(Handle::new(1), 2).unwrap();
        let evens = Classful::<RrPolicy, BitmapTracking>::with_predicate(
            Handle::new(2),
            2,
            Some(classify_fn(|tag: &Tag| tag.0 % 2 == 0)),
        )
        .unwrap();
        let odds = Classful::<RrPolicy, BitmapTracking>::with_predicate(
            Handle::new(3),
            2,
            Some(classify_fn(|tag: &Tag| tag.0 % 2 == 1)),
        )
        .unwrap();
        root.try_add_child(evens.clone() as Arc<dyn Qdisc>).unwrap();
        root.try_add_child(odds.clone() as Arc<dyn Qdisc>).unwrap();

        assert!(root.can_classify(&Tag(4)));
        assert!(root.can_classify(&Tag(7)));
        assert!(!root.can_classify(&"unrelated state"));

        root.try_enqueue(&Tag(4), noop()).unwrap();
        root.try_enqueue(&Tag(7), noop()).unwrap();
        assert_eq!(evens.best_effort_count(), 1);
        assert_eq!(odds.best_effort_count(), 1);

        assert!(matches!(
            root.try_enqueue(&"unrelated state", noop()),
            Err(QdiscError::Unclassifiable)
        ));
    }

    #[test]
    fn remove_child_drains_residue_into_local_queue() {
        let (root, a, _b) = setup::<BitmapTracking>();
        for _ in 0..3 {
            a.enqueue_direct(noop()).unwrap();
        }

        root.try_remove_child(&a, std::time::Duration::from_millis(10))
            .unwrap();
        // the residue lives on in the root's local queue
        assert_eq!(root.best_effort_count(), 3);
        for _ in 0..3 {
            assert!(root.try_dequeue(0, false).is_some());
        }

        // the detached child no longer accepts work
        assert!(matches!(
            a.enqueue_direct(noop()),
            Err(QdiscError::Completed)
        ));
        assert!(matches!(
            root.try_remove_child(&a, std::time::Duration::ZERO),
            Err(QdiscError::ChildNotFound(_))
        ));
    }
}

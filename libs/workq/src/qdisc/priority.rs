// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::QdiscError;
use crate::loom::sync::Arc;
use crate::qdisc::Qdisc;
use crate::qdisc::classful::{Classful, Policy};
use crate::qdisc::tracking::{BitmapTracking, LockedTracking, Tracking};

/// Strict-priority scanning ("prio-fast").
///
/// Children are kept sorted by their registration priority (lower is more
/// urgent) and scanned in that order on every dequeue; as long as a
/// higher-priority child is non-empty, lower-priority children starve.
pub struct PrioPolicy;

/// Strict-priority qdisc over the lock-free emptiness bitmap.
pub type PrioFastBitmap = Classful<PrioPolicy, BitmapTracking>;

/// Strict-priority qdisc over the coarse-locked bit vector.
pub type PrioFastLocked = Classful<PrioPolicy, LockedTracking>;

// === impl PrioPolicy ===

impl Policy for PrioPolicy {
    const KIND: &'static str = "prio-fast";

    fn new() -> Self {
        Self
    }

    fn pick(&self, attempt: usize, n: usize) -> usize {
        debug_assert!(attempt < n);
        // index 0 is the local queue, scanned first; registered children
        // follow in priority order
        attempt
    }
}

impl<T: Tracking> Classful<PrioPolicy, T> {
    /// Registers `child` at `priority`; lower values are scanned first.
    /// Priority ties between siblings are rejected.
    ///
    /// # Errors
    ///
    /// Returns [`QdiscError::DuplicatePriority`] on a tie,
    /// [`QdiscError::ZeroHandle`] for the reserved handle,
    /// [`QdiscError::DuplicateHandle`] if a sibling carries the same handle,
    /// and [`QdiscError::Completed`] if this node was completed.
    pub fn try_add_child(
        &self,
        child: Arc<dyn Qdisc>,
        priority: u32,
    ) -> Result<(), QdiscError> {
        self.add_child_with(child, priority, move |entries| {
            let mut index = entries.len();
            for (i, entry) in entries.iter().enumerate().skip(1) {
                if entry.priority() == priority {
                    return Err(QdiscError::DuplicatePriority(priority));
                }
                if entry.priority() > priority {
                    index = i;
                    break;
                }
            }
            Ok(index)
        })
    }
}

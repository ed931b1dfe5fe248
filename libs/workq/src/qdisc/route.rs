// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::QdiscError;
use crate::handle::Handle;
use crate::loom::sync::Arc;
use crate::qdisc::Qdisc;
use crate::workload::Workload;
use core::fmt;
use smallvec::SmallVec;

/// A pre-computed enqueue trajectory from a node down to a target.
///
/// Built by [`Qdisc::try_find_route`] and committed in one traversal: every
/// hop pre-arms its emptiness bit, then the workload is enqueued at the
/// final node. Hops are recorded leaf-first (the routing walk pushes on its
/// way back up).
pub struct RoutingPath {
    hops: SmallVec<[RouteHop; 4]>,
    target: Option<Arc<dyn Qdisc>>,
}

struct RouteHop {
    node: Arc<dyn Qdisc>,
    child_index: usize,
    handle: Handle,
}

// === impl RoutingPath ===

impl RoutingPath {
    #[must_use]
    pub fn new() -> Self {
        Self {
            hops: SmallVec::new(),
            target: None,
        }
    }

    /// Discards any recorded route, keeping the allocation.
    pub fn reset(&mut self) {
        self.hops.clear();
        self.target = None;
    }

    /// `true` once a target node has been recorded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.target.is_some()
    }

    pub(crate) fn push_hop(&mut self, node: Arc<dyn Qdisc>, child_index: usize, handle: Handle) {
        self.hops.push(RouteHop {
            node,
            child_index,
            handle,
        });
    }

    pub(crate) fn set_target(&mut self, target: Arc<dyn Qdisc>) {
        debug_assert!(self.target.is_none());
        self.target = Some(target);
    }

    /// Commits the enqueue: pre-arms emptiness tracking on every node along
    /// the path, then enqueues at the recorded target.
    pub(crate) fn commit(&self, workload: Arc<Workload>) -> Result<(), QdiscError> {
        let Some(target) = &self.target else {
            return Err(QdiscError::NoRoute(Handle::ANON));
        };
        for hop in &self.hops {
            hop.node.will_enqueue_from_routing_path(hop.child_index);
        }
        target.enqueue_direct(workload)
    }
}

impl Default for RoutingPath {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RoutingPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut hops = f.debug_list();
        for hop in &self.hops {
            hops.entry(&format_args!("{}[{}]", hop.handle, hop.child_index));
        }
        hops.finish()
    }
}

// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! In-process workload scheduling over a tree of queueing disciplines.
//!
//! Workloads ([`Workload`]) are deferred units of work with a CAS-driven
//! state machine, cancellation, and continuations. A tree of *qdiscs* routes
//! them: classful inner nodes ([`RoundRobinBitmap`], [`PrioFastBitmap`] and
//! their coarse-locked variants) decide which child a worker drains next,
//! classless [`FifoLeaf`] nodes hold the workloads in order. Each classful
//! node tracks per-child emptiness in a [`cbitmap::ConcurrentBitmap`], which
//! keeps the dequeue hot path lock-free.
//!
//! A [`Scheduler`] owns the root of the tree and a fixed pool of worker
//! threads that dequeue, execute, and run continuations; workers park when
//! the tree runs dry and are woken by the enqueue notification chain.
//!
//! ```
//! use workq::{FifoLeaf, Handle, Qdisc, RoundRobinBitmap, Scheduler, Workload};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let root = RoundRobinBitmap::new(Handle::new(1), 2).unwrap();
//! let fast = FifoLeaf::new(Handle::new(10)).unwrap();
//! root.try_add_child(fast.clone() as Arc<dyn Qdisc>).unwrap();
//!
//! let scheduler = Scheduler::builder()
//!     .workers(2)
//!     .build(root as Arc<dyn Qdisc>);
//! scheduler.start();
//!
//! let workload = Workload::new(|_ctx| Ok(()));
//! scheduler
//!     .root()
//!     .try_enqueue_by_handle(Handle::new(10), workload.clone())
//!     .unwrap();
//! assert!(workload.wait(Some(Duration::from_secs(5))));
//! scheduler.stop();
//! ```

mod error;
mod handle;
mod loom;
mod park;
mod qdisc;
mod scheduler;
mod workload;

pub use error::{QdiscError, WorkloadError};
pub use handle::Handle;
pub use qdisc::{
    BitmapTracking, Classful, FifoLeaf, LockedTracking, ParentLink, Policy, Predicate,
    PrioFastBitmap, PrioFastLocked, PrioPolicy, Qdisc, RoundRobinBitmap, RoundRobinLocked,
    RoutingPath, RrPolicy, Tracking, classify_fn,
};
pub use scheduler::{Scheduler, SchedulerBuilder};
pub use workload::{
    CancelSource, ContinueOptions, Workload, WorkloadBuilder, WorkloadContext, WorkloadOutcome,
    WorkloadState,
};

use static_assertions::assert_impl_all;

assert_impl_all!(Workload: Send, Sync);
assert_impl_all!(Scheduler: Send, Sync);
assert_impl_all!(CancelSource: Send, Sync, Clone);
assert_impl_all!(RoundRobinBitmap: Qdisc);
assert_impl_all!(PrioFastLocked: Qdisc);

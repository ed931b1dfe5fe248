// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::handle::Handle;
use core::fmt;

/// Errors returned by qdisc tree operations.
#[derive(Debug)]
pub enum QdiscError {
    /// The reserved zero handle was used for a user node.
    ZeroHandle,
    /// A sibling with the same handle already exists.
    DuplicateHandle(Handle),
    /// A sibling with the same priority already exists under a
    /// strict-priority parent.
    DuplicatePriority(u32),
    /// No node with the requested handle exists below this node.
    NoRoute(Handle),
    /// No classification predicate in the tree accepted the supplied state.
    Unclassifiable,
    /// The child to remove is not attached to this node.
    ChildNotFound(Handle),
    /// The node has been completed and no longer accepts workloads.
    Completed,
    /// The workload has already been bound to a qdisc once.
    AlreadyScheduled,
}

impl fmt::Display for QdiscError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QdiscError::ZeroHandle => {
                f.write_str("the zero handle is reserved for anonymous queues")
            }
            QdiscError::DuplicateHandle(handle) => {
                write!(f, "a child with handle {handle} already exists")
            }
            QdiscError::DuplicatePriority(priority) => {
                write!(f, "a child with priority {priority} already exists")
            }
            QdiscError::NoRoute(handle) => write!(f, "no route to a node with handle {handle}"),
            QdiscError::Unclassifiable => {
                f.write_str("no classification predicate accepted the workload state")
            }
            QdiscError::ChildNotFound(handle) => {
                write!(f, "child {handle} is not attached to this node")
            }
            QdiscError::Completed => f.write_str("the qdisc no longer accepts workloads"),
            QdiscError::AlreadyScheduled => {
                f.write_str("the workload was already scheduled once")
            }
        }
    }
}

impl core::error::Error for QdiscError {}

/// The error slot of a faulted (or canceled) workload.
#[derive(Debug)]
pub enum WorkloadError {
    /// The distinguished cooperative-cancellation kind: a body returning this
    /// transitions the workload to `Canceled` rather than `Faulted`.
    Canceled,
    /// The workload body panicked; the payload is preserved as a message.
    Panicked(String),
    /// The workload body returned an error.
    Failed(Box<dyn core::error::Error + Send + Sync>),
    /// The scheduler observed an impossible state while dispatching the
    /// workload.
    Scheduling(String),
}

impl WorkloadError {
    /// Wraps an arbitrary error value as a body failure.
    pub fn failed<E>(err: E) -> Self
    where
        E: core::error::Error + Send + Sync + 'static,
    {
        WorkloadError::Failed(Box::new(err))
    }
}

impl fmt::Display for WorkloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadError::Canceled => f.write_str("the workload was canceled"),
            WorkloadError::Panicked(msg) => write!(f, "the workload body panicked: {msg}"),
            WorkloadError::Failed(err) => write!(f, "the workload body failed: {err}"),
            WorkloadError::Scheduling(msg) => write!(f, "scheduling failure: {msg}"),
        }
    }
}

impl core::error::Error for WorkloadError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            WorkloadError::Failed(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::{AtomicU8, Ordering};
use core::fmt;
use util::loom_const_fn;

/// Lifecycle state of a workload.
///
/// The status word is the sole source of truth; every transition is a
/// compare-and-swap on it:
///
/// ```text
/// Created ──► Scheduled ──► Running ──► RanToCompletion | Faulted | Canceled
///                 │            │
///                 │            └──► CancellationRequested ──► (terminal)
///                 └──► Canceled            (external cancel before execution)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkloadState {
    /// Constructed, not yet bound to a qdisc.
    Created = 0,
    /// Bound to a qdisc and waiting to be dequeued.
    Scheduled = 1,
    /// An external cancel fired while the body was running; the body is
    /// responsible for honoring it.
    CancellationRequested = 2,
    /// The body is executing on a worker.
    Running = 3,
    /// Terminal: the body completed normally.
    RanToCompletion = 4,
    /// Terminal: the body failed, or the scheduler observed an impossible
    /// state during dispatch.
    Faulted = 5,
    /// Terminal: canceled before execution, or the body honored a
    /// cancellation request.
    Canceled = 6,
}

/// The atomic status word of a workload.
pub(crate) struct AtomicState(AtomicU8);

// === impl WorkloadState ===

impl WorkloadState {
    /// `true` for `RanToCompletion`, `Faulted`, and `Canceled`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkloadState::RanToCompletion | WorkloadState::Faulted | WorkloadState::Canceled
        )
    }

    fn from_bits(bits: u8) -> Self {
        match bits {
            0 => WorkloadState::Created,
            1 => WorkloadState::Scheduled,
            2 => WorkloadState::CancellationRequested,
            3 => WorkloadState::Running,
            4 => WorkloadState::RanToCompletion,
            5 => WorkloadState::Faulted,
            6 => WorkloadState::Canceled,
            _ => unreachable!("invalid workload state {bits}"),
        }
    }
}

impl fmt::Display for WorkloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// === impl AtomicState ===

impl AtomicState {
    loom_const_fn! {
        pub(crate) const fn new() -> Self {
            Self(AtomicU8::new(WorkloadState::Created as u8))
        }
    }

    pub(crate) fn load(&self) -> WorkloadState {
        WorkloadState::from_bits(self.0.load(Ordering::SeqCst))
    }

    /// Single CAS transition attempt, returning the observed state on failure.
    pub(crate) fn transition(
        &self,
        from: WorkloadState,
        to: WorkloadState,
    ) -> Result<(), WorkloadState> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(WorkloadState::from_bits)
    }

    /// Forces the state to `to` from any non-terminal state.
    ///
    /// Returns `false` if a terminal state was observed instead (the word is
    /// then left untouched).
    pub(crate) fn force_terminal(&self, to: WorkloadState) -> bool {
        debug_assert!(to.is_terminal());
        let mut cur = self.load();
        loop {
            if cur.is_terminal() {
                return false;
            }
            match self.transition(cur, to) {
                Ok(()) => return true,
                Err(actual) => cur = actual,
            }
        }
    }
}

impl fmt::Debug for AtomicState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.load(), f)
    }
}

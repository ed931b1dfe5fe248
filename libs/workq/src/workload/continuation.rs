// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::{Arc, Condvar, Mutex};
use crate::workload::DispatchTarget;
use core::fmt;
use std::sync::PoisonError;
use std::time::Instant;

/// A single registered continuation.
pub(crate) struct Continuation {
    action: Action,
    /// Wait-style continuations are scheduled before all others on completion.
    schedule_first: bool,
}

enum Action {
    /// Invoked inline on the completer's thread.
    Inline(Box<dyn FnOnce() + Send>),
    /// Posted to the completing scheduler's pool; falls back to inline
    /// execution when no pool is reachable.
    Dispatch(Box<dyn FnOnce() + Send>),
    /// Wakes a blocked [`Workload::wait`](crate::Workload::wait) call.
    Signal(Arc<WaitSignal>),
}

/// Storage for a workload's continuations.
///
/// The slot steps through `Empty -> Single -> Many -> Sealed`; the transition
/// to `Sealed` happens exactly once, on completion, and drains whatever was
/// registered. Continuations pushed after sealing are handed back to the
/// caller to run inline on its own thread.
pub(crate) struct ContinuationSlot {
    inner: Mutex<SlotState>,
}

enum SlotState {
    Empty,
    Single(Continuation),
    Many(Vec<Continuation>),
    Sealed,
}

/// A one-shot signal pairing [`ContinuationSlot`] with a blocking waiter.
pub(crate) struct WaitSignal {
    state: Mutex<SignalState>,
    cv: Condvar,
}

#[derive(Debug, Clone, Copy, Default)]
struct SignalState {
    /// The workload completed and the signal fired.
    set: bool,
    /// The wait was interrupted by an external cancel source.
    interrupted: bool,
}

// === impl Continuation ===

impl Continuation {
    pub(crate) fn inline(f: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            action: Action::Inline(f),
            schedule_first: false,
        }
    }

    pub(crate) fn dispatch(f: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            action: Action::Dispatch(f),
            schedule_first: false,
        }
    }

    pub(crate) fn signal(signal: Arc<WaitSignal>) -> Self {
        Self {
            action: Action::Signal(signal),
            schedule_first: true,
        }
    }

    /// Marks the continuation to be scheduled before all others.
    #[must_use]
    pub(crate) fn scheduled_first(mut self) -> Self {
        self.schedule_first = true;
        self
    }

    /// Runs the continuation on behalf of the completing thread.
    pub(crate) fn run(self, target: Option<&dyn DispatchTarget>) {
        match self.action {
            Action::Inline(f) => f(),
            Action::Dispatch(f) => match target {
                Some(target) => target.dispatch(f),
                None => f(),
            },
            Action::Signal(signal) => signal.set(),
        }
    }

    fn is_signal(&self, signal: &Arc<WaitSignal>) -> bool {
        match &self.action {
            Action::Signal(s) => Arc::ptr_eq(s, signal),
            _ => false,
        }
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.action {
            Action::Inline(_) => "inline",
            Action::Dispatch(_) => "dispatch",
            Action::Signal(_) => "signal",
        };
        f.debug_struct("Continuation")
            .field("kind", &kind)
            .field("schedule_first", &self.schedule_first)
            .finish()
    }
}

// === impl ContinuationSlot ===

impl ContinuationSlot {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(SlotState::Empty),
        }
    }

    /// Registers a continuation.
    ///
    /// Returns the continuation back if the slot is already sealed; the
    /// caller must then run it inline itself.
    #[must_use]
    pub(crate) fn push(&self, continuation: Continuation) -> Option<Continuation> {
        let mut state = self.lock();
        match &mut *state {
            SlotState::Sealed => return Some(continuation),
            SlotState::Empty => *state = SlotState::Single(continuation),
            state @ SlotState::Single(_) => {
                // second registration upgrades the single action to a list
                let SlotState::Single(first) = core::mem::replace(state, SlotState::Empty) else {
                    unreachable!()
                };
                *state = SlotState::Many(vec![first, continuation]);
            }
            SlotState::Many(list) => list.push(continuation),
        }
        None
    }

    /// One-shot transition to the sealed sentinel.
    ///
    /// Returns the registered continuations with schedule-first entries moved
    /// to the front (stable otherwise). Sealing twice yields nothing.
    pub(crate) fn seal(&self) -> Vec<Continuation> {
        let drained = {
            let mut state = self.lock();
            core::mem::replace(&mut *state, SlotState::Sealed)
        };
        let mut continuations = match drained {
            SlotState::Empty | SlotState::Sealed => Vec::new(),
            SlotState::Single(c) => vec![c],
            SlotState::Many(list) => list,
        };
        // stable partition: wait-style wakeups run before everything else
        continuations.sort_by_key(|c| !c.schedule_first);
        continuations
    }

    /// Removes a previously registered wait signal, so an abandoned wait does
    /// not leak its waker until completion.
    pub(crate) fn remove_signal(&self, signal: &Arc<WaitSignal>) {
        let mut state = self.lock();
        match &mut *state {
            SlotState::Single(c) if c.is_signal(signal) => *state = SlotState::Empty,
            SlotState::Many(list) => list.retain(|c| !c.is_signal(signal)),
            _ => {}
        }
    }

    fn lock(&self) -> crate::loom::sync::MutexGuard<'_, SlotState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ContinuationSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.lock() {
            SlotState::Empty => "empty",
            SlotState::Single(_) => "single",
            SlotState::Many(_) => "many",
            SlotState::Sealed => "sealed",
        };
        f.debug_struct("ContinuationSlot")
            .field("state", &state)
            .finish()
    }
}

// === impl WaitSignal ===

impl WaitSignal {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SignalState::default()),
            cv: Condvar::new(),
        }
    }

    /// Fires the signal: the paired waiter observes completion.
    pub(crate) fn set(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.set = true;
        self.cv.notify_all();
    }

    /// Interrupts the waiter without marking completion.
    pub(crate) fn interrupt(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.interrupted = true;
        self.cv.notify_all();
    }

    /// Blocks until the signal fires, the deadline passes, or the wait is
    /// interrupted. Returns `true` iff the signal fired.
    #[cfg(not(loom))]
    pub(crate) fn wait(&self, deadline: Option<Instant>) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if state.set {
                return true;
            }
            if state.interrupted {
                return false;
            }
            match deadline {
                Some(deadline) => {
                    let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                        return false;
                    };
                    let (guard, _timeout) = self
                        .cv
                        .wait_timeout(state, remaining)
                        .unwrap_or_else(PoisonError::into_inner);
                    state = guard;
                }
                None => {
                    state = self.cv.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Loom has no notion of time, so deadlines degrade to plain waits under
    /// the model.
    #[cfg(loom)]
    pub(crate) fn wait(&self, _deadline: Option<Instant>) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if state.set {
                return true;
            }
            if state.interrupted {
                return false;
            }
            state = self.cv.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl fmt::Debug for WaitSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitSignal").finish_non_exhaustive()
    }
}

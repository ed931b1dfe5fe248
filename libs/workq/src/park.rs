// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::loom::sync::{Arc, Condvar, Mutex};
use core::fmt;
use std::sync::PoisonError;

/// A single worker's parking spot.
///
/// Unparking grants one wake-up credit; a park with a pending credit returns
/// immediately. This closes the race between a worker deciding to sleep and
/// an enqueue trying to wake it.
pub(crate) struct ThreadParker {
    credit: Mutex<bool>,
    cv: Condvar,
}

/// The scheduler's set of parked workers.
///
/// Workers deposit an unpark token before blocking; enqueues wake one (or
/// all, on shutdown) in arbitrary order.
pub(crate) struct ParkingLot {
    /// Number of workers currently inside a park call.
    num_parked: AtomicUsize,
    tokens: Mutex<Vec<Arc<ThreadParker>>>,
}

// === impl ThreadParker ===

impl ThreadParker {
    pub(crate) fn new() -> Self {
        Self {
            credit: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Blocks until a credit is available, consuming it.
    pub(crate) fn park(&self) {
        let mut credit = self.credit.lock().unwrap_or_else(PoisonError::into_inner);
        while !*credit {
            credit = self.cv.wait(credit).unwrap_or_else(PoisonError::into_inner);
        }
        *credit = false;
    }

    /// Grants one credit, waking the parked owner if there is one.
    pub(crate) fn unpark(&self) {
        let mut credit = self.credit.lock().unwrap_or_else(PoisonError::into_inner);
        *credit = true;
        self.cv.notify_one();
    }
}

impl fmt::Debug for ThreadParker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadParker").finish_non_exhaustive()
    }
}

// === impl ParkingLot ===

impl ParkingLot {
    pub(crate) fn new() -> Self {
        Self {
            num_parked: AtomicUsize::new(0),
            tokens: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn num_parked(&self) -> usize {
        self.num_parked.load(Ordering::Acquire)
    }

    /// Deposits the worker's unpark token ahead of blocking.
    pub(crate) fn prepare_park(&self, parker: &Arc<ThreadParker>) {
        self.num_parked.fetch_add(1, Ordering::AcqRel);
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(parker.clone());
    }

    /// The paired bookkeeping once the worker resumes.
    pub(crate) fn finish_park(&self) {
        let prev = self.num_parked.fetch_sub(1, Ordering::AcqRel);
        debug_assert_ne!(prev, 0);
    }

    /// Wakes one parked worker; returns whether a token was consumed. The
    /// order in which workers are woken is not defined.
    pub(crate) fn unpark_one(&self) -> bool {
        let token = self
            .tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match token {
            Some(token) => {
                token.unpark();
                true
            }
            None => false,
        }
    }

    /// Wakes every parked worker, returning how many tokens were consumed.
    pub(crate) fn unpark_all(&self) -> usize {
        let tokens = {
            let mut guard = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
            core::mem::take(&mut *guard)
        };
        let count = tokens.len();
        for token in tokens {
            token.unpark();
        }
        count
    }
}

impl fmt::Debug for ParkingLot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParkingLot")
            .field("num_parked", &self.num_parked())
            .finish_non_exhaustive()
    }
}

// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::hint;

/// Doubling backoff for contended retry loops.
///
/// Each call to [`spin`](Backoff::spin) issues a batch of [spin loop hints]
/// and doubles the batch size for the next call, up to a fixed ceiling. Reset
/// the backoff once the contended operation succeeds.
///
/// [spin loop hints]: hint::spin_loop
#[derive(Debug, Copy, Clone)]
pub struct Backoff {
    /// Number of pause instructions the next `spin` call will issue.
    spins: u32,
}

// === impl Backoff ===

impl Backoff {
    const INITIAL_SPINS: u32 = 1;
    /// Upper bound on the pause instructions issued per call, reached after
    /// eight consecutive `spin`s.
    const MAX_SPINS: u32 = 1 << 8;

    #[must_use]
    pub const fn new() -> Self {
        Self {
            spins: Self::INITIAL_SPINS,
        }
    }

    /// Waits out one backoff step.
    ///
    /// Call this after losing a race to another thread; the wait grows with
    /// every consecutive call so persistent contention degrades into longer
    /// and longer pauses instead of a tight retry hammer.
    #[inline]
    pub fn spin(&mut self) {
        for _ in 0..self.spins {
            yield_to_runtime();
            hint::spin_loop();
        }
        self.spins = (self.spins * 2).min(Self::MAX_SPINS);
    }

    /// Drops back to the initial step size after the contended operation made
    /// progress.
    #[inline]
    pub fn reset(&mut self) {
        self.spins = Self::INITIAL_SPINS;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Pure spinning starves the loom scheduler (and, less dramatically, other
/// test threads on a loaded CI host), so each pause also hands the thread
/// back to the runtime in those builds. See
/// <https://github.com/tokio-rs/loom/issues/162#issuecomment-665128979>
#[inline(always)]
fn yield_to_runtime() {
    #[cfg(loom)]
    loom::thread::yield_now();
    #[cfg(all(test, not(loom)))]
    std::thread::yield_now();
}

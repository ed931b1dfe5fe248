// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::RwLock;
use cbitmap::{BitInfo, ConcurrentBitmap};
use core::fmt;
use std::sync::PoisonError;

/// Per-child emptiness tracking of a classful node.
///
/// One bit per child, an optimistic over-estimate: the bit may be set while
/// the child is empty, but is never clear while the child holds a workload
/// that no dequeue attempt has observed since its last enqueue. Clearing is
/// guarded: a [`Tracking::try_clear`] paired with a stale observation fails,
/// forcing the dequeuer to re-check the child.
pub trait Tracking: Send + Sync + fmt::Debug + 'static {
    /// Observation guard paired with [`Tracking::try_clear`].
    type Token: Copy + fmt::Debug;

    fn new() -> Self;

    /// Flips child `index` to non-empty.
    fn mark(&self, index: usize);

    /// Reads the bit for child `index` together with its guard. `None` if
    /// the index is momentarily out of range (racing structural change).
    fn observe(&self, index: usize) -> Option<(bool, Self::Token)>;

    /// Clears the bit for child `index` iff no writer intervened since the
    /// paired observation. Returns whether the clear was applied.
    fn try_clear(&self, index: usize, token: Self::Token) -> bool;

    /// `true` if any child is believed non-empty.
    fn any_marked(&self) -> bool;

    /// Structural: a child was inserted at `index`; later bits shift up.
    fn insert_child(&self, index: usize);

    /// Structural: the child at `index` was removed; later bits shift down.
    fn remove_child(&self, index: usize);
}

/// Lock-free tracking over a [`ConcurrentBitmap`].
///
/// Reads and guarded clears never take a lock; only the structural child
/// insert/remove path does (inside the bitmap).
pub struct BitmapTracking {
    bits: ConcurrentBitmap,
}

/// Plain bit-vector tracking behind a reader/writer lock, with a coarse
/// per-map generation standing in for the per-segment guard tokens.
///
/// Simpler and less surprising than [`BitmapTracking`] when contention is
/// low.
pub struct LockedTracking {
    inner: RwLock<LockedBits>,
}

#[derive(Debug)]
struct LockedBits {
    bits: Vec<bool>,
    generation: u64,
}

// === impl BitmapTracking ===

impl Tracking for BitmapTracking {
    type Token = BitInfo;

    fn new() -> Self {
        Self {
            bits: ConcurrentBitmap::with_bit_len(0),
        }
    }

    fn mark(&self, index: usize) {
        // a failure means the child raced a structural resize; the enqueue
        // notification that follows re-marks through the new geometry
        let _ = self.bits.set(index);
    }

    fn observe(&self, index: usize) -> Option<(bool, Self::Token)> {
        let info = self.bits.bit_info(index).ok()?;
        Some((info.value, info))
    }

    fn try_clear(&self, index: usize, token: Self::Token) -> bool {
        debug_assert_eq!(token.index, index);
        self.bits.try_update_guarded(token, false).unwrap_or(false)
    }

    fn any_marked(&self) -> bool {
        !self.bits.is_empty()
    }

    fn insert_child(&self, index: usize) {
        self.bits
            .insert_at(index, false)
            .expect("child index is in range under the structural lock");
    }

    fn remove_child(&self, index: usize) {
        self.bits
            .remove_at(index)
            .expect("child index is in range under the structural lock");
    }
}

impl fmt::Debug for BitmapTracking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitmapTracking")
            .field("bits", &self.bits)
            .finish()
    }
}

// === impl LockedTracking ===

impl LockedTracking {
    fn read(&self) -> crate::loom::sync::RwLockReadGuard<'_, LockedBits> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> crate::loom::sync::RwLockWriteGuard<'_, LockedBits> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Tracking for LockedTracking {
    type Token = u64;

    fn new() -> Self {
        Self {
            inner: RwLock::new(LockedBits {
                bits: Vec::new(),
                generation: 0,
            }),
        }
    }

    fn mark(&self, index: usize) {
        let mut inner = self.write();
        if let Some(bit) = inner.bits.get_mut(index) {
            *bit = true;
        }
        inner.generation += 1;
    }

    fn observe(&self, index: usize) -> Option<(bool, Self::Token)> {
        let inner = self.read();
        Some((*inner.bits.get(index)?, inner.generation))
    }

    fn try_clear(&self, index: usize, token: Self::Token) -> bool {
        let mut inner = self.write();
        if inner.generation != token {
            return false;
        }
        if let Some(bit) = inner.bits.get_mut(index) {
            *bit = false;
        }
        inner.generation += 1;
        true
    }

    fn any_marked(&self) -> bool {
        self.read().bits.iter().any(|&b| b)
    }

    fn insert_child(&self, index: usize) {
        let mut inner = self.write();
        inner.bits.insert(index, false);
        inner.generation += 1;
    }

    fn remove_child(&self, index: usize) {
        let mut inner = self.write();
        inner.bits.remove(index);
        inner.generation += 1;
    }
}

impl fmt::Debug for LockedTracking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedTracking")
            .field("inner", &*self.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise<T: Tracking>() {
        let tracking = T::new();
        tracking.insert_child(0);
        tracking.insert_child(1);
        assert!(!tracking.any_marked());

        tracking.mark(1);
        assert!(tracking.any_marked());
        let (marked, token) = tracking.observe(1).unwrap();
        assert!(marked);

        // no intervening writer: the guarded clear applies
        assert!(tracking.try_clear(1, token));
        assert!(!tracking.any_marked());

        // stale guard: the clear must fail
        tracking.mark(1);
        assert!(!tracking.try_clear(1, token));
        assert!(tracking.any_marked());
    }

    #[test]
    fn bitmap_tracking_guards_clears() {
        exercise::<BitmapTracking>();
    }

    #[test]
    fn locked_tracking_guards_clears() {
        exercise::<LockedTracking>();
    }

    #[test]
    fn structural_shift_preserves_bits() {
        let tracking = BitmapTracking::new();
        tracking.insert_child(0);
        tracking.mark(0);

        // a new sibling at the front shifts the marked bit up
        tracking.insert_child(0);
        assert_eq!(tracking.observe(0).map(|(m, _)| m), Some(false));
        assert_eq!(tracking.observe(1).map(|(m, _)| m), Some(true));

        tracking.remove_child(0);
        assert_eq!(tracking.observe(0).map(|(m, _)| m), Some(true));
    }
}

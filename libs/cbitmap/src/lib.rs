// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A growable, hierarchical concurrent bitmap.
//!
//! The bitmap is a tree of 64-bit atomic *segments*, each holding 56 data bits
//! plus an 8-bit ABA guard token. Up to 28 segments form a *cluster*, up to 28
//! clusters (or deeper subtrees) an *internal node*; every non-terminal node
//! carries a summary segment with a 2-bit fill state per child. Single-bit
//! reads and writes are lock-free compare-and-swap loops under a shared read
//! lock; structural mutation (grow, shrink, insert, remove) takes the write
//! lock.
//!
//! The guard tokens let an observer pair a read with a later one-shot CAS: a
//! reader samples [`ConcurrentBitmap::bit_info`], classifies the bit, and a
//! subsequent [`ConcurrentBitmap::try_update_guarded`] fails if any writer got
//! in between. This is what makes bulk scans over the bitmap sound without
//! holding any lock.

mod error;
mod loom;
mod node;
mod segment;

use crate::loom::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use crate::node::{ChildState, Node, max_bits};
use core::fmt;
use std::sync::PoisonError;

pub use crate::error::Error;
pub use crate::node::{CLUSTER_BITS, FANOUT};
pub use crate::segment::{SEGMENT_BITS, Token};

/// A single guarded observation of one bit.
///
/// Returned by [`ConcurrentBitmap::bit_info`]; pass it back to
/// [`ConcurrentBitmap::try_update_guarded`] to make a write conditional on no
/// other writer having touched the owning segment in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitInfo {
    /// The observed bit value.
    pub value: bool,
    /// The owning segment's guard token at observation time.
    pub token: Token,
    /// The observed bit index.
    pub index: usize,
}

/// An unbounded concurrent bitmap, lock-free on the single-bit path.
pub struct ConcurrentBitmap {
    tree: RwLock<Node>,
}

// === impl ConcurrentBitmap ===

impl ConcurrentBitmap {
    /// Creates a bitmap with `bit_len` zeroed bits.
    ///
    /// # Panics
    ///
    /// Panics if `bit_len` exceeds the representable capacity (more than
    /// `usize::MAX` backing bits).
    #[must_use]
    pub fn with_bit_len(bit_len: usize) -> Self {
        let mut node = Node::empty_cluster();
        grow_locked(&mut node, bit_len).expect("requested bitmap size is not representable");
        Self {
            tree: RwLock::new(node),
        }
    }

    /// The current logical length in bits.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// The current tree depth.
    pub fn depth(&self) -> usize {
        self.read().depth()
    }

    /// `true` if no bit is set.
    pub fn is_empty(&self) -> bool {
        self.read().state() == ChildState::Empty
    }

    /// `true` if every logical bit is set. An empty bitmap is not full.
    pub fn is_full(&self) -> bool {
        let tree = self.read();
        tree.len() > 0 && tree.state() == ChildState::Full
    }

    /// Number of set bits.
    pub fn pop_count(&self) -> usize {
        self.read().pop_count()
    }

    /// Returns the value of bit `index`. The result is a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfBounds`] if `index >= len`.
    pub fn is_set(&self, index: usize) -> Result<bool, Error> {
        let tree = self.read();
        check_bounds(index, tree.len())?;
        Ok(tree.is_set(index))
    }

    /// Sets bit `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfBounds`] if `index >= len`.
    pub fn set(&self, index: usize) -> Result<(), Error> {
        self.update(index, true)
    }

    /// Clears bit `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfBounds`] if `index >= len`.
    pub fn clear(&self, index: usize) -> Result<(), Error> {
        self.update(index, false)
    }

    /// Sets bit `index` to `value`, unconditionally.
    ///
    /// Summaries are refreshed bottom-up; the walk stops at the first level
    /// whose entry is unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfBounds`] if `index >= len`.
    pub fn update(&self, index: usize, value: bool) -> Result<(), Error> {
        let tree = self.read();
        check_bounds(index, tree.len())?;
        tree.update(index, value);
        Ok(())
    }

    /// Reads bit `index` together with its segment's guard token in one
    /// observation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfBounds`] if `index >= len`.
    pub fn bit_info(&self, index: usize) -> Result<BitInfo, Error> {
        let tree = self.read();
        check_bounds(index, tree.len())?;
        let (value, token) = tree.bit_info(index);
        Ok(BitInfo {
            value,
            token,
            index,
        })
    }

    /// One-shot guarded write of bit `info.index` to `value`.
    ///
    /// Succeeds only if no writer has touched the owning segment since `info`
    /// was sampled. Returns whether the write was applied; a stale token is
    /// reported as `Ok(false)`, not as an error.
    ///
    /// This takes the structural lock in write mode: a guard mismatch can
    /// cascade through the summary chain, which may cross node boundaries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfBounds`] if `info.index >= len`.
    pub fn try_update_guarded(&self, info: BitInfo, value: bool) -> Result<bool, Error> {
        let tree = self.write();
        check_bounds(info.index, tree.len())?;
        match tree.try_update_guarded(info.index, info.token, value) {
            Ok(_) => Ok(true),
            Err(_actual) => {
                tracing::trace!(index = info.index, "guarded update lost to another writer");
                Ok(false)
            }
        }
    }

    /// Inserts `value` at `index`, shifting all higher bits up by one and
    /// growing the bitmap by one bit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfBounds`] if `index > len` or
    /// [`Error::CapacityOverflow`] if the bitmap cannot grow.
    pub fn insert_at(&self, index: usize, value: bool) -> Result<(), Error> {
        let mut tree = self.write();
        let len = tree.len();
        if index > len {
            return Err(Error::IndexOutOfBounds { index, len });
        }
        grow_locked(&mut tree, 1)?;
        let evicted = tree.shift_insert(index, value);
        debug_assert!(!evicted, "insert after grow cannot evict a live bit");
        tracing::trace!(index, value, len = tree.len(), "insert_at");
        Ok(())
    }

    /// Removes bit `index`, shifting all higher bits down by one and shrinking
    /// the bitmap by one bit. Returns the removed bit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfBounds`] if `index >= len`.
    pub fn remove_at(&self, index: usize) -> Result<bool, Error> {
        let mut tree = self.write();
        let len = tree.len();
        check_bounds(index, len)?;
        let removed = tree.shift_remove(index, false);
        tree.shrink_to(len - 1);
        tracing::trace!(index, removed, len = tree.len(), "remove_at");
        Ok(removed)
    }

    /// Sets every logical bit.
    ///
    /// Bulk fills could cross node boundaries, so this takes the structural
    /// lock in write mode.
    pub fn set_all(&self) {
        self.write().fill(true);
    }

    /// Clears every logical bit.
    pub fn clear_all(&self) {
        self.write().fill(false);
    }

    /// Appends `additional` zeroed bits on the right.
    ///
    /// Growing by zero is a no-op. When the current root is exhausted it is
    /// wrapped in a fresh internal node, incrementing the depth.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapacityOverflow`] if the new length is not
    /// representable.
    pub fn grow(&self, additional: usize) -> Result<(), Error> {
        let mut tree = self.write();
        grow_locked(&mut tree, additional)
    }

    /// Removes `count` bits from the right.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShrinkUnderflow`] if `count > len`.
    pub fn shrink(&self, count: usize) -> Result<(), Error> {
        let mut tree = self.write();
        let len = tree.len();
        if count > len {
            return Err(Error::ShrinkUnderflow { count, len });
        }
        tree.shrink_to(len - count);
        tracing::trace!(count, len = tree.len(), "shrink");
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, Node> {
        self.tree.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Node> {
        self.tree.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ConcurrentBitmap {
    fn default() -> Self {
        Self::with_bit_len(0)
    }
}

impl fmt::Debug for ConcurrentBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tree = self.read();
        f.debug_struct("ConcurrentBitmap")
            .field("len", &tree.len())
            .field("depth", &tree.depth())
            .finish_non_exhaustive()
    }
}

#[inline]
fn check_bounds(index: usize, len: usize) -> Result<(), Error> {
    if index < len {
        Ok(())
    } else {
        Err(Error::IndexOutOfBounds { index, len })
    }
}

/// Grows `node` by `additional` bits, wrapping the root as often as needed.
fn grow_locked(node: &mut Node, additional: usize) -> Result<(), Error> {
    if additional == 0 {
        return Ok(());
    }
    let new_len = node
        .len()
        .checked_add(additional)
        .ok_or(Error::CapacityOverflow)?;
    while new_len > node.capacity() {
        // expand the root to its own maximum, then wrap it in a new internal
        // node and try again one level up
        let cap = node.capacity();
        node.grow_to(cap);
        max_bits(node.depth() + 1).ok_or(Error::CapacityOverflow)?;
        node.wrap();
        tracing::trace!(depth = node.depth(), "bitmap root wrapped");
    }
    node.grow_to(new_len);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;

    #[test]
    fn boundary_bits_and_insert() {
        let bitmap = ConcurrentBitmap::with_bit_len(1568);
        bitmap.set(0).unwrap();
        bitmap.set(1567).unwrap();

        assert_eq!(bitmap.pop_count(), 2);
        assert!(!bitmap.is_full());
        assert!(!bitmap.is_empty());

        bitmap.insert_at(0, false).unwrap();
        assert_eq!(bitmap.len(), 1569);
        assert!(!bitmap.is_set(0).unwrap());
        assert!(bitmap.is_set(1).unwrap(), "old bit 0 shifted up");
        assert!(bitmap.is_set(1568).unwrap(), "old bit 1567 shifted up");
        assert_eq!(bitmap.pop_count(), 2);
    }

    #[test]
    fn grow_increments_depth() {
        let bitmap = ConcurrentBitmap::with_bit_len(56);
        assert_eq!(bitmap.depth(), 1);
        assert!(bitmap.is_empty());

        bitmap.grow(CLUSTER_BITS - 56).unwrap();
        assert_eq!(bitmap.len(), CLUSTER_BITS);
        assert_eq!(bitmap.depth(), 1);
        assert!(bitmap.is_empty());

        bitmap.grow(1).unwrap();
        assert_eq!(bitmap.depth(), 2);
        assert!(bitmap.is_empty());

        bitmap.grow(CLUSTER_BITS * FANOUT - bitmap.len()).unwrap();
        assert_eq!(bitmap.depth(), 2);

        bitmap.grow(1).unwrap();
        assert_eq!(bitmap.len(), CLUSTER_BITS * FANOUT + 1);
        assert_eq!(bitmap.depth(), 3);
        assert!(bitmap.is_empty());

        // growing by zero is a no-op
        bitmap.grow(0).unwrap();
        assert_eq!(bitmap.len(), CLUSTER_BITS * FANOUT + 1);
    }

    #[test]
    fn set_survives_depth_growth() {
        let bitmap = ConcurrentBitmap::with_bit_len(100);
        bitmap.set(99).unwrap();

        bitmap.grow(CLUSTER_BITS * 2).unwrap();
        assert_eq!(bitmap.depth(), 2);
        assert!(bitmap.is_set(99).unwrap());
        assert_eq!(bitmap.pop_count(), 1);
        assert!(!bitmap.is_empty());
    }

    #[test]
    fn out_of_bounds_is_reported() {
        let bitmap = ConcurrentBitmap::with_bit_len(10);
        assert_eq!(
            bitmap.set(10),
            Err(Error::IndexOutOfBounds { index: 10, len: 10 })
        );
        assert!(bitmap.bit_info(11).is_err());
        assert_eq!(
            bitmap.shrink(11),
            Err(Error::ShrinkUnderflow { count: 11, len: 10 })
        );
    }

    #[test]
    fn guarded_update_pairs_with_observation() {
        let bitmap = ConcurrentBitmap::with_bit_len(64);
        bitmap.set(3).unwrap();

        let info = bitmap.bit_info(3).unwrap();
        assert!(info.value);

        // no intervening writer: the guarded clear applies
        assert!(bitmap.try_update_guarded(info, false).unwrap());
        assert!(!bitmap.is_set(3).unwrap());

        // the token is now stale, a second attempt must fail
        assert!(!bitmap.try_update_guarded(info, true).unwrap());
        assert!(!bitmap.is_set(3).unwrap());
    }

    #[test]
    fn guarded_update_fails_after_interleaved_write() {
        let bitmap = ConcurrentBitmap::with_bit_len(64);
        let info = bitmap.bit_info(7).unwrap();

        // a writer sets and clears the bit in between; the segment looks
        // unchanged but the token gives the interleaving away
        bitmap.set(7).unwrap();
        bitmap.clear(7).unwrap();

        assert!(!bitmap.try_update_guarded(info, true).unwrap());
    }

    #[test]
    fn remove_at_shifts_down() {
        let bitmap = ConcurrentBitmap::with_bit_len(120);
        bitmap.set(0).unwrap();
        bitmap.set(60).unwrap();
        bitmap.set(119).unwrap();

        assert!(bitmap.remove_at(0).unwrap());
        assert_eq!(bitmap.len(), 119);
        assert!(bitmap.is_set(59).unwrap());
        assert!(bitmap.is_set(118).unwrap());
        assert_eq!(bitmap.pop_count(), 2);

        assert!(!bitmap.remove_at(1).unwrap());
        assert_eq!(bitmap.len(), 118);
        assert!(bitmap.is_set(58).unwrap());
        assert!(bitmap.is_set(117).unwrap());
    }

    #[test]
    fn bulk_fill() {
        let bitmap = ConcurrentBitmap::with_bit_len(CLUSTER_BITS + 3);
        bitmap.set_all();
        assert!(bitmap.is_full());
        assert_eq!(bitmap.pop_count(), CLUSTER_BITS + 3);

        bitmap.clear_all();
        assert!(bitmap.is_empty());
        assert_eq!(bitmap.pop_count(), 0);
    }

    #[test]
    fn full_and_empty_track_every_bit() {
        let bitmap = ConcurrentBitmap::with_bit_len(70);
        for i in 0..70 {
            bitmap.set(i).unwrap();
        }
        assert!(bitmap.is_full());
        assert_eq!(bitmap.pop_count(), 70);

        bitmap.clear(69).unwrap();
        assert!(!bitmap.is_full());
        assert!(!bitmap.is_empty());

        for i in 0..69 {
            bitmap.clear(i).unwrap();
        }
        assert!(bitmap.is_empty());
    }

    #[test]
    fn concurrent_updates_on_one_segment() {
        use tracing_subscriber::EnvFilter;
        use tracing_subscriber::util::SubscriberInitExt;

        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .set_default();

        loom::model(|| {
            let bitmap = loom::sync::Arc::new(ConcurrentBitmap::with_bit_len(56));

            let handles: Vec<_> = (0..2)
                .map(|i| {
                    let bitmap = bitmap.clone();
                    loom::thread::spawn(move || {
                        bitmap.set(i * 7).unwrap();
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(bitmap.pop_count(), 2);
            assert!(!bitmap.is_empty());
        });
    }

    #[cfg(not(loom))]
    mod reference_model {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Update(usize, bool),
            InsertAt(usize, bool),
            RemoveAt(usize),
            Grow(usize),
            Shrink(usize),
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            prop_oneof![
                (any::<usize>(), any::<bool>()).prop_map(|(i, v)| Op::Update(i, v)),
                (any::<usize>(), any::<bool>()).prop_map(|(i, v)| Op::InsertAt(i, v)),
                any::<usize>().prop_map(Op::RemoveAt),
                (0_usize..200).prop_map(Op::Grow),
                (0_usize..200).prop_map(Op::Shrink),
            ]
        }

        proptest! {
            #[test]
            fn matches_a_plain_bit_vector(
                initial in 0_usize..200,
                ops in proptest::collection::vec(op_strategy(), 1..60),
            ) {
                let bitmap = ConcurrentBitmap::with_bit_len(initial);
                let mut model = vec![false; initial];

                for op in ops {
                    match op {
                        Op::Update(i, v) if !model.is_empty() => {
                            let i = i % model.len();
                            bitmap.update(i, v).unwrap();
                            model[i] = v;
                        }
                        Op::InsertAt(i, v) => {
                            let i = i % (model.len() + 1);
                            bitmap.insert_at(i, v).unwrap();
                            model.insert(i, v);
                        }
                        Op::RemoveAt(i) if !model.is_empty() => {
                            let i = i % model.len();
                            let removed = bitmap.remove_at(i).unwrap();
                            prop_assert_eq!(removed, model.remove(i));
                        }
                        Op::Grow(n) => {
                            bitmap.grow(n).unwrap();
                            model.extend(core::iter::repeat_n(false, n));
                        }
                        Op::Shrink(n) => {
                            let n = if model.is_empty() { 0 } else { n % model.len() };
                            bitmap.shrink(n).unwrap();
                            model.truncate(model.len() - n);
                        }
                        _ => {}
                    }

                    prop_assert_eq!(bitmap.len(), model.len());
                    prop_assert_eq!(
                        bitmap.pop_count(),
                        model.iter().filter(|&&b| b).count()
                    );
                    prop_assert_eq!(bitmap.is_empty(), model.iter().all(|&b| !b));
                }

                for (i, &expected) in model.iter().enumerate() {
                    prop_assert_eq!(bitmap.is_set(i).unwrap(), expected);
                }
            }
        }
    }
}

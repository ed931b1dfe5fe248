// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![expect(
    impl_trait_overcaptures,
    reason = "mycelium_bitfield is not updated to edition 2024 yet"
)]

use crate::loom::sync::atomic::{AtomicU64, Ordering};
use core::fmt;
use static_assertions::const_assert_eq;
use util::loom_const_fn;

/// Number of data bits in one segment word.
pub const SEGMENT_BITS: usize = 56;

/// Mask covering all data bits of a segment word.
pub(crate) const DATA_MASK: u64 = (1 << SEGMENT_BITS) - 1;

const_assert_eq!(SEGMENT_BITS + 8, 64);

mycelium_bitfield::bitfield! {
    /// A snapshot of one segment word.
    ///
    /// ```text
    /// | 63     56 | 55                     0 |
    /// |   token   |        data bits         |
    /// ```
    ///
    /// The token is bumped on every successful write so that a reader can pair
    /// an observation with a later compare-and-swap (see [`Segment::try_update_bit`]).
    #[derive(PartialEq, Eq)]
    pub(crate) struct Word<u64> {
        /// The 56 data bits, LSB first.
        pub(crate) const DATA = 56;
        /// The ABA guard token.
        pub(crate) const TOKEN = 8;
    }
}

/// An opaque guard token sampled from a segment.
///
/// Tokens wrap modulo 256, which yields 256 generations between an observation
/// and the guarded write paired with it. We assume no thread is suspended
/// across 256 or more writes to the same segment; this is documented, not
/// defended at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token(u8);

/// One 64-bit atomic segment: 56 data bits plus an 8-bit guard token.
///
/// All mutation is compare-and-swap on the whole word with sequentially
/// consistent ordering, so every successful write is observable as a unique
/// event through its token.
pub(crate) struct Segment {
    word: AtomicU64,
}

// === impl Word ===

impl Word {
    #[inline]
    pub(crate) fn data(self) -> u64 {
        self.get(Self::DATA)
    }

    #[inline]
    pub(crate) fn token(self) -> Token {
        Token::from_raw(self.get(Self::TOKEN))
    }

    /// Packs `data` with the token following `self`'s.
    #[inline]
    fn bumped(self, data: u64) -> Word {
        debug_assert_eq!(data & !DATA_MASK, 0);
        Word::from_bits(0)
            .with(Self::DATA, data)
            .with(Self::TOKEN, u64::from(self.token().next().0))
    }
}

// === impl Token ===

impl Token {
    #[inline]
    fn from_raw(raw: u64) -> Self {
        #[expect(clippy::cast_possible_truncation, reason = "masked to the low 8 bits")]
        Self((raw & 0xff) as u8)
    }

    #[inline]
    fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

// === impl Segment ===

impl Segment {
    loom_const_fn! {
        pub(crate) const fn new() -> Self {
            Self {
                word: AtomicU64::new(0),
            }
        }
    }

    /// Returns a snapshot of the current word.
    #[inline]
    pub(crate) fn snapshot(&self) -> Word {
        Word::from_bits(self.word.load(Ordering::SeqCst))
    }

    /// Returns the value of bit `index`. The result is a snapshot.
    #[inline]
    pub(crate) fn is_set(&self, index: usize) -> bool {
        debug_assert!(index < SEGMENT_BITS);
        self.snapshot().data() & (1 << index) != 0
    }

    /// Returns the number of set bits among the low `cap` bits.
    #[inline]
    pub(crate) fn pop_count(&self, cap: usize) -> usize {
        debug_assert!(cap <= SEGMENT_BITS);
        (self.snapshot().data() & low_mask(cap)).count_ones() as usize
    }

    /// Sets bit `index` to `value`, bumping the guard token.
    ///
    /// Retries on conflict; always succeeds. Returns the word after the write.
    pub(crate) fn update_bit(&self, index: usize, value: bool) -> Word {
        debug_assert!(index < SEGMENT_BITS);
        self.rmw(|data| {
            if value {
                data | (1 << index)
            } else {
                data & !(1 << index)
            }
        })
    }

    /// One-shot guarded update of bit `index`.
    ///
    /// Fails if the current token differs from `token` or if another writer
    /// intervenes during the compare-and-swap, returning the token observed
    /// instead.
    pub(crate) fn try_update_bit(
        &self,
        token: Token,
        index: usize,
        value: bool,
    ) -> Result<Word, Token> {
        debug_assert!(index < SEGMENT_BITS);
        let cur = self.snapshot();
        if cur.token() != token {
            return Err(cur.token());
        }

        let data = if value {
            cur.data() | (1 << index)
        } else {
            cur.data() & !(1 << index)
        };
        let next = cur.bumped(data);

        self.word
            .compare_exchange(cur.0, next.0, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| next)
            .map_err(|actual| Word::from_bits(actual).token())
    }

    /// Shifts all bits at positions `>= index` up by one within the 56-bit
    /// window, writes `value` at `index`, and bumps the token.
    ///
    /// Returns the bit evicted from position 55.
    pub(crate) fn insert_bit_at(&self, index: usize, value: bool) -> bool {
        debug_assert!(index < SEGMENT_BITS);
        let mut evicted = false;
        self.rmw(|data| {
            evicted = data & (1 << (SEGMENT_BITS - 1)) != 0;
            let low = data & low_mask(index);
            let high = (data & !low_mask(index)) << 1;
            (low | high | (u64::from(value) << index)) & DATA_MASK
        });
        evicted
    }

    /// Removes bit `index`, shifting all higher bits down by one and writing
    /// `carry_in` at position 55. Bumps the token.
    ///
    /// Returns the removed bit.
    pub(crate) fn remove_bit_at(&self, index: usize, carry_in: bool) -> bool {
        debug_assert!(index < SEGMENT_BITS);
        let mut removed = false;
        self.rmw(|data| {
            removed = data & (1 << index) != 0;
            // The departing bit must be cleared before the shift so it cannot
            // be OR'd into its lower neighbour.
            let cleared = data & !(1 << index);
            let low = cleared & low_mask(index);
            let high = (cleared >> 1) & !low_mask(index);
            low | high | (u64::from(carry_in) << (SEGMENT_BITS - 1))
        });
        removed
    }

    /// Sets the low `cap` bits, clearing the rest. Bumps the token.
    pub(crate) fn set_all(&self, cap: usize) -> Word {
        debug_assert!(cap <= SEGMENT_BITS);
        self.rmw(|_| low_mask(cap))
    }

    /// Clears all data bits. Bumps the token.
    pub(crate) fn clear_all(&self) -> Word {
        self.rmw(|_| 0)
    }

    /// Replaces the data bits wholesale.
    ///
    /// With `bump_token` set this is performed as a compare-and-swap loop so
    /// the write is observable through the guard token; otherwise it is a
    /// plain store that also resets the token.
    pub(crate) fn store_data(&self, data: u64, bump_token: bool) {
        debug_assert_eq!(data & !DATA_MASK, 0);
        if bump_token {
            self.rmw(|_| data);
        } else {
            self.word.store(data, Ordering::SeqCst);
        }
    }

    /// One-shot guarded wholesale replacement of the data bits.
    pub(crate) fn try_store_data(&self, token: Token, data: u64) -> Result<Word, Token> {
        debug_assert_eq!(data & !DATA_MASK, 0);
        let cur = self.snapshot();
        if cur.token() != token {
            return Err(cur.token());
        }
        let next = cur.bumped(data);
        self.word
            .compare_exchange(cur.0, next.0, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| next)
            .map_err(|actual| Word::from_bits(actual).token())
    }

    /// Read-modify-write loop over the data bits, bumping the token on the
    /// successful iteration. Returns the word after the write.
    fn rmw(&self, mut f: impl FnMut(u64) -> u64) -> Word {
        let mut cur = self.word.load(Ordering::SeqCst);
        loop {
            let word = Word::from_bits(cur);
            let next = word.bumped(f(word.data()));
            match self.word.compare_exchange_weak(
                cur,
                next.0,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(actual) => cur = actual,
            }
        }
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = self.snapshot();
        f.debug_struct("Segment")
            .field("data", &format_args!("{:#016x}", word.data()))
            .field("token", &word.token())
            .finish()
    }
}

/// Mask of the low `cap` bits of a segment word.
#[inline]
pub(crate) fn low_mask(cap: usize) -> u64 {
    debug_assert!(cap <= SEGMENT_BITS);
    if cap == 0 { 0 } else { DATA_MASK >> (SEGMENT_BITS - cap) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;

    #[test]
    fn update_and_query() {
        loom::model(|| {
            let seg = Segment::new();
            assert!(!seg.is_set(0));

            seg.update_bit(0, true);
            seg.update_bit(55, true);
            assert!(seg.is_set(0));
            assert!(seg.is_set(55));
            assert_eq!(seg.pop_count(SEGMENT_BITS), 2);
            assert_eq!(seg.pop_count(55), 1);

            seg.update_bit(0, false);
            assert!(!seg.is_set(0));
            assert_eq!(seg.pop_count(SEGMENT_BITS), 1);
        });
    }

    #[test]
    fn tokens_are_bumped_on_every_write() {
        loom::model(|| {
            let seg = Segment::new();
            let mut prev = seg.snapshot().token();
            for i in 0..512 {
                seg.update_bit(i % SEGMENT_BITS, i % 2 == 0);
                let cur = seg.snapshot().token();
                assert_eq!(cur, prev.next(), "write {i} must bump the token by one");
                prev = cur;
            }
        });
    }

    #[test]
    fn stale_token_is_rejected() {
        loom::model(|| {
            let seg = Segment::new();
            let stale = seg.snapshot().token();
            seg.update_bit(3, true);

            assert!(seg.try_update_bit(stale, 3, false).is_err());
            // the failed attempt must not have modified anything
            assert!(seg.is_set(3));

            let fresh = seg.snapshot().token();
            assert!(seg.try_update_bit(fresh, 3, false).is_ok());
            assert!(!seg.is_set(3));
        });
    }

    #[test]
    fn insert_shifts_the_tail() {
        loom::model(|| {
            let seg = Segment::new();
            seg.update_bit(0, true);
            seg.update_bit(2, true);
            seg.update_bit(55, true);

            let evicted = seg.insert_bit_at(1, true);
            assert!(evicted, "bit 55 must fall out");
            assert!(seg.is_set(0));
            assert!(seg.is_set(1), "inserted bit");
            assert!(!seg.is_set(2), "old gap moved up");
            assert!(seg.is_set(3), "old bit 2 moved up");
            assert!(!seg.is_set(55));
        });
    }

    #[test]
    fn remove_shifts_the_tail_and_carries_in() {
        loom::model(|| {
            let seg = Segment::new();
            seg.update_bit(0, true);
            seg.update_bit(1, true);
            seg.update_bit(3, true);

            let removed = seg.remove_bit_at(1, true);
            assert!(removed);
            assert!(seg.is_set(0));
            assert!(!seg.is_set(1));
            assert!(seg.is_set(2), "old bit 3 moved down");
            assert!(seg.is_set(55), "carry-in lands at the top");

            let removed = seg.remove_bit_at(5, false);
            assert!(!removed);
            assert!(seg.is_set(54), "carry moved down");
            assert!(!seg.is_set(55));
        });
    }

    #[test]
    fn set_all_and_clear_all() {
        loom::model(|| {
            let seg = Segment::new();
            seg.set_all(10);
            assert_eq!(seg.pop_count(SEGMENT_BITS), 10);
            assert!(seg.is_set(9));
            assert!(!seg.is_set(10));

            seg.set_all(SEGMENT_BITS);
            assert_eq!(seg.pop_count(SEGMENT_BITS), SEGMENT_BITS);

            seg.clear_all();
            assert_eq!(seg.pop_count(SEGMENT_BITS), 0);
        });
    }

    #[test]
    fn concurrent_update_vs_guarded_clear() {
        // A reader samples a token, a writer flips the bit in between, and the
        // reader's guarded CAS must fail instead of clobbering the write.
        loom::model(|| {
            let seg = loom::sync::Arc::new(Segment::new());
            seg.update_bit(7, true);
            let observed = seg.snapshot();

            let writer = {
                let seg = seg.clone();
                loom::thread::spawn(move || {
                    seg.update_bit(7, false);
                    seg.update_bit(7, true);
                })
            };

            let res = seg.try_update_bit(observed.token(), 7, false);
            writer.join().unwrap();

            match res {
                // the guarded clear won the race, the writer then re-set the bit
                Ok(_) => assert!(seg.is_set(7)),
                // the writer got in between: the bit must have survived
                Err(_) => assert!(seg.is_set(7)),
            }
        });
    }
}

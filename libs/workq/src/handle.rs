// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// An opaque, caller-assigned qdisc identifier.
///
/// Two children of the same parent must carry distinct handles. The zero
/// handle is reserved for the anonymous local queues inside classful nodes
/// and is never valid for user-created nodes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u64);

// === impl Handle ===

impl Handle {
    /// The reserved handle of anonymous internal queues.
    pub const ANON: Self = Self(0);

    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// `true` for the reserved anonymous handle.
    #[must_use]
    pub const fn is_anon(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_anon() {
            f.write_str("Handle(anon)")
        } else {
            write!(f, "Handle({})", self.0)
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_anon() {
            f.write_str("anon")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

impl From<u64> for Handle {
    fn from(raw: u64) -> Self {
        Self::new(raw)
    }
}

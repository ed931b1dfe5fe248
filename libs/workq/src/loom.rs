// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(loom)] {
        pub(crate) use loom::model;
        #[cfg(test)]
        pub(crate) use loom::thread;

        pub(crate) mod sync {
            pub(crate) use loom::sync::*;
            // The qdisc tree wires itself up through weak self-references;
            // loom's `Arc` does not model cyclic construction, and plain
            // reference counting is not what the model checks anyway.
            pub(crate) use std::sync::{Arc, Weak};
        }
    } else {
        #[cfg(test)]
        pub(crate) use std::thread;

        #[cfg(test)]
        #[inline(always)]
        pub(crate) fn model<R>(f: impl FnOnce() -> R) -> R {
            f()
        }

        pub(crate) mod sync {
            pub(crate) use std::sync::*;
        }
    }
}

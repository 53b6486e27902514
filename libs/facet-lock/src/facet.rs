// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use bitflags::bitflags;

/// The number of facets a compound lock can protect: `{MAIN, MSGQ, TIMERS,
/// STATUS, TRACE}`. Raising it only requires `FacetSet`'s backing integer to
/// grow.
pub const NUM_FACETS: u32 = 5;

bitflags! {
    /// A set of facets, e.g. the mask passed to [`lock`](crate::lock) or the
    /// `held`/`waiter` fields read out of a [`FacetWord`](crate::word::FacetWord).
    ///
    /// Facets are totally ordered by bit index; that order *is* the lock
    /// order for the actor they belong to.
    #[derive(Clone, Copy, Eq, PartialEq, Default)]
    pub struct FacetSet: u8 {
        /// The actor's execution context (registers, stack, reductions).
        const MAIN = 1 << 0;
        /// The actor's incoming message queue.
        const MSGQ = 1 << 1;
        /// The actor's timer wheel entries.
        const TIMERS = 1 << 2;
        /// Administrative status (exiting, suspended, priority, ...).
        const STATUS = 1 << 3;
        /// Tracing/instrumentation state.
        const TRACE = 1 << 4;
    }
}

static_assertions::const_assert!(FacetSet::all().bits().count_ones() as u32 == NUM_FACETS);

impl FacetSet {
    /// The lowest set bit, or `None` if the set is empty.
    #[must_use]
    pub fn lowest(self) -> Option<Self> {
        if self.is_empty() {
            None
        } else {
            Self::from_bits(1 << self.bits().trailing_zeros())
        }
    }

    /// All facets strictly below `self`'s lowest set bit.
    ///
    /// Used to compute the in-order-free mask in the acquire slow path and
    /// the unlock mask in two-actor safelocking.
    #[must_use]
    pub fn below_lowest(self) -> Self {
        match self.lowest() {
            Some(lowest) => Self::from_bits_truncate(lowest.bits().wrapping_sub(1)),
            None => Self::all(),
        }
    }

    /// Iterates the individual facet bits in ascending order.
    pub fn iter_bits(self) -> impl Iterator<Item = Self> {
        let mut remaining = self;
        core::iter::from_fn(move || {
            let bit = remaining.lowest()?;
            remaining.remove(bit);
            Some(bit)
        })
    }
}

/// A globally unique actor identifier.
///
/// The numeric value *is* the cross-actor lock order: two-actor operations
/// always touch the lower identifier first.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ActorId(pub u64);

impl ActorId {
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-actor compound lock: the atomic word, the wait queues, and the
//! creation/teardown contract around them.

use crate::facet::FacetSet;
use crate::loom::Ordering;
use crate::queue::WaitQueues;
use crate::word::FacetWord;

/// One actor's compound lock: the atomic facet word plus its per-facet wait
/// queues.
///
/// `FacetLock` does not know which stripe covers it: callers hash the
/// actor's identifier against a [`crate::stripe::StripeTable`] themselves,
/// the same way the actor table does for plain lookups.
pub struct FacetLock<W> {
    pub(crate) word: FacetWord,
    pub(crate) queues: WaitQueues<W>,
}

impl<W> Default for FacetLock<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> FacetLock<W> {
    /// Creates a lock in the initial state: all facets held, queues empty.
    /// The creator is counted as already holding every facet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            word: FacetWord::new_all_held(),
            queues: WaitQueues::new(),
        }
    }

    #[must_use]
    pub fn word(&self) -> &FacetWord {
        &self.word
    }

    /// Validates the termination invariant for an actor being torn down.
    ///
    /// # Panics
    ///
    /// Panics (debug builds) if the termination invariant is violated: some
    /// queue is non-empty, or `FW` is not all-held.
    ///
    /// # Safety
    ///
    /// Caller must hold the actor's stripe, or otherwise guarantee there is
    /// no concurrent access (e.g. the actor has already been unpublished
    /// from the actor table).
    pub unsafe fn fin(&self) {
        debug_assert!(
            unsafe { self.queues.all_empty() },
            "fin: actor torn down with non-empty wait queues"
        );
        debug_assert_eq!(
            self.word.load(Ordering::Relaxed).held(),
            FacetSet::all(),
            "fin: actor torn down without holding every facet"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoWaiter;

    #[test]
    fn new_is_all_held_and_empty() {
        let lock: FacetLock<NoWaiter> = FacetLock::new();
        let snap = lock.word().load(Ordering::Relaxed);
        assert_eq!(snap.held(), FacetSet::all());
        assert_eq!(snap.waiter(), FacetSet::empty());
        assert!(unsafe { lock.queues.all_empty() });
    }

    #[test]
    fn fin_accepts_the_initial_state() {
        let lock: FacetLock<NoWaiter> = FacetLock::new();
        unsafe { lock.fin() };
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "without holding every facet")]
    fn fin_rejects_partial_release() {
        let lock: FacetLock<NoWaiter> = FacetLock::new();
        lock.word.band_rel_held(FacetSet::MAIN);
        unsafe { lock.fin() };
    }
}

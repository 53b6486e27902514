// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The atomic facet word: the lock-free fast path for every facet acquire
//! and release that doesn't contend.
//!
//! A single atomic `usize` holds two fields: `held`, one bit per facet, and
//! `waiter`, one bit per facet, shifted up by [`WAITER_SHIFT`]. All
//! uncontended lock/unlock traffic touches only this word.

use crate::facet::FacetSet;
use crate::loom::{AtomicUsize, Ordering};
use util::CachePadded;

/// Bit shift of the `waiter` field. Fixed at build time; must be `>= NUM_FACETS`
/// so the two fields never overlap.
pub const WAITER_SHIFT: u32 = 8;

mycelium_bitfield::bitfield! {
    /// The packed contents of a [`FacetWord`]: `held` bits at `[0, 8)`,
    /// `waiter` bits at `[8, 16)`. Only the low [`facet::NUM_FACETS`](crate::facet::NUM_FACETS)
    /// bits of each byte are meaningful; the rest is reserved.
    #[derive(Eq, PartialEq)]
    struct Bits<usize> {
        const HELD = 8;
        const WAITER = 8;
        const _RESERVED = ..;
    }
}

static_assertions::const_assert!(WAITER_SHIFT == 8);

fn held_of(raw: usize) -> FacetSet {
    #[expect(clippy::cast_possible_truncation, reason = "HELD is an 8 bit field")]
    FacetSet::from_bits_truncate(Bits(raw).get(Bits::HELD) as u8)
}

fn waiter_of(raw: usize) -> FacetSet {
    #[expect(clippy::cast_possible_truncation, reason = "WAITER is an 8 bit field")]
    FacetSet::from_bits_truncate(Bits(raw).get(Bits::WAITER) as u8)
}

fn pack(held: FacetSet, waiter: FacetSet) -> usize {
    Bits(0)
        .with(Bits::HELD, usize::from(held.bits()))
        .with(Bits::WAITER, usize::from(waiter.bits()))
        .0
}

/// A snapshot of a [`FacetWord`] read at some point in time.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct Snapshot(usize);

impl Snapshot {
    #[must_use]
    pub fn held(self) -> FacetSet {
        held_of(self.0)
    }

    #[must_use]
    pub fn waiter(self) -> FacetSet {
        waiter_of(self.0)
    }

    fn raw(self) -> usize {
        self.0
    }
}

/// The atomic facet word of one actor.
///
/// Initial value at actor creation: all held bits set, all waiter bits clear.
/// The creator is considered to already hold everything until it releases
/// facets explicitly.
#[derive(Debug)]
pub struct FacetWord {
    bits: CachePadded<AtomicUsize>,
}

impl FacetWord {
    /// Constructs a word with every facet already held and no waiters.
    #[must_use]
    pub fn new_all_held() -> Self {
        Self {
            bits: CachePadded::from(AtomicUsize::new(pack(FacetSet::all(), FacetSet::empty()))),
        }
    }

    /// Reads the current snapshot. Readers may observe the waiter field
    /// without holding the actor's stripe; a waiter bit read as set is
    /// guaranteed to stay set until the stripe is taken.
    #[must_use]
    pub fn load(&self, order: Ordering) -> Snapshot {
        Snapshot(self.bits.load(order))
    }

    /// `BOR-acq`: atomic OR of `held=mask`, acquire ordering, returns the
    /// snapshot *before* the OR. The bits the caller actually set are
    /// `mask & !prior.held()`.
    pub fn bor_acq_held(&self, mask: FacetSet) -> Snapshot {
        let delta = pack(mask, FacetSet::empty());
        Snapshot(self.bits.fetch_or(delta, Ordering::Acquire))
    }

    /// `BOR-acq` of both the `held` and `waiter` bit for one facet, used by
    /// try-acquire-and-enqueue to attempt a direct acquisition while
    /// simultaneously staking a claim to the waiter bit in case it's already
    /// held.
    pub fn bor_acq_held_and_waiter(&self, facet: FacetSet) -> Snapshot {
        let delta = pack(facet, facet);
        Snapshot(self.bits.fetch_or(delta, Ordering::Acquire))
    }

    /// `BAND-rel`: atomic AND clearing `mask` from `held`, release ordering,
    /// returns the snapshot *before* the AND.
    pub fn band_rel_held(&self, mask: FacetSet) -> Snapshot {
        let keep = !pack(mask, FacetSet::empty());
        Snapshot(self.bits.fetch_and(keep, Ordering::Release))
    }

    /// `BAND-rel` clearing `mask` from `waiter`, release ordering.
    pub fn band_rel_waiter(&self, mask: FacetSet) -> Snapshot {
        let keep = !pack(FacetSet::empty(), mask);
        Snapshot(self.bits.fetch_and(keep, Ordering::Release))
    }

    /// `CAS-acq`: attempts to move the word from `expected` to
    /// `expected.held() | grab` (waiter field unchanged), acquire-on-success,
    /// relaxed-on-failure. Used by the acquire slow path's batch grab of
    /// every in-order-free facet still needed.
    ///
    /// # Errors
    ///
    /// Returns the observed snapshot if the word no longer matches `expected`.
    pub fn cas_acq_grab(&self, expected: Snapshot, grab: FacetSet) -> Result<Snapshot, Snapshot> {
        let new = expected.raw() | pack(grab, FacetSet::empty());
        self.bits
            .compare_exchange_weak(expected.raw(), new, Ordering::Acquire, Ordering::Relaxed)
            .map(Snapshot)
            .map_err(Snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_is_all_held_no_waiters() {
        let w = FacetWord::new_all_held();
        let s = w.load(Ordering::Relaxed);
        assert_eq!(s.held(), FacetSet::all());
        assert_eq!(s.waiter(), FacetSet::empty());
    }

    #[test]
    fn bor_acq_reports_prior_value() {
        let w = FacetWord::new_all_held();
        // release everything first so MAIN|MSGQ starts free
        w.band_rel_held(FacetSet::all());
        let prior = w.bor_acq_held(FacetSet::MAIN | FacetSet::MSGQ);
        assert_eq!(prior.held(), FacetSet::empty());
        let now = w.load(Ordering::Relaxed);
        assert_eq!(now.held(), FacetSet::MAIN | FacetSet::MSGQ);
    }

    #[test]
    fn band_rel_clears_only_requested_bits() {
        let w = FacetWord::new_all_held();
        w.band_rel_held(FacetSet::MAIN);
        let now = w.load(Ordering::Relaxed);
        assert_eq!(now.held(), FacetSet::all() - FacetSet::MAIN);
    }

    #[test]
    fn cas_acq_grab_fails_on_stale_snapshot() {
        let w = FacetWord::new_all_held();
        w.band_rel_held(FacetSet::all());
        let stale = w.load(Ordering::Relaxed);
        // someone else grabs MAIN first
        w.bor_acq_held(FacetSet::MAIN);
        let result = w.cas_acq_grab(stale, FacetSet::MSGQ);
        assert!(result.is_err());
    }

    #[test]
    fn cas_acq_grab_succeeds_and_sets_bits() {
        let w = FacetWord::new_all_held();
        w.band_rel_held(FacetSet::all());
        let snap = w.load(Ordering::Relaxed);
        let result = w.cas_acq_grab(snap, FacetSet::MAIN | FacetSet::TIMERS);
        assert!(result.is_ok());
        let now = w.load(Ordering::Relaxed);
        assert_eq!(now.held(), FacetSet::MAIN | FacetSet::TIMERS);
    }

    /// Model-checks the lock-free fast path: two threads racing a `BOR-acq`
    /// of the same facet must never both observe it free. Runs as a single
    /// pass under plain `cargo test` (`model` just calls the closure once)
    /// and as an exhaustive interleaving search under `cfg(loom)`.
    #[test]
    fn loom_concurrent_bor_acq_is_mutually_exclusive() {
        crate::loom::model(|| {
            let w = crate::loom::Arc::new(FacetWord::new_all_held());
            w.band_rel_held(FacetSet::all());

            let w2 = w.clone();
            let other = crate::loom::thread::spawn(move || w2.bor_acq_held(FacetSet::MAIN));
            let here = w.bor_acq_held(FacetSet::MAIN);
            let there = other.join().unwrap();

            let here_won = !here.held().contains(FacetSet::MAIN);
            let there_won = !there.held().contains(FacetSet::MAIN);
            assert_ne!(here_won, there_won, "exactly one racer must observe MAIN free");

            let snap = w.load(Ordering::Acquire);
            assert!(snap.held().contains(FacetSet::MAIN));
        });
    }

    #[test]
    fn waiter_and_held_fields_are_independent() {
        let w = FacetWord::new_all_held();
        w.band_rel_held(FacetSet::all());
        w.bor_acq_held_and_waiter(FacetSet::STATUS);
        let s = w.load(Ordering::Relaxed);
        assert_eq!(s.held(), FacetSet::STATUS);
        assert_eq!(s.waiter(), FacetSet::STATUS);
        w.band_rel_waiter(FacetSet::STATUS);
        let s = w.load(Ordering::Relaxed);
        assert_eq!(s.held(), FacetSet::STATUS);
        assert_eq!(s.waiter(), FacetSet::empty());
    }
}

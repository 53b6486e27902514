// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Deadlock-free two-actor acquisition: release whatever would otherwise
//! violate the cross-actor ascending-identifier order, then reacquire
//! everything lower-actor-first.

use crate::actor::FacetLock;
use crate::debug::{LockChecker, LockProfiler};
use crate::engine::{self, SpinBudget};
use crate::facet::{ActorId, FacetSet};
use crate::stripe::StripeTable;
use crate::tse::{ThreadWaiter, TsePool};

/// Pins an actor's existence across a window where the caller transiently
/// holds none of its facets, so it cannot be torn down underneath the
/// caller. Scheduler-managed threads never need this (their managed state
/// already keeps every actor they're touring alive); auxiliary threads do.
pub trait RefCounted {
    fn inc(&self, id: ActorId);
    fn dec(&self, id: ActorId);
}

/// A no-op [`RefCounted`] for callers that never run on auxiliary threads,
/// or that pin actor lifetime some other way.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoRefCount;

impl RefCounted for NoRefCount {
    fn inc(&self, _id: ActorId) {}
    fn dec(&self, _id: ActorId) {}
}

/// One side of a [`safelock`] call: an actor, what the caller already holds
/// on it, and what the caller still needs.
pub struct Party<'a, W> {
    pub id: ActorId,
    pub lock: &'a FacetLock<W>,
    pub have: FacetSet,
    pub need: FacetSet,
}

/// The facets at or above the lowest bit of `need`. Empty when `need` is
/// empty: nothing needed means no ordering constraint to enforce.
fn at_or_above_lowest_need(need: FacetSet) -> FacetSet {
    FacetSet::all() - need.below_lowest()
}

/// Splits `mask` into its maximal runs of consecutive facet bits, ascending.
fn contiguous_runs(mut mask: FacetSet) -> impl Iterator<Item = FacetSet> {
    core::iter::from_fn(move || {
        let lowest = mask.lowest()?;
        let mut run = lowest;
        let mut edge = lowest;
        while let Some(next) = FacetSet::from_bits(edge.bits() << 1) {
            if !mask.contains(next) {
                break;
            }
            run |= next;
            edge = next;
        }
        mask -= run;
        Some(run)
    })
}

/// Reacquires `party`'s `need` in ascending contiguous runs, pinning the
/// actor's refcount across the window (if any) where the caller transiently
/// holds nothing on it.
#[expect(clippy::too_many_arguments, reason = "each parameter is an independent collaborator")]
fn settle_one<W: ThreadWaiter>(
    party: &Party<'_, W>,
    unlock_mask: FacetSet,
    managed: bool,
    stripes: &StripeTable,
    pool: &impl TsePool<W>,
    budget: SpinBudget,
    checker: &impl LockChecker,
    profiler: &impl LockProfiler,
    refc: &impl RefCounted,
) {
    let drops_to_zero = !unlock_mask.is_empty() && (party.have - unlock_mask).is_empty();
    let pinned = !managed && drops_to_zero;
    if pinned {
        refc.inc(party.id);
    }

    if !unlock_mask.is_empty() {
        tracing::trace!(
            id = ?party.id,
            ?unlock_mask,
            pinned,
            "safelock releasing out-of-order facets to respect global order"
        );
        engine::unlock(party.lock, stripes, party.id, profiler, unlock_mask);
    }
    for run in contiguous_runs(party.need | unlock_mask) {
        engine::lock(party.lock, stripes, party.id, pool, budget, checker, profiler, run);
    }

    if pinned {
        refc.dec(party.id);
    }
}

/// Acquires `a.need` on `a` and `b.need` on `b`, releasing whatever of
/// `a.have`/`b.have` would otherwise be held out of ascending order once the
/// new needs are folded in. On return the caller holds exactly `a.need` on
/// `a` and `b.need` on `b` (in addition to whatever of `have` wasn't
/// released).
///
/// `managed` selects whether the caller is a scheduler-managed thread; only
/// non-managed callers get refcount pinning around a transient
/// zero-facets-held window.
#[expect(clippy::too_many_arguments, reason = "each parameter is an independent collaborator")]
pub fn safelock<W: ThreadWaiter>(
    a: Option<Party<'_, W>>,
    b: Option<Party<'_, W>>,
    managed: bool,
    stripes: &StripeTable,
    pool: &impl TsePool<W>,
    budget: SpinBudget,
    checker: &impl LockChecker,
    profiler: &impl LockProfiler,
    refc: &impl RefCounted,
) {
    let (p1, p2) = match (a, b) {
        (Some(a), Some(b)) if a.id == b.id => (
            Some(Party {
                id: a.id,
                lock: a.lock,
                have: a.have | b.have,
                need: a.need | b.need,
            }),
            None,
        ),
        (Some(a), Some(b)) if a.id < b.id => (Some(a), Some(b)),
        (Some(a), Some(b)) => (Some(b), Some(a)),
        (Some(a), None) => (Some(a), None),
        (None, Some(b)) => (Some(b), None),
        (None, None) => (None, None),
    };

    for party in [p1, p2].into_iter().flatten() {
        let need = party.need - party.have;
        let unlock_mask = party.have & at_or_above_lowest_need(need);
        let reduced = Party {
            id: party.id,
            lock: party.lock,
            have: party.have,
            need,
        };
        settle_one(
            &reduced,
            unlock_mask,
            managed,
            stripes,
            pool,
            budget,
            checker,
            profiler,
            refc,
        );
    }
}

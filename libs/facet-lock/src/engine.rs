// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The acquire and release engines: the lock-free fast paths on the facet
//! word, the bounded-spin-then-park acquire slow path, and the release
//! transfer protocol.

use crate::actor::FacetLock;
use crate::debug::{LockChecker, LockProfiler, NoopChecker};
use crate::facet::{ActorId, FacetSet};
use crate::loom::Ordering;
use crate::stripe::StripeTable;
use crate::tse::{ThreadWaiter, Tse, TsePool};
use crate::word::Snapshot;
use core::ptr::NonNull;
use k23_arrayvec::ArrayVec;

/// Tuning knobs for the acquire slow path's bounded spin phase. These
/// constants are defaults, not contracts; callers needing different
/// tradeoffs build a [`SpinBudget`] directly.
#[derive(Clone, Copy, Debug)]
pub struct SpinBudget {
    spins: u32,
    yield_every: u32,
}

impl SpinBudget {
    /// A scheduler-managed thread's budget: a base plus a per-CPU delta,
    /// capped. A single-CPU system collapses to [`Self::zero`], since
    /// spinning alone on one core only delays the thread that could
    /// otherwise make progress.
    #[must_use]
    pub fn for_scheduler(cpu_count: usize) -> Self {
        const BASE: u32 = 1_000;
        const PER_CPU: u32 = 200;
        const CAP: u32 = 8_000;

        if cpu_count <= 1 {
            return Self::zero();
        }
        #[expect(
            clippy::cast_possible_truncation,
            reason = "cpu_count is a small hardware topology value"
        )]
        let per_cpu_total = PER_CPU.saturating_mul(cpu_count as u32);
        Self {
            spins: BASE.saturating_add(per_cpu_total).min(CAP),
            yield_every: 64,
        }
    }

    /// An auxiliary (non-scheduler) thread's small, fixed budget.
    #[must_use]
    pub const fn for_auxiliary() -> Self {
        Self {
            spins: 64,
            yield_every: 16,
        }
    }

    /// The zero-spin budget: every contended acquire parks immediately.
    #[must_use]
    pub const fn zero() -> Self {
        Self {
            spins: 0,
            yield_every: 1,
        }
    }
}

/// The subset of `needed` that is free in `old` and does not skip over a
/// lower-ordered facet of `needed` that someone else currently holds.
fn in_order_free(old: Snapshot, needed: FacetSet) -> FacetSet {
    let busy = needed & old.held();
    needed & !old.held() & busy.below_lowest()
}

/// A bounded batch of waiters to wake once the actor's stripe has been
/// released, sized the same way `kasync`'s `WakeBatch` bounds a batch of
/// `Waker`s: at most one entry can be produced per facet processed in a
/// single release pass.
struct WakeList<W> {
    inner: ArrayVec<NonNull<Tse<W>>, { crate::facet::NUM_FACETS as usize }>,
}

impl<W: ThreadWaiter> WakeList<W> {
    fn new() -> Self {
        Self {
            inner: ArrayVec::new(),
        }
    }

    fn push(&mut self, node: NonNull<Tse<W>>) {
        self.inner.push(node);
    }

    fn wake_all(&mut self) {
        for node in self.inner.drain(..) {
            // Safety: a node only lands in the wake list once its `needed`
            // is empty, at which point its owning thread no longer touches
            // it until woken.
            unsafe { node.as_ref() }.wake();
        }
    }
}

/// Acquires every facet in `mask` on behalf of `id`. On return, the caller
/// holds every facet in `mask` in addition to whatever it already held.
/// `mask` must be disjoint from the caller's existing holdings.
#[expect(
    clippy::too_many_arguments,
    reason = "each parameter is an independent collaborator the caller supplies; bundling \
              them would only hide what's actually required"
)]
pub fn lock<W: ThreadWaiter>(
    lock: &FacetLock<W>,
    stripes: &StripeTable,
    id: ActorId,
    pool: &impl TsePool<W>,
    budget: SpinBudget,
    checker: &impl LockChecker,
    profiler: &impl LockProfiler,
    mask: FacetSet,
) {
    if mask.is_empty() {
        return;
    }

    let old = lock.word.bor_acq_held(mask);
    let missing = mask & old.held();

    let mut already_held = old.held() - mask;
    for facet in (mask - missing).iter_bits() {
        checker.check_order(id, already_held, facet);
        already_held.insert(facet);
        profiler.on_acquire(id, facet);
    }

    if missing.is_empty() {
        return;
    }

    tracing::trace!(?id, ?missing, "facet acquire contended");
    for facet in missing.iter_bits() {
        profiler.on_acquire_contended(id, facet);
    }
    acquire_slow(lock, stripes, id, pool, missing, old, budget, checker);
    for facet in missing.iter_bits() {
        profiler.on_acquire(id, facet);
    }
}

/// The acquire slow path: bounded lock-free spinning that tries to take all
/// free in-order facets at once, parking when blocked.
fn acquire_slow<W: ThreadWaiter>(
    lock: &FacetLock<W>,
    stripes: &StripeTable,
    id: ActorId,
    pool: &impl TsePool<W>,
    mut needed: FacetSet,
    mut old: Snapshot,
    budget: SpinBudget,
    checker: &impl LockChecker,
) {
    let mut spins_left = budget.spins;

    loop {
        let grabbable = in_order_free(old, needed);
        if grabbable.is_empty() {
            if spins_left == 0 {
                park(lock, stripes, id, pool, needed, checker);
                return;
            }
            spins_left -= 1;
            if budget.yield_every != 0 && spins_left % budget.yield_every == 0 {
                crate::loom::yield_now();
            } else {
                core::hint::spin_loop();
            }
            old = lock.word.load(Ordering::Acquire);
            continue;
        }

        // Report every bit about to be grabbed, ascending, before the CAS
        // that would commit them, so a violating request is pinned to the
        // specific offending bit rather than the whole batch.
        let mut already_held = old.held();
        for facet in grabbable.iter_bits() {
            checker.check_order(id, already_held, facet);
            already_held.insert(facet);
        }

        match lock.word.cas_acq_grab(old, grabbable) {
            Ok(_) => {
                needed -= grabbable;
                spins_left = budget.spins;
                if needed.is_empty() {
                    return;
                }
                old = lock.word.load(Ordering::Acquire);
            }
            Err(observed) => old = observed,
        }
    }
}

/// Parks the calling thread until `needed` is fully satisfied.
fn park<W: ThreadWaiter>(
    lock: &FacetLock<W>,
    stripes: &StripeTable,
    id: ActorId,
    pool: &impl TsePool<W>,
    needed: FacetSet,
    checker: &impl LockChecker,
) {
    let node = pool.fetch();
    // Safety: freshly fetched from the pool, not linked anywhere.
    unsafe { node.as_ref().reset(needed) };

    let satisfied = {
        let _guard = stripes.lock_for(id);
        // Safety: stripe held.
        unsafe { lock.queues.try_acquire_and_enqueue(&lock.word, node, id, checker) };
        // Safety: stripe held.
        let satisfied = unsafe { node.as_ref().is_satisfied() };
        if !satisfied {
            unsafe { node.as_ref() }.arm();
        }
        satisfied
    };

    if !satisfied {
        tracing::trace!(?id, ?needed, "parking for facets");
        unsafe { node.as_ref() }.park_until_woken();
        // Safety: stripe was held by the releaser when it cleared `needed`
        // to zero; that write happens-before this thread observing its
        // wakeup.
        debug_assert!(unsafe { node.as_ref().is_satisfied() });
        tracing::trace!(?id, "woken with facets satisfied");
    }

    // Safety: the node is no longer linked into any queue and `needed` is
    // zero, satisfying the pool's return contract.
    unsafe { pool.release(node) };
}

/// Releases every facet in `mask` on behalf of `id`. Precondition: the
/// caller holds every facet in `mask`.
pub fn unlock<W: ThreadWaiter>(
    lock: &FacetLock<W>,
    stripes: &StripeTable,
    id: ActorId,
    profiler: &impl LockProfiler,
    mask: FacetSet,
) {
    if mask.is_empty() {
        return;
    }

    let before = lock.word.load(Ordering::Relaxed);
    debug_assert!(
        before.held().contains(mask),
        "unlock: releasing facets the caller does not hold"
    );

    let mut waited_on = before.waiter() & mask;
    let clean = mask - waited_on;

    if !clean.is_empty() {
        lock.word.band_rel_held(clean);
        for facet in clean.iter_bits() {
            profiler.on_release(id, facet);
        }

        // A waiter may have squeezed its `try_acquire_and_enqueue` BOR in
        // between our lock-free read of `before` and the BAND-rel above,
        // setting a waiter bit on a facet we believed clean. Re-read and
        // fold any such facet into the transfer set rather than leaving it
        // observably free with a waiter stuck behind it: re-assert its held
        // bit first, since transfer requires a facet stay held throughout
        // the handoff, never observably free.
        let after = lock.word.load(Ordering::Acquire);
        let missed = after.waiter() & clean;
        if !missed.is_empty() {
            tracing::trace!(?id, ?missed, "release observed a late-arriving waiter, folding into transfer");
            lock.word.bor_acq_held(missed);
            waited_on |= missed;
        }
    }

    if waited_on.is_empty() {
        return;
    }

    release_slow(lock, stripes, id, profiler, waited_on);
}

/// The release slow path / transfer protocol. `to_transfer` is the set of
/// facets whose release observed a waiter bit set; their held bits remain
/// set throughout (never cleared) so ownership moves directly from
/// releaser to waiter without ever being observably free.
fn release_slow<W: ThreadWaiter>(
    lock: &FacetLock<W>,
    stripes: &StripeTable,
    id: ActorId,
    profiler: &impl LockProfiler,
    to_transfer: FacetSet,
) {
    tracing::trace!(?id, ?to_transfer, "transferring released facets to waiters");
    let mut wake_list: WakeList<W> = WakeList::new();
    let mut drained = FacetSet::empty();

    {
        let _guard = stripes.lock_for(id);
        for facet in to_transfer.iter_bits() {
            // Safety: stripe held.
            if unsafe { lock.queues.is_empty(facet) } {
                // Drained already by an earlier bit's handoff in this same
                // pass.
                drained.insert(facet);
                continue;
            }

            // Safety: stripe held; invariant Q1 guarantees non-empty.
            let waiter = unsafe { lock.queues.pop_front(facet) };
            if unsafe { lock.queues.is_empty(facet) } {
                drained.insert(facet);
            }
            profiler.on_release(id, facet);

            // Safety: stripe held.
            unsafe { waiter.as_ref().remove_needed(facet) };
            let satisfied = unsafe { waiter.as_ref().is_satisfied() };
            if satisfied {
                wake_list.push(waiter);
                continue;
            }

            // A transferred waiter's remaining `needed` bits were already
            // order-checked when it first called `lock()`; re-checking here
            // would just repeat that report against the same caller.
            unsafe {
                lock.queues
                    .try_acquire_and_enqueue(&lock.word, waiter, id, &NoopChecker)
            };
            if unsafe { waiter.as_ref().is_satisfied() } {
                wake_list.push(waiter);
            }
        }

        if !drained.is_empty() {
            lock.word.band_rel_waiter(drained);
        }
    }

    wake_list.wake_all();
}

/// A non-blocking `BOR-acq` on behalf of `id`. Returns the subset of `mask`
/// that could not be acquired.
pub fn trylock_raw<W>(
    lock: &FacetLock<W>,
    id: ActorId,
    profiler: &impl LockProfiler,
    mask: FacetSet,
) -> FacetSet {
    let old = lock.word.bor_acq_held(mask);
    let failed = mask & old.held();
    for facet in (mask - failed).iter_bits() {
        profiler.on_acquire(id, facet);
    }
    for facet in failed.iter_bits() {
        profiler.on_trylock(id, facet, false);
    }
    failed
}

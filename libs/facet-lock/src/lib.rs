// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-actor multi-facet compound lock.
//!
//! Each schedulable actor owns a [`FacetLock`]: a small set of independent
//! logical locks ("facets", [`FacetSet`]) sharing one atomic control word
//! ([`FacetWord`]). Acquiring one or more facets is lock-free when
//! uncontended; the slow path parks on a pooled [`Tse`] and hands facets
//! directly to the next waiter on release ("transfer") instead of waking
//! everyone to re-race for the lock.
//!
//! Ordering across facets of one actor is ascending bit index; ordering
//! across two actors is ascending [`ActorId`], enforced by [`safelock`].
//! [`lookup_and_lock`] resolves an actor identifier to a locked reference,
//! coping with concurrent publish/teardown.
//!
//! This crate defines none of: what a facet protects, a general-purpose
//! reentrant mutex, priority inheritance, or a lock order across unrelated
//! subsystems. It is `no_std` and allocation-free; every node it touches is
//! supplied by the caller through the [`TsePool`], [`ActorTable`] and
//! [`ThreadProgress`] collaborator traits.

#![cfg_attr(not(test), no_std)]

mod actor;
mod debug;
mod engine;
mod error;
mod facet;
mod loom;
mod lookup;
mod queue;
mod safelock;
mod stripe;
mod tse;
mod word;

pub use actor::FacetLock;
pub use debug::{LockChecker, LockProfiler, NoopChecker, NoopProfiler};
pub use engine::{trylock_raw, unlock, SpinBudget};
pub use error::LookupError;
pub use facet::{ActorId, FacetSet, NUM_FACETS};
pub use lookup::{lookup_and_lock, ActorTable, LookupFlags, Resolved, ThreadProgress};
pub use queue::WaitQueues;
pub use safelock::{safelock, NoRefCount, Party, RefCounted};
pub use stripe::{Stripe, StripeTable};
pub use tse::{ThreadWaiter, Tse, TsePool};
pub use word::{FacetWord, Snapshot};

/// Initialises a fresh actor lock: `FW` = all-held, queues empty, with the
/// creator counted as already holding every facet.
#[must_use]
pub fn init<W>() -> FacetLock<W> {
    FacetLock::new()
}

/// Validates the termination invariant (all queues empty, `FW` all-held)
/// and releases auxiliary resources.
///
/// # Safety
///
/// See [`FacetLock::fin`].
pub unsafe fn fin<W>(actor: &FacetLock<W>) {
    // Safety: forwarded to the caller's obligation.
    unsafe { actor.fin() }
}

/// Acquires every facet in `mask` on behalf of `id`. On return, the caller
/// holds every facet in `mask` in addition to whatever it already held.
/// `mask` must be disjoint from the caller's existing holdings.
#[expect(clippy::too_many_arguments, reason = "see engine::lock")]
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
    engine::lock(lock, stripes, id, pool, budget, checker, profiler, mask);
}

/// Warms the calling thread's [`Tse`] pool so the first contended acquire it
/// performs does not pay the cost of lazily constructing one.
pub fn prepare_waiter<W>(pool: &impl TsePool<W>) {
    let node = pool.fetch();
    // Safety: a freshly fetched node is unlinked and has `needed` empty,
    // satisfying the pool's return contract; we only touch it to hand it
    // straight back.
    unsafe { pool.release(node) };
}

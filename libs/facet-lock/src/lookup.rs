// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Indexed lookup: resolving an actor identifier to a locked reference,
//! coping with concurrent publish/teardown via a liveness re-check.

use crate::actor::FacetLock;
use crate::debug::{LockChecker, LockProfiler};
use crate::engine::{self, SpinBudget};
use crate::error::LookupError;
use crate::facet::{ActorId, FacetSet};
use crate::safelock::{self, Party, RefCounted};
use crate::stripe::StripeTable;
use crate::tse::{ThreadWaiter, TsePool};

/// A resolved actor: the identifier that was looked up and a reference to
/// its lock, valid for as long as `'a` (the caller's progress-region
/// borrow, or the actor table's own lifetime for the self-lookup fast
/// path).
pub struct Resolved<'a, W> {
    pub id: ActorId,
    pub lock: &'a FacetLock<W>,
}

/// Which facets and how aggressively to acquire them in [`lookup_and_lock`].
#[derive(Clone, Copy, Debug, Default)]
pub struct LookupFlags {
    /// Treat an exiting target as found rather than as not-found.
    pub allow_other_exit: bool,
    /// Never block: fail with [`LookupError::Busy`] instead of contending.
    pub try_only: bool,
    /// Bump the actor's reference count on a successful return.
    pub inc_refc: bool,
}

/// The actor table: stripe-assigned slot lookup by hashed identifier.
pub trait ActorTable<W> {
    /// The current entry at `id`'s slot, or `None` if unpublished. Callers
    /// must hold an active [`ThreadProgress`] region for the duration any
    /// returned reference is used.
    fn lookup(&self, id: ActorId) -> Option<&FacetLock<W>>;

    /// Whether the actor at `id` is currently exiting. Only meaningful
    /// immediately after a successful [`Self::lookup`] of the same `id`.
    fn is_exiting(&self, id: ActorId) -> bool;
}

/// Delimits a region of safe concurrent access to the actor table for
/// threads that do not otherwise participate in the runtime's
/// quiescent-state progress scheme.
pub trait ThreadProgress {
    type Region;

    fn unmanaged_delay(&self) -> Self::Region;
    fn unmanaged_continue(&self, region: Self::Region);
}

/// Resolves `id` to an actor reference and acquires `required` on it.
///
/// If `id` names the caller itself (`caller`) and the caller already holds
/// `required`, returns immediately without touching the table. Otherwise
/// looks the target up under a progress region, then acquires `required`:
/// trying the lock-free path first, falling back to a pinned, blocking
/// [`safelock`](crate::safelock::safelock) call when contended (unless
/// `flags.try_only`), and re-validates the target is still the same live
/// actor before returning.
#[expect(clippy::too_many_arguments, reason = "each parameter is an independent collaborator")]
pub fn lookup_and_lock<'a, T, P, W>(
    table: &'a T,
    progress: &P,
    stripes: &StripeTable,
    pool: &impl TsePool<W>,
    budget: SpinBudget,
    checker: &impl LockChecker,
    profiler: &impl LockProfiler,
    refc: &impl RefCounted,
    caller: Option<(ActorId, &'a FacetLock<W>, FacetSet)>,
    id: ActorId,
    required: FacetSet,
    flags: LookupFlags,
) -> Result<Resolved<'a, W>, LookupError>
where
    T: ActorTable<W>,
    P: ThreadProgress,
    W: ThreadWaiter,
{
    if let Some((caller_id, caller_lock, have)) = caller {
        if caller_id == id {
            if table.is_exiting(id) && !flags.allow_other_exit {
                return Err(LookupError::NotFound);
            }
            if have.contains(required) {
                if flags.inc_refc {
                    refc.inc(id);
                }
                return Ok(Resolved {
                    id,
                    lock: caller_lock,
                });
            }
        }
    }

    let region = progress.unmanaged_delay();
    let Some(entry) = table.lookup(id) else {
        progress.unmanaged_continue(region);
        tracing::trace!(?id, "lookup miss: actor not published");
        return Err(LookupError::NotFound);
    };

    if required.is_empty() {
        if flags.inc_refc {
            refc.inc(id);
        }
        progress.unmanaged_continue(region);
        return Ok(Resolved { id, lock: entry });
    }

    let failed = engine::trylock_raw(entry, id, profiler, required);
    if failed.is_empty() {
        if flags.inc_refc {
            refc.inc(id);
        }
        progress.unmanaged_continue(region);
        return Ok(Resolved { id, lock: entry });
    }

    if flags.try_only {
        // `trylock_raw` is a partial BOR-acq: it already took `required -
        // failed` outright. Give those back before reporting busy, since a
        // `try_only` caller gets nothing on failure, the same all-or-nothing
        // contract the original's CAS-based raw trylock gives for free.
        engine::unlock(entry, stripes, id, profiler, required - failed);
        progress.unmanaged_continue(region);
        tracing::trace!(?id, ?failed, "lookup busy: try_only could not take every facet");
        return Err(LookupError::Busy);
    }

    // We hold `failed` bits nowhere: `trylock_raw` only ever takes bits it
    // didn't already own. Pin the actor before leaving the progress region
    // so it can't be torn down while we block.
    refc.inc(id);
    progress.unmanaged_continue(region);

    let caller_party = caller.map(|(caller_id, caller_lock, have)| Party {
        id: caller_id,
        lock: caller_lock,
        have,
        need: have,
    });
    let target_party = Party {
        id,
        lock: entry,
        have: required - failed,
        need: required,
    };
    safelock::safelock(
        caller_party,
        Some(target_party),
        false,
        stripes,
        pool,
        budget,
        checker,
        profiler,
        refc,
    );

    let region = progress.unmanaged_delay();
    let still_live = matches!(table.lookup(id), Some(found) if core::ptr::eq(found, entry))
        && (flags.allow_other_exit || !table.is_exiting(id));
    if !still_live {
        tracing::trace!(?id, "lookup re-validation failed after blocking acquire, releasing");
        engine::unlock(entry, stripes, id, profiler, required);
        progress.unmanaged_continue(region);
        refc.dec(id);
        return Err(LookupError::NotFound);
    }
    progress.unmanaged_continue(region);

    refc.dec(id);
    if flags.inc_refc {
        refc.inc(id);
    }
    Ok(Resolved { id, lock: entry })
}

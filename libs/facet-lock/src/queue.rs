// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-actor wait-queue block and try-acquire-and-enqueue.
//!
//! All mutation here happens under the actor's index-lock stripe (see
//! [`crate::stripe`]); `WaitQueues` itself knows nothing about stripes, it
//! just assumes exclusive access for the duration of each call.

use crate::debug::LockChecker;
use crate::facet::{ActorId, FacetSet, NUM_FACETS};
use crate::loom::{Ordering, UnsafeCell};
use crate::tse::{ThreadWaiter, Tse};
use crate::word::FacetWord;
use core::ptr::NonNull;
use linked_list::List;

/// The per-actor array of FIFO waiter queues, one per facet. Invariant Q1:
/// `queue[i]` non-empty iff waiter bit `i` is set in the actor's
/// [`FacetWord`].
pub struct WaitQueues<W> {
    by_facet: [UnsafeCell<List<Tse<W>>>; NUM_FACETS as usize],
}

// Safety: every access to `by_facet`'s interior mutability happens while the
// owning actor's index-lock stripe is held, which serializes access across
// threads just as if the queues were behind an explicit mutex.
unsafe impl<W: Send> Send for WaitQueues<W> {}
unsafe impl<W: Send> Sync for WaitQueues<W> {}

impl<W> Default for WaitQueues<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> WaitQueues<W> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_facet: core::array::from_fn(|_| UnsafeCell::new(List::new())),
        }
    }

    fn index(facet: FacetSet) -> usize {
        debug_assert_eq!(
            facet.bits().count_ones(),
            1,
            "WaitQueues indices are single facet bits"
        );
        facet.bits().trailing_zeros() as usize
    }

    /// `true` if every facet queue is empty. The termination invariant
    /// requires this to hold when an actor is torn down.
    ///
    /// # Safety
    ///
    /// Caller must hold the actor's stripe, or otherwise have exclusive
    /// access (e.g. the actor is unreachable, as at `fin`).
    pub unsafe fn all_empty(&self) -> bool {
        self.by_facet
            .iter()
            .all(|q| unsafe { q.with(|q| (*q).is_empty()) })
    }

    /// `true` if `facet`'s queue is empty.
    ///
    /// # Safety
    ///
    /// Caller must hold the actor's stripe.
    pub unsafe fn is_empty(&self, facet: FacetSet) -> bool {
        let idx = Self::index(facet);
        unsafe { self.by_facet[idx].with(|q| (*q).is_empty()) }
    }

    /// Dequeues the head waiter of `facet`'s queue.
    ///
    /// # Safety
    ///
    /// Caller must hold the actor's stripe. Caller must only invoke this for
    /// a facet whose waiter bit was observed set (invariant Q1 guarantees
    /// the queue is then non-empty).
    pub unsafe fn pop_front(&self, facet: FacetSet) -> NonNull<Tse<W>> {
        let idx = Self::index(facet);
        unsafe { self.by_facet[idx].with_mut(|q| (*q).pop_front()) }
            .expect("Q1 violated: waiter bit set but facet queue empty")
    }
}

impl<W: ThreadWaiter> WaitQueues<W> {
    /// Attempts to acquire every bit of `node`'s `needed` mask directly
    /// against `word`, in ascending order, enqueuing `node` on the lowest
    /// facet it could not take outright.
    ///
    /// On return, `node`'s `needed` reflects whatever is still missing; a
    /// node that completed every bit is not left linked into any queue,
    /// otherwise it is linked onto exactly one facet's queue.
    ///
    /// `id` and `checker` report each facet bit to the lock-order checker, in
    /// ascending order, before it is considered for acquisition: the same
    /// per-bit granularity the acquire slow path's batch CAS loop uses, so a
    /// violating multi-facet request is reported against the specific
    /// offending bit.
    ///
    /// # Safety
    ///
    /// Caller must hold the stripe covering both `word`'s actor and `self`.
    pub unsafe fn try_acquire_and_enqueue(
        &self,
        word: &FacetWord,
        node: NonNull<Tse<W>>,
        id: ActorId,
        checker: &impl LockChecker,
    ) {
        loop {
            let needed = unsafe { node.as_ref().needed() };
            let Some(facet) = needed.lowest() else {
                return;
            };
            let idx = Self::index(facet);
            checker.check_order(id, word.load(Ordering::Relaxed).held(), facet);

            let already_waiting = unsafe { self.by_facet[idx].with(|q| !(*q).is_empty()) };
            if already_waiting {
                debug_assert!(
                    word.load(Ordering::Relaxed).waiter().contains(facet),
                    "queue non-empty but waiter bit clear"
                );
                unsafe { self.by_facet[idx].with_mut(|q| (*q).push_back(node)) };
                return;
            }

            let prior = word.bor_acq_held_and_waiter(facet);
            if prior.held().contains(facet) {
                // Someone else holds it; the queue was empty, so we become
                // its first (and only) waiter.
                unsafe { self.by_facet[idx].with_mut(|q| (*q).push_back(node)) };
                return;
            }

            // We just acquired `facet` outright. No one else can be waiting
            // on it yet since the queue was empty and we hold the stripe, so
            // the waiter bit we speculatively set alongside it is spurious;
            // clear it back off.
            word.band_rel_waiter(facet);
            unsafe { node.as_ref().remove_needed(facet) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::NoopChecker;
    use crate::facet::FacetSet;
    use std::sync::atomic::{AtomicBool, Ordering as StdOrdering};
    use std::sync::Arc;
    use std::thread;

    struct StdWaiter {
        thread: thread::Thread,
        woken: Arc<AtomicBool>,
    }

    impl StdWaiter {
        fn for_current() -> Self {
            Self {
                thread: thread::current(),
                woken: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl ThreadWaiter for StdWaiter {
        fn wait(&self) {
            while !self.woken.swap(false, StdOrdering::Acquire) {
                thread::park();
            }
        }

        fn wake(&self) {
            self.woken.store(true, StdOrdering::Release);
            self.thread.unpark();
        }
    }

    #[test]
    fn fully_free_mask_never_enqueues() {
        let word = FacetWord::new_all_held();
        word.band_rel_held(FacetSet::all());
        let queues: WaitQueues<StdWaiter> = WaitQueues::new();

        let node = Tse::new(StdWaiter::for_current());
        unsafe { node.reset(FacetSet::MAIN | FacetSet::TIMERS) };
        let ptr = NonNull::from(&node);
        unsafe { queues.try_acquire_and_enqueue(&word, ptr, ActorId::new(1), &NoopChecker) };

        assert!(unsafe { node.is_satisfied() });
        assert!(unsafe { queues.all_empty() });
        let snap = word.load(Ordering::Relaxed);
        assert_eq!(snap.held(), FacetSet::MAIN | FacetSet::TIMERS);
        assert_eq!(snap.waiter(), FacetSet::empty());
    }

    #[test]
    fn busy_facet_enqueues_and_stops() {
        let word = FacetWord::new_all_held();
        word.band_rel_held(FacetSet::all());
        word.bor_acq_held(FacetSet::MSGQ); // someone else holds MSGQ
        let queues: WaitQueues<StdWaiter> = WaitQueues::new();

        let node = Tse::new(StdWaiter::for_current());
        unsafe { node.reset(FacetSet::MAIN | FacetSet::MSGQ) };
        let ptr = NonNull::from(&node);
        unsafe { queues.try_acquire_and_enqueue(&word, ptr, ActorId::new(2), &NoopChecker) };

        // MAIN was free and got taken directly; MSGQ is still missing and
        // the node is parked on its queue.
        assert_eq!(unsafe { node.needed() }, FacetSet::MSGQ);
        assert!(!unsafe { queues.is_empty(FacetSet::MSGQ) });
        assert!(unsafe { queues.is_empty(FacetSet::MAIN) });
        let snap = word.load(Ordering::Relaxed);
        assert!(snap.held().contains(FacetSet::MAIN | FacetSet::MSGQ));
        assert_eq!(snap.waiter(), FacetSet::MSGQ);

        // clean up: this is a stack-local node, it must be unlinked before
        // it's dropped.
        let popped = unsafe { queues.pop_front(FacetSet::MSGQ) };
        assert_eq!(popped, ptr);
    }

    /// Model-checks two threads racing `try_acquire_and_enqueue` for the
    /// same free facet, each properly serialized by a [`crate::stripe::Stripe`]:
    /// exactly one must win the facet directly, and invariant Q1 (queue
    /// non-empty iff waiter bit set) must hold for the loser either way.
    #[test]
    fn loom_concurrent_try_acquire_is_race_free() {
        struct NoopWaiter;
        impl ThreadWaiter for NoopWaiter {
            fn wait(&self) {}
            fn wake(&self) {}
        }

        crate::loom::model(|| {
            let word = crate::loom::Arc::new({
                let w = FacetWord::new_all_held();
                w.band_rel_held(FacetSet::all());
                w
            });
            let queues: crate::loom::Arc<WaitQueues<NoopWaiter>> =
                crate::loom::Arc::new(WaitQueues::new());
            let stripe = crate::loom::Arc::new(crate::stripe::Stripe::new());

            let node_a = crate::loom::Arc::new(Tse::new(NoopWaiter));
            unsafe { node_a.reset(FacetSet::MAIN) };
            let node_b = crate::loom::Arc::new(Tse::new(NoopWaiter));
            unsafe { node_b.reset(FacetSet::MAIN) };

            let (w1, q1, s1, n1) = (word.clone(), queues.clone(), stripe.clone(), node_a.clone());
            let other = crate::loom::thread::spawn(move || {
                let _guard = s1.lock();
                unsafe { q1.try_acquire_and_enqueue(&w1, NonNull::from(&*n1), ActorId::new(10), &NoopChecker) };
            });

            {
                let _guard = stripe.lock();
                unsafe { queues.try_acquire_and_enqueue(&word, NonNull::from(&*node_b), ActorId::new(10), &NoopChecker) };
            }
            other.join().unwrap();

            let a_won = unsafe { node_a.is_satisfied() };
            let b_won = unsafe { node_b.is_satisfied() };
            assert_ne!(a_won, b_won, "exactly one racer must acquire MAIN directly");

            let waiter_set = word.load(Ordering::Acquire).waiter().contains(FacetSet::MAIN);
            assert_eq!(waiter_set, !unsafe { queues.is_empty(FacetSet::MAIN) });

            // unlink the loser before the node drops.
            if !a_won {
                assert_eq!(
                    unsafe { queues.pop_front(FacetSet::MAIN) },
                    NonNull::from(&*node_a)
                );
            } else {
                assert_eq!(
                    unsafe { queues.pop_front(FacetSet::MAIN) },
                    NonNull::from(&*node_b)
                );
            }
        });
    }
}

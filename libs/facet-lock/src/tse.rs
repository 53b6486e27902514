// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Thread-sleep endpoint: the per-thread parking node used by the acquire
//! slow path.
//!
//! A `Tse` is the intrusive wait-queue node linked into a
//! [`WaitQueues`](crate::queue::WaitQueues) facet queue while its owning
//! thread is parked. It carries no heap allocation of its own: callers fetch
//! one from a [`TsePool`] (warmed ahead of time by
//! [`prepare_waiter`](crate::prepare_waiter)) and return it once `needed` is
//! zero again.

use crate::facet::FacetSet;
use crate::loom::{AtomicBool, Ordering};
use core::cell::Cell;
use core::fmt;
use core::ptr::NonNull;
use linked_list::{Linked, Links};

/// A thread's platform-level blocking primitive.
///
/// Implementations must tolerate spurious wakeups: [`Self::wait`] may return
/// without a matching [`Self::wake`] (EINTR and the like are fine; callers
/// always re-check their condition in a loop).
pub trait ThreadWaiter {
    /// Blocks the calling thread until [`Self::wake`] is called, or
    /// spuriously.
    fn wait(&self);

    /// Wakes the thread parked in [`Self::wait`]. Must not lose the wakeup
    /// if called before the thread starts waiting (a binary semaphore, not
    /// an edge-triggered notify).
    fn wake(&self);
}

/// A thread-sleep endpoint: the intrusive node a thread links into an
/// actor's facet queue while parked.
#[repr(C)]
pub struct Tse<W> {
    links: Links<Self>,
    /// Remaining facet mask still to acquire. Mutated only under the owning
    /// actor's stripe.
    needed: Cell<FacetSet>,
    /// The wakeup signal: armed while parked, cleared by the releaser that
    /// hands off the last needed facet.
    acquired_flag: AtomicBool,
    waiter: W,
}

// Safety: `needed` and `links` are touched only while the owning actor's
// stripe is held, which serializes access across threads even though the
// node itself may be enqueued by one thread and mutated by another during a
// transfer.
unsafe impl<W: Send> Send for Tse<W> {}
unsafe impl<W: Sync> Sync for Tse<W> {}

impl<W: fmt::Debug> fmt::Debug for Tse<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tse")
            .field("needed", &self.needed.get())
            .field(
                "acquired_flag",
                &self.acquired_flag.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

impl<W> Tse<W> {
    #[must_use]
    pub fn new(waiter: W) -> Self {
        Self {
            links: Links::new(),
            needed: Cell::new(FacetSet::empty()),
            acquired_flag: AtomicBool::new(false),
            waiter,
        }
    }

    /// Resets this node to the fetched-from-pool state with `needed` set to
    /// the caller's still-missing mask.
    ///
    /// # Safety
    ///
    /// Caller must hold the actor's stripe and the node must not currently
    /// be linked into any queue.
    pub(crate) unsafe fn reset(&self, needed: FacetSet) {
        debug_assert!(!self.links.is_linked(), "Tse reset while still linked");
        self.needed.set(needed);
        self.acquired_flag.store(false, Ordering::Relaxed);
    }

    /// # Safety
    ///
    /// Caller must hold the actor's stripe.
    pub(crate) unsafe fn needed(&self) -> FacetSet {
        self.needed.get()
    }

    /// # Safety
    ///
    /// Caller must hold the actor's stripe.
    pub(crate) unsafe fn remove_needed(&self, grabbed: FacetSet) {
        self.needed.set(self.needed.get() - grabbed);
    }

    /// # Safety
    ///
    /// Caller must hold the actor's stripe.
    pub(crate) unsafe fn is_satisfied(&self) -> bool {
        self.needed.get().is_empty()
    }

    /// Arms the wakeup flag before parking.
    pub(crate) fn arm(&self) {
        self.acquired_flag.store(true, Ordering::Release);
    }

    /// Clears the wakeup flag and wakes the owning thread. Called by
    /// whichever releaser hands this node its last needed facet.
    pub(crate) fn wake(&self)
    where
        W: ThreadWaiter,
    {
        self.acquired_flag.store(false, Ordering::Release);
        self.waiter.wake();
    }

    /// Parks until [`Self::wake`] has cleared the flag.
    pub(crate) fn park_until_woken(&self)
    where
        W: ThreadWaiter,
    {
        while self.acquired_flag.load(Ordering::Acquire) {
            self.waiter.wait();
        }
    }
}

// Safety: `links` is touched only while the owning actor's stripe is held,
// which mediates all queue membership of this node.
unsafe impl<W> Linked for Tse<W> {
    type Handle = NonNull<Tse<W>>;

    fn into_ptr(r: Self::Handle) -> NonNull<Self> {
        r
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        ptr
    }

    unsafe fn links(ptr: NonNull<Self>) -> NonNull<Links<Self>> {
        // Safety: `links` is the first field of a `#[repr(C)]` struct.
        ptr.cast()
    }
}

/// A source of [`Tse`] nodes, pooled per-thread so the slow path never
/// allocates on the common contended-but-briefly-blocked path.
pub trait TsePool<W> {
    /// Fetches a node for the calling thread to park on. Implementations
    /// typically hand back a pointer into a thread-local `Tse`, lazily
    /// constructed on first use.
    fn fetch(&self) -> NonNull<Tse<W>>;

    /// Returns a node fetched from this pool.
    ///
    /// # Safety
    ///
    /// `node` must have come from this pool's [`Self::fetch`], must not be
    /// linked into any queue, and must have `needed` empty.
    unsafe fn release(&self, node: NonNull<Tse<W>>);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool as StdAtomicBool, Ordering as StdOrdering};
    use std::sync::Arc;
    use std::thread;

    struct StdWaiter {
        thread: thread::Thread,
        woken: Arc<StdAtomicBool>,
    }

    impl StdWaiter {
        fn for_current() -> Self {
            Self {
                thread: thread::current(),
                woken: Arc::new(StdAtomicBool::new(false)),
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
    fn reset_requires_not_linked() {
        let tse = Tse::new(StdWaiter::for_current());
        unsafe { tse.reset(FacetSet::MAIN | FacetSet::MSGQ) };
        assert_eq!(unsafe { tse.needed() }, FacetSet::MAIN | FacetSet::MSGQ);
        unsafe { tse.remove_needed(FacetSet::MAIN) };
        assert_eq!(unsafe { tse.needed() }, FacetSet::MSGQ);
        assert!(!unsafe { tse.is_satisfied() });
        unsafe { tse.remove_needed(FacetSet::MSGQ) };
        assert!(unsafe { tse.is_satisfied() });
    }

    #[test]
    fn wake_clears_flag_and_unparks() {
        let tse = Arc::new(Tse::new(StdWaiter::for_current()));
        tse.arm();
        let t2 = tse.clone();
        let handle = thread::spawn(move || {
            t2.wake();
        });
        tse.park_until_woken();
        handle.join().unwrap();
    }
}

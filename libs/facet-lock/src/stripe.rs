// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Index-lock stripe: a fixed, power-of-two-sized array of process-global
//! spinlocks.
//!
//! An actor hashes to one stripe by its identifier; that stripe serializes
//! every mutation of the actor's waiter bits and wait queues, as well as the
//! table-entry visibility check used by indexed lookup.

use crate::facet::ActorId;
use crate::loom::{AtomicBool, Ordering};
use core::hint;

/// One spinlock in the stripe table.
///
/// A bare compare-exchange spin loop with no parking, in the same style as
/// this crate's `RawMutex` predecessor. Stripes are only ever held for
/// short, allocation-free critical sections, so unlike the facets
/// themselves they never need a slow path of their own.
#[derive(Debug)]
pub struct Stripe {
    locked: AtomicBool,
}

impl Default for Stripe {
    fn default() -> Self {
        Self::new()
    }
}

impl Stripe {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> StripeGuard<'_> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
        StripeGuard { stripe: self }
    }
}

/// RAII guard over a held [`Stripe`]. Dropping it releases the lock.
#[must_use]
pub struct StripeGuard<'a> {
    stripe: &'a Stripe,
}

impl Drop for StripeGuard<'_> {
    fn drop(&mut self) {
        self.stripe.locked.store(false, Ordering::Release);
    }
}

/// The process-global stripe table: initialized once at runtime start, torn
/// down at runtime stop.
///
/// Sized to a power of two so `id mod S` degenerates to a mask.
pub struct StripeTable {
    stripes: &'static [Stripe],
}

impl StripeTable {
    /// # Panics
    ///
    /// Panics if `stripes` is empty or its length is not a power of two.
    #[must_use]
    pub fn new(stripes: &'static [Stripe]) -> Self {
        assert!(!stripes.is_empty(), "stripe table must not be empty");
        assert!(
            stripes.len().is_power_of_two(),
            "stripe count must be a power of two"
        );
        Self { stripes }
    }

    /// Maps an actor identifier to its stripe and locks it.
    pub fn lock_for(&self, id: ActorId) -> StripeGuard<'_> {
        self.stripe_for(id).lock()
    }

    fn stripe_for(&self, id: ActorId) -> &Stripe {
        let mask = self.stripes.len() - 1;
        #[expect(
            clippy::cast_possible_truncation,
            reason = "masked down to the stripe table length immediately below"
        )]
        let idx = (id.0 as usize) & mask;
        &self.stripes[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutual_exclusion() {
        let stripe = Stripe::new();
        let guard = stripe.lock();
        assert!(stripe.locked.load(Ordering::Relaxed));
        drop(guard);
        assert!(!stripe.locked.load(Ordering::Relaxed));
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn rejects_non_power_of_two() {
        static STRIPES: [Stripe; 3] = [Stripe::new(), Stripe::new(), Stripe::new()];
        let _ = StripeTable::new(&STRIPES);
    }

    #[test]
    fn same_id_maps_to_same_stripe() {
        static STRIPES: [Stripe; 4] = [
            Stripe::new(),
            Stripe::new(),
            Stripe::new(),
            Stripe::new(),
        ];
        let table = StripeTable::new(&STRIPES);
        let a = core::ptr::from_ref(table.stripe_for(ActorId::new(42)));
        let b = core::ptr::from_ref(table.stripe_for(ActorId::new(42)));
        assert_eq!(a, b);
    }
}

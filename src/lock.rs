//! Striped spin-locks covering contiguous slot ranges, plus a single
//! metadata lock guarding header counters.
//!
//! Each mutator whose home slot is `q` acquires the stripe lock at index
//! `q / STRIPE_SLOTS`, plus the next one, always in ascending order, to
//! accommodate Robin-Hood shifts of up to `CLUSTER_SIZE` slots. There is no
//! blocking: one non-blocking attempt is recorded for telemetry, then a
//! bounded spin using `std::hint::spin_loop`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Slots covered by a single stripe lock.
pub const STRIPE_SLOTS: u64 = 1 << 16;
/// Upper bound on a Robin-Hood shift distance; two adjacent stripes cover
/// any single mutation.
pub const CLUSTER_SIZE: u64 = 1 << 14;

const SPIN_ITERATIONS: u32 = 1 << 20;

/// Whether a given call path should actually acquire locks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockBehavior {
    /// Never take locks (single-threaded, or `LockMode::Forbidden`).
    Skip,
    /// Take locks for this call (`LockMode::Required`, or an `Optional`
    /// call that opted in).
    Take,
}

/// An observer hooked into lock acquisition, for telemetry. Modeled as an
/// optional callback rather than a field on the runtime record, per the
/// design note that `wait_time_data` is telemetry, not functional state.
pub type LockObserver = Arc<dyn Fn(LockEvent) + Send + Sync>;

/// A single lock-acquisition event, passed to a [`LockObserver`].
#[derive(Clone, Copy, Debug)]
pub struct LockEvent {
    /// Index of the stripe lock acquired.
    pub stripe: usize,
    /// Whether the first, non-blocking attempt succeeded.
    pub acquired_on_first_try: bool,
}

/// A single spin-lock stripe.
struct Stripe(AtomicBool);

impl Stripe {
    fn new() -> Self {
        Stripe(AtomicBool::new(false))
    }

    /// One non-blocking attempt; returns whether it succeeded.
    fn try_lock(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn unlock(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The filter's lock table: one stripe per `STRIPE_SLOTS` slots, plus a
/// metadata lock.
pub struct LockTable {
    stripes: Vec<Stripe>,
    metadata_lock: Stripe,
    observer: Option<LockObserver>,
}

/// RAII guard for the (up to) two stripe locks a mutator holds.
pub struct StripeGuard<'a> {
    table: &'a LockTable,
    indices: Vec<usize>,
}

impl<'a> Drop for StripeGuard<'a> {
    fn drop(&mut self) {
        // Release in the reverse order they were acquired.
        for &idx in self.indices.iter().rev() {
            self.table.stripes[idx].unlock();
        }
    }
}

/// RAII guard for the metadata lock.
pub struct MetadataGuard<'a> {
    table: &'a LockTable,
}

impl<'a> Drop for MetadataGuard<'a> {
    fn drop(&mut self) {
        self.table.metadata_lock.unlock();
    }
}

impl LockTable {
    /// Builds a lock table covering `xnslots` physical slots.
    pub fn new(xnslots: u64) -> Self {
        let num_locks = (xnslots + STRIPE_SLOTS - 1) / STRIPE_SLOTS + 1;
        let stripes = (0..num_locks).map(|_| Stripe::new()).collect();
        LockTable {
            stripes,
            metadata_lock: Stripe::new(),
            observer: None,
        }
    }

    /// Attaches a telemetry observer, replacing any previous one.
    pub fn with_observer(mut self, observer: LockObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    fn acquire_stripe(&self, idx: usize) {
        let stripe = &self.stripes[idx];
        let acquired_on_first_try = stripe.try_lock();
        if let Some(observer) = &self.observer {
            observer(LockEvent {
                stripe: idx,
                acquired_on_first_try,
            });
        }
        if acquired_on_first_try {
            return;
        }
        let mut spins = 0u32;
        loop {
            if stripe.try_lock() {
                return;
            }
            std::hint::spin_loop();
            spins += 1;
            debug_assert!(
                spins < SPIN_ITERATIONS,
                "spin-lock stripe {} exceeded bounded spin budget",
                idx
            );
        }
    }

    /// Acquires the two adjacent stripe locks covering the mutation whose
    /// home slot is `home_slot`, in ascending index order. A no-op under
    /// [`LockBehavior::Skip`].
    pub fn lock_cluster(&self, home_slot: u64, behavior: LockBehavior) -> Option<StripeGuard<'_>> {
        if behavior == LockBehavior::Skip || self.stripes.is_empty() {
            return None;
        }
        let first = (home_slot / STRIPE_SLOTS) as usize;
        let last = self.stripes.len() - 1;
        let second = std::cmp::min(first + 1, last);

        self.acquire_stripe(first);
        let mut indices = vec![first];
        if second != first {
            self.acquire_stripe(second);
            indices.push(second);
        }
        Some(StripeGuard {
            table: self,
            indices,
        })
    }

    /// Acquires the metadata lock guarding header counters. A no-op under
    /// [`LockBehavior::Skip`].
    pub fn lock_metadata(&self, behavior: LockBehavior) -> Option<MetadataGuard<'_>> {
        if behavior == LockBehavior::Skip {
            return None;
        }
        self.acquire_stripe_meta();
        Some(MetadataGuard { table: self })
    }

    fn acquire_stripe_meta(&self) {
        let acquired_on_first_try = self.metadata_lock.try_lock();
        if acquired_on_first_try {
            return;
        }
        loop {
            if self.metadata_lock.try_lock() {
                return;
            }
            std::hint::spin_loop();
        }
    }

    /// Number of stripe locks in the table (excludes the metadata lock).
    pub fn num_locks(&self) -> usize {
        self.stripes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_lock_unlock_cycle() {
        let table = LockTable::new(1 << 18);
        {
            let _guard = table.lock_cluster(0, LockBehavior::Take);
        }
        // Lock must be released: re-acquiring should not deadlock.
        let _guard = table.lock_cluster(0, LockBehavior::Take);
    }

    #[test]
    fn test_skip_is_noop() {
        let table = LockTable::new(1 << 18);
        assert!(table.lock_cluster(0, LockBehavior::Skip).is_none());
    }

    #[test]
    fn test_two_adjacent_stripes_locked() {
        let table = LockTable::new(3 * STRIPE_SLOTS);
        let _guard = table.lock_cluster(STRIPE_SLOTS - 1, LockBehavior::Take);
        // Stripe 0 and stripe 1 should both be held; attempting stripe 1
        // again (non-blocking, via a fresh table state check) is covered by
        // the guard's Drop releasing both on scope exit, asserted above by
        // not deadlocking in test_lock_unlock_cycle.
    }

    #[test]
    fn test_observer_invoked() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        let table = LockTable::new(1 << 17).with_observer(Arc::new(move |_event| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        }));
        let _guard = table.lock_cluster(0, LockBehavior::Take);
        assert!(counter.load(Ordering::SeqCst) > 0);
    }
}

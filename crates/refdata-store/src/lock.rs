use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};

/// Cooperative interruption signal for threads blocked on a stream lock.
///
/// Clones share the same flag, so one handle can be given to the waiting
/// thread and another kept by whoever wants to abort it.
#[derive(Clone, Default)]
pub struct InterruptFlag {
    raised: Arc<AtomicBool>,
}

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.raised.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for InterruptFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InterruptFlag({})", self.is_interrupted())
    }
}

struct Stripe {
    held: Mutex<bool>,
    released: Condvar,
}

impl Stripe {
    fn state(&self) -> MutexGuard<'_, bool> {
        // The flag is a plain bool, so a panic elsewhere cannot leave it torn.
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed-size table of exclusive locks, one per stripe.
///
/// Keys hash onto stripes, so the table never grows. Two different keys may
/// share a stripe and then serialize against each other; that costs
/// parallelism but never correctness. Locks are not reentrant.
pub struct StripedLock {
    stripes: Vec<Stripe>,
    poll_interval: Duration,
}

impl StripedLock {
    pub fn new(stripe_count: usize, poll_interval: Duration) -> Self {
        let stripes = (0..stripe_count.max(1))
            .map(|_| Stripe {
                held: Mutex::new(false),
                released: Condvar::new(),
            })
            .collect();
        Self {
            stripes,
            poll_interval,
        }
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    /// Stripe that `key` maps to.
    pub fn stripe_for<K: Hash>(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.stripes.len() as u64) as usize
    }

    /// Block until the stripe for `key` is free, then take it.
    ///
    /// The wait checks `interrupt` every poll interval and gives up with
    /// [`StoreError::Interrupted`] once it is raised, including when it is
    /// already raised on entry.
    pub fn lock_interruptibly<K: Hash + fmt::Display>(
        &self,
        key: &K,
        interrupt: &InterruptFlag,
    ) -> StoreResult<StripeGuard<'_>> {
        let index = self.stripe_for(key);
        let stripe = &self.stripes[index];
        debug!(stripe = index, key = %key, "acquiring stream lock");

        let started = Instant::now();
        let mut held = stripe.state();
        loop {
            if interrupt.is_interrupted() {
                return Err(StoreError::Interrupted(key.to_string()));
            }
            if !*held {
                *held = true;
                break;
            }
            let (next, _) = stripe
                .released
                .wait_timeout(held, self.poll_interval)
                .unwrap_or_else(PoisonError::into_inner);
            held = next;
        }

        let waited = started.elapsed();
        if waited > Duration::from_secs(1) {
            info!(stripe = index, key = %key, waited_ms = waited.as_millis() as u64, "waited for stream lock");
        } else {
            debug!(stripe = index, key = %key, "acquired stream lock");
        }
        Ok(StripeGuard { stripe, index })
    }

    /// Take the stripe for `key` only if it is free right now.
    pub fn try_lock<K: Hash>(&self, key: &K) -> Option<StripeGuard<'_>> {
        let index = self.stripe_for(key);
        let stripe = &self.stripes[index];
        let mut held = stripe.state();
        if *held {
            None
        } else {
            *held = true;
            Some(StripeGuard { stripe, index })
        }
    }
}

impl fmt::Debug for StripedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StripedLock")
            .field("stripes", &self.stripes.len())
            .finish()
    }
}

/// Exclusive hold on one stripe; released on drop.
pub struct StripeGuard<'a> {
    stripe: &'a Stripe,
    index: usize,
}

impl StripeGuard<'_> {
    pub fn stripe(&self) -> usize {
        self.index
    }
}

impl fmt::Debug for StripeGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StripeGuard({})", self.index)
    }
}

impl Drop for StripeGuard<'_> {
    fn drop(&mut self) {
        *self.stripe.state() = false;
        self.stripe.released.notify_one();
        debug!(stripe = self.index, "released stream lock");
    }
}

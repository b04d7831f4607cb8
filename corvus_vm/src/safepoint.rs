//! Stop-the-world coordination.
//!
//! One thread at a time may become the collector. It raises the request
//! flag, then takes the context lock of every other attached thread. A
//! thread running compiled code holds its own lock and gives it up only at
//! a safepoint poll (or while blocked on a monitor or in a blocking native),
//! so once the collector holds every lock all mutators are stopped at
//! scannable states.
//!
//! ```text
//!  collector                      mutator
//!  ─────────                      ───────
//!  try_begin()  requested=true
//!  lock ctx[i] ... (waits)        poll: requested? ─► unlock ctx, park
//!  scan + collect                                     │
//!  finish()     requested=false ─► notify ────────────┘ relock ctx
//! ```

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Stop-the-world request state shared by all threads of a runtime.
#[derive(Default)]
pub struct Safepoint {
    requested: AtomicBool,
    epoch: Mutex<u64>,
    resumed: Condvar,
    /// Completed stop-the-world pauses.
    pauses: AtomicU64,
}

impl Safepoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a collector is waiting for mutators to stop.
    #[inline]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Become the collector. Fails if another thread already is.
    pub fn try_begin(&self) -> bool {
        let won = self
            .requested
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            tracing::trace!("safepoint requested");
        }
        won
    }

    /// End the pause and wake parked mutators.
    pub fn finish(&self) {
        let mut epoch = self.epoch.lock();
        *epoch += 1;
        self.requested.store(false, Ordering::Release);
        self.pauses.fetch_add(1, Ordering::Relaxed);
        drop(epoch);
        self.resumed.notify_all();
        tracing::trace!("safepoint released");
    }

    /// Block until the current pause (if any) is over.
    pub fn park(&self) {
        let mut epoch = self.epoch.lock();
        while self.is_requested() {
            self.resumed.wait(&mut epoch);
        }
    }

    /// Completed pauses.
    #[inline]
    pub fn pauses(&self) -> u64 {
        self.pauses.load(Ordering::Relaxed)
    }
}

//! Attach/detach phases and call admission.
//!
//! Admission is the hot path of every typed call, so it is a pair of atomics:
//! a call bumps the in-flight counter and then reads the phase, detach sets
//! the phase and then reads the counter. Both sides use `SeqCst`, so at
//! least one of them sees the other. The mutex and condition variable are
//! only touched while waiting for a phase change or for calls to drain.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Phase of the proxy module.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Loaded, attach not started.
    NotAttached = 0,
    /// Resolving the genuine library and binding exports.
    Attaching = 1,
    /// Calls are admitted.
    Active = 2,
    /// No new calls are admitted, in-flight ones are draining.
    Detaching = 3,
    /// Terminal. Reached after detach or after a failed attach.
    Unloaded = 4,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Phase::NotAttached,
            1 => Phase::Attaching,
            2 => Phase::Active,
            3 => Phase::Detaching,
            _ => Phase::Unloaded,
        }
    }

    /// Whether calls arriving in this phase may still be admitted later.
    pub fn is_pending(self) -> bool {
        matches!(self, Phase::NotAttached | Phase::Attaching)
    }

    /// Whether this phase is past the end of the proxy's useful life.
    pub fn is_closed(self) -> bool {
        matches!(self, Phase::Detaching | Phase::Unloaded)
    }
}

/// Why a call was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Refusal {
    /// Attach didn't complete within the wait budget.
    Timeout(Duration),
    /// The proxy was not active and won't become so in time.
    Phase(Phase),
}

/// Phase machine plus in-flight call tracking.
#[derive(Debug)]
pub struct Lifecycle {
    phase: AtomicU8,
    in_flight: AtomicUsize,
    lock: Mutex<()>,
    changed: Condvar,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// A lifecycle in [`Phase::NotAttached`].
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(Phase::NotAttached as u8),
            in_flight: AtomicUsize::new(0),
            lock: Mutex::new(()),
            changed: Condvar::new(),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Number of admitted calls that haven't returned yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Move from `from` to `to`. On failure, returns the actual phase.
    pub(crate) fn transition(&self, from: Phase, to: Phase) -> Result<(), Phase> {
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(Phase::from_u8)?;
        self.notify();
        Ok(())
    }

    /// Move to `to` unconditionally.
    pub(crate) fn set(&self, to: Phase) {
        self.phase.store(to as u8, Ordering::SeqCst);
        self.notify();
    }

    fn notify(&self) {
        // Taking the lock orders the notification after any waiter's check.
        let _guard = self.lock.lock();
        self.changed.notify_all();
    }

    /// Admit a call. With `wait`, a call arriving before the proxy is active
    /// blocks for at most that long; without, it's refused immediately.
    pub(crate) fn admit(&self, wait: Option<Duration>) -> Result<CallGuard<'_>, Refusal> {
        let deadline = wait.map(|wait| Instant::now() + wait);

        loop {
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            let phase = self.phase();
            if phase == Phase::Active {
                return Ok(CallGuard(self));
            }
            self.release();

            let (Some(wait), Some(deadline)) = (wait, deadline) else {
                return Err(Refusal::Phase(phase));
            };
            if phase.is_closed() {
                return Err(Refusal::Phase(phase));
            }

            let mut guard = self.lock.lock();
            loop {
                let phase = self.phase();
                if phase == Phase::Active {
                    break;
                }
                if phase.is_closed() {
                    return Err(Refusal::Phase(phase));
                }
                if self.changed.wait_until(&mut guard, deadline).timed_out() {
                    if self.phase() == Phase::Active {
                        break;
                    }
                    return Err(Refusal::Timeout(wait));
                }
            }
        }
    }

    fn release(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 && self.phase() == Phase::Detaching {
            self.notify();
        }
    }

    /// Wait until no admitted call is in flight, at most for `timeout`.
    /// Returns whether all calls drained.
    pub(crate) fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock();
        while self.in_flight() > 0 {
            if self.changed.wait_until(&mut guard, deadline).timed_out() {
                return self.in_flight() == 0;
            }
        }
        true
    }
}

/// Marks an admitted call as in flight until dropped.
#[must_use]
pub(crate) struct CallGuard<'a>(&'a Lifecycle);

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

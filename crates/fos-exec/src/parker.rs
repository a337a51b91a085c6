//! Parking
//!
//! The wait/wake primitive a work queue's owning thread sleeps on.
//! A wake that arrives before the owner parks is kept as a permit, so the
//! next park returns immediately instead of missing it.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// How long a poll may block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollTimeout {
    /// Do not block; just consume a pending wake
    Immediate,
    /// Block for at most this long
    After(Duration),
    /// Block until woken
    Forever,
}

impl PollTimeout {
    pub fn from_millis(millis: u64) -> Self {
        if millis == 0 {
            Self::Immediate
        } else {
            Self::After(Duration::from_millis(millis))
        }
    }
}

/// Condvar-backed parker with a single wake permit
#[derive(Debug, Default)]
pub struct Parker {
    notified: Mutex<bool>,
    condvar: Condvar,
}

impl Parker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block according to `timeout`, consuming the wake permit.
    ///
    /// Returns true if woken rather than timed out.
    pub fn poll_once(&self, timeout: PollTimeout) -> bool {
        let mut notified = self.notified.lock();
        match timeout {
            PollTimeout::Immediate => {}
            PollTimeout::After(duration) => {
                if !*notified {
                    let _ = self.condvar.wait_for(&mut notified, duration);
                }
            }
            PollTimeout::Forever => {
                while !*notified {
                    self.condvar.wait(&mut notified);
                }
            }
        }
        std::mem::replace(&mut *notified, false)
    }

    /// Wake the parked thread, or leave a permit if it is not parked yet
    pub fn wake(&self) {
        let mut notified = self.notified.lock();
        *notified = true;
        self.condvar.notify_one();
    }
}

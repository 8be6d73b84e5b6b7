//! Host-side ledger of the two binary semaphores shared between APIs.
//!
//! Every wait must consume exactly one earlier signal and no semaphore may be
//! signaled twice without a wait in between. The GPU would deadlock or race
//! long before a driver reports anything, so the bridge records each
//! signal/wait here and refuses the operation that would break the
//! alternation.

use std::fmt;

use crate::error::{InteropError, NativeCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRole {
    /// Shared image may be rendered by the legacy API.
    Ready,
    /// Legacy API has finished rendering.
    Complete,
}

impl fmt::Display for SyncRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncRole::Ready => f.write_str("ready"),
            SyncRole::Complete => f.write_str("complete"),
        }
    }
}

/// Counters for one semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncCounts {
    /// Signals issued by frame work.
    pub signals: u64,
    pub waits: u64,
    /// Signals issued outside any frame to seed a fresh semaphore.
    pub primes: u64,
    /// A signal is outstanding.
    pub pending: bool,
}

#[derive(Debug, Default)]
pub struct SyncLedger {
    ready: SyncCounts,
    complete: SyncCounts,
}

impl SyncLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counts(&self, role: SyncRole) -> SyncCounts {
        match role {
            SyncRole::Ready => self.ready,
            SyncRole::Complete => self.complete,
        }
    }

    pub fn signal(&mut self, role: SyncRole) -> Result<(), InteropError> {
        let counts = self.slot(role);
        if counts.pending {
            return Err(violation(role, "signaled twice without a wait"));
        }
        counts.pending = true;
        counts.signals += 1;
        Ok(())
    }

    pub fn prime(&mut self, role: SyncRole) -> Result<(), InteropError> {
        let counts = self.slot(role);
        if counts.pending {
            return Err(violation(role, "primed while a signal is pending"));
        }
        counts.pending = true;
        counts.primes += 1;
        Ok(())
    }

    pub fn wait(&mut self, role: SyncRole) -> Result<(), InteropError> {
        let counts = self.slot(role);
        if !counts.pending {
            return Err(violation(role, "waited without a pending signal"));
        }
        counts.pending = false;
        counts.waits += 1;
        Ok(())
    }

    /// Fresh semaphores replaced the old pair; outstanding signals died with
    /// them.
    pub fn rebind(&mut self) {
        self.ready.pending = false;
        self.complete.pending = false;
    }

    fn slot(&mut self, role: SyncRole) -> &mut SyncCounts {
        match role {
            SyncRole::Ready => &mut self.ready,
            SyncRole::Complete => &mut self.complete,
        }
    }
}

fn violation(role: SyncRole, what: &str) -> InteropError {
    InteropError::native(format!("{role} semaphore {what}"), NativeCode::None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primed_frame_cycle() {
        let mut ledger = SyncLedger::new();
        ledger.prime(SyncRole::Ready).unwrap();
        for _ in 0..3 {
            ledger.wait(SyncRole::Ready).unwrap();
            ledger.signal(SyncRole::Complete).unwrap();
            ledger.wait(SyncRole::Complete).unwrap();
            ledger.signal(SyncRole::Ready).unwrap();
        }
        let ready = ledger.counts(SyncRole::Ready);
        assert_eq!((ready.signals, ready.waits, ready.primes), (3, 3, 1));
        assert!(ready.pending);
        let complete = ledger.counts(SyncRole::Complete);
        assert_eq!((complete.signals, complete.waits), (3, 3));
        assert!(!complete.pending);
    }

    #[test]
    fn double_signal_is_refused() {
        let mut ledger = SyncLedger::new();
        ledger.signal(SyncRole::Complete).unwrap();
        assert!(ledger.signal(SyncRole::Complete).is_err());
        assert_eq!(ledger.counts(SyncRole::Complete).signals, 1);
    }

    #[test]
    fn wait_without_signal_is_refused() {
        let mut ledger = SyncLedger::new();
        assert!(ledger.wait(SyncRole::Ready).is_err());
    }

    #[test]
    fn rebind_drops_pending_signals() {
        let mut ledger = SyncLedger::new();
        ledger.prime(SyncRole::Ready).unwrap();
        ledger.rebind();
        ledger.prime(SyncRole::Ready).unwrap();
        assert_eq!(ledger.counts(SyncRole::Ready).primes, 2);
    }
}

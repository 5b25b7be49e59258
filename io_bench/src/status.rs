//! Process-wide run status latch.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Terminal state of a benchmark run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunStatus {
    Ok = 0,
    ConnRetriesExceeded = 1,
    RuntimeExceeded = 2,
    TerminateSignaled = 3,
}

impl RunStatus {
    /// Human-readable status string.
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Ok => "OK",
            RunStatus::ConnRetriesExceeded => "connection retries exceeded",
            RunStatus::RuntimeExceeded => "run-time exceeded",
            RunStatus::TerminateSignaled => "run-time terminated by signal",
        }
    }

    fn from_u8(v: u8) -> RunStatus {
        match v {
            1 => RunStatus::ConnRetriesExceeded,
            2 => RunStatus::RuntimeExceeded,
            3 => RunStatus::TerminateSignaled,
            _ => RunStatus::Ok,
        }
    }
}

/// Shared termination flag.
///
/// The only cross-context state in the whole process: the signal handler
/// stores one value, the engines read it each iteration. Relaxed
/// ordering is enough because the value only ever transitions from `Ok`
/// to one terminal value.
#[derive(Clone)]
pub struct StatusLatch(Arc<AtomicU8>);

impl StatusLatch {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(RunStatus::Ok as u8)))
    }

    #[inline]
    pub fn get(&self) -> RunStatus {
        RunStatus::from_u8(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set(&self, status: RunStatus) {
        self.0.store(status as u8, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.get() == RunStatus::Ok
    }
}

impl Default for StatusLatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latch_transitions() {
        let latch = StatusLatch::new();
        assert!(latch.is_ok());
        assert_eq!(latch.get(), RunStatus::Ok);

        latch.set(RunStatus::RuntimeExceeded);
        assert!(!latch.is_ok());
        assert_eq!(latch.get(), RunStatus::RuntimeExceeded);

        let clone = latch.clone();
        clone.set(RunStatus::TerminateSignaled);
        assert_eq!(latch.get(), RunStatus::TerminateSignaled);
    }
}

//! Kernel Performance Counters
//!
//! Based on Mach4 kern/counters.h/c by CMU (1987-1991)
//!
//! Counters used by the VM fault path, plus the fault-accounting sink
//! through which the fault engine charges major and minor faults to the
//! execution context that took them.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::kern::sched_prim::ThreadId;

// ============================================================================
// Counter Type
// ============================================================================

/// Mach counter type (atomically updated)
#[derive(Debug)]
pub struct MachCounter {
    value: AtomicU64,
    name: &'static str,
}

impl MachCounter {
    /// Create a new counter
    pub const fn new(name: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
        }
    }

    /// Increment counter by 1
    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment counter by n
    #[inline]
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get current value
    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Reset to zero
    #[inline]
    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }

    /// Get counter name
    pub fn name(&self) -> &'static str {
        self.name
    }
}

// ============================================================================
// Fault Accounting
// ============================================================================

/// How a resolved fault is charged to the faulting context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The fault needed pager I/O
    Major,
    /// The fault was satisfied from memory
    Minor,
}

/// Sink for per-context major/minor fault counts (the `ru_majflt` /
/// `ru_minflt` analogue). Implemented by whoever owns process accounting.
pub trait FaultAccounting: Send + Sync {
    /// Charge one fault of `kind` to `thread`
    fn account(&self, thread: ThreadId, kind: FaultKind);
}

/// Accounting sink that only keeps global totals
#[derive(Debug)]
pub struct FaultTotals {
    pub major: MachCounter,
    pub minor: MachCounter,
}

impl FaultTotals {
    pub const fn new() -> Self {
        Self {
            major: MachCounter::new("major_faults"),
            minor: MachCounter::new("minor_faults"),
        }
    }
}

impl Default for FaultTotals {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultAccounting for FaultTotals {
    fn account(&self, _thread: ThreadId, kind: FaultKind) {
        match kind {
            FaultKind::Major => self.major.inc(),
            FaultKind::Minor => self.minor.inc(),
        }
    }
}

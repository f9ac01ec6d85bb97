//! Kern subsystem - Core kernel primitives
//!
//! Based on Mach4 kern/ directory
//! Contains the scheduling and accounting services the VM system consumes.

pub mod counters;
pub mod sched_prim;

pub use counters::{FaultAccounting, FaultKind, FaultTotals, MachCounter};
pub use sched_prim::{Scheduler, SpinScheduler, ThreadId, WaitEvent};
